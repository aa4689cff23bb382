//! Governed lifecycle for an employee attrition classifier: candidate
//! search, fairness auditing, gated promotion into a versioned registry,
//! prediction serving and drift monitoring.

pub mod artifacts;
pub mod audit;
pub mod drift;
pub mod error;
pub mod gate;
pub mod http;
pub mod inference_log;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod schema;
pub mod search;
pub mod serving;
pub mod settings;
pub mod store;
pub mod telemetry;
pub mod tracker;

#[cfg(test)]
mod testing;

pub use audit::{FairnessAuditor, FairnessReport};
pub use drift::{DriftMonitor, DriftReport, ReferenceSnapshot, RetrainTrigger, Verdict};
pub use error::{AuditDataError, GovernanceError, Result};
pub use gate::{PromotionRejected, PromotionThresholds};
pub use orchestrator::{CycleOutcome, CycleReport, Orchestrator, ReauditOutcome};
pub use registry::{ModelRegistry, ModelStatus, ModelVersion, PromotionOutcome};
pub use schema::{Dataset, FeatureSchema};
pub use search::{Budget, CancelToken, Candidate, SearchEngine, SearchReport};
pub use serving::ServingFacade;
pub use settings::GovernanceConfig;
