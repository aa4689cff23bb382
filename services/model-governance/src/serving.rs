//! Prediction handler logic behind the HTTP boundary.
//!
//! The façade follows the registry's active pointer. When the active
//! version changes it loads the new artifact and asks for a re-audit; if
//! the load fails it keeps answering with the model it already has.

use arc_swap::ArcSwapOption;
use govern_resilience::{CircuitBreaker, ResilienceError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::artifacts::ArtifactStore;
use crate::drift::{DriftStatusHandle, Verdict};
use crate::error::{GovernanceError, Result};
use crate::inference_log::{InferenceEntry, InferenceLog};
use crate::model::TrainedModel;
use crate::registry::{ModelRegistry, ModelVersion};
use crate::schema::{FeatureSchema, JsonRecord};
use crate::settings::ServingSettings;
use crate::telemetry::governance_metrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    pub prediction: bool,
    pub probability: f64,
    pub model_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub active_version: Option<u64>,
    /// Version actually answering requests; lags `active_version` only
    /// while a newly promoted artifact cannot be loaded.
    pub serving_version: Option<u64>,
    pub last_drift_verdict: Option<Verdict>,
}

/// Emitted once per newly loaded active version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReauditRequest {
    pub version_id: u64,
    pub candidate_id: String,
}

struct Loaded {
    version: Arc<ModelVersion>,
    model: Arc<TrainedModel>,
}

pub struct ServingFacade {
    registry: Arc<ModelRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    schema: Arc<FeatureSchema>,
    log: Arc<InferenceLog>,
    drift: DriftStatusHandle,
    loaded: ArcSwapOption<Loaded>,
    reload: Mutex<()>,
    load_breaker: CircuitBreaker,
    reaudit: broadcast::Sender<ReauditRequest>,
}

impl ServingFacade {
    pub fn new(
        registry: Arc<ModelRegistry>,
        artifacts: Arc<dyn ArtifactStore>,
        schema: Arc<FeatureSchema>,
        log: Arc<InferenceLog>,
        drift: DriftStatusHandle,
        settings: &ServingSettings,
    ) -> Self {
        let (reaudit, _) = broadcast::channel(16);
        Self {
            registry,
            artifacts,
            schema,
            log,
            drift,
            loaded: ArcSwapOption::empty(),
            reload: Mutex::new(()),
            load_breaker: CircuitBreaker::new("artifact-load", settings.load_failure_threshold.max(1), Duration::from_secs(settings.load_retry_secs)),
            reaudit,
        }
    }

    pub fn subscribe_reaudit(&self) -> broadcast::Receiver<ReauditRequest> { self.reaudit.subscribe() }

    /// Bring the loaded model in line with the registry. Returns the version
    /// now serving, which is the previous one if loading failed.
    pub fn refresh(&self) -> Option<u64> {
        let active = self.registry.get_active();
        let current = self.loaded.load_full();
        let (Some(active), current_id) = (active, current.as_ref().map(|l| l.version.version_id)) else {
            return current.map(|l| l.version.version_id);
        };
        if current_id == Some(active.version_id) { return current_id; }

        let _guard = self.reload.lock();
        if let Some(l) = self.loaded.load_full().filter(|l| l.version.version_id == active.version_id) {
            return Some(l.version.version_id);
        }
        match self.load_breaker.call(|| self.artifacts.load(&active.artifact)) {
            Ok(model) => {
                info!(version_id = active.version_id, previous = ?current_id, "serving model switched");
                let _ = self.reaudit.send(ReauditRequest { version_id: active.version_id, candidate_id: active.candidate_id.clone() });
                self.loaded.store(Some(Arc::new(Loaded { version: active.clone(), model })));
                Some(active.version_id)
            }
            Err(ResilienceError::CircuitOpen) => current_id,
            Err(ResilienceError::Inner(e)) => {
                warn!(error = %e, version_id = active.version_id, serving = ?current_id, "active artifact failed to load; keeping last-known-good model");
                current_id
            }
        }
    }

    #[tracing::instrument(skip_all)]
    pub fn predict(&self, raw: &JsonRecord) -> Result<PredictResponse> {
        let start = Instant::now();
        let out = self.predict_inner(raw);
        governance_metrics().prediction_latency_ms.record(start.elapsed().as_secs_f64() * 1000.0, &[]);
        match &out {
            Ok(_) => governance_metrics().predictions_total.add(1, &[]),
            Err(e) => {
                governance_metrics().prediction_errors_total.add(1, &[]);
                warn!(error = %e, "prediction rejected");
            }
        }
        out
    }

    fn predict_inner(&self, raw: &JsonRecord) -> Result<PredictResponse> {
        let record = self.schema.parse_record(raw, true)?;
        self.refresh();
        let loaded = self.loaded.load_full().ok_or(GovernanceError::NoActiveModel)?;
        let probability = loaded.model.predict_proba(&record);
        let prediction = probability >= loaded.model.threshold;
        let model_version = loaded.version.version_id;
        self.log.push(InferenceEntry::new(model_version, record, probability, prediction));
        Ok(PredictResponse { prediction, probability, model_version })
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            active_version: self.registry.get_active().map(|v| v.version_id),
            serving_version: self.loaded.load_full().map(|l| l.version.version_id),
            last_drift_verdict: self.drift.last_verdict(),
        }
    }
}
