//! Experiment tracking bridge. Tracking is logging, not state: failures
//! are counted and shed, never propagated into the search.

use govern_resilience::{CircuitBreaker, ResilienceError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::Result;
use crate::search::Candidate;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingId(pub String);

pub trait ExperimentTracker: Send + Sync {
    fn record(&self, candidate: &Candidate) -> Result<TrackingId>;
}

/// Writes each candidate as a structured log event.
#[derive(Debug, Default)]
pub struct LogTracker;

impl ExperimentTracker for LogTracker {
    fn record(&self, candidate: &Candidate) -> Result<TrackingId> {
        let id = TrackingId(uuid::Uuid::new_v4().to_string());
        info!(
            tracking_id = %id.0,
            candidate_id = %candidate.candidate_id,
            search_id = %candidate.search_id,
            iteration = candidate.iteration,
            metrics = ?candidate.metrics,
            hyperparameters = %serde_json::to_string(&candidate.hyperparameters).unwrap_or_default(),
            "candidate recorded"
        );
        Ok(id)
    }
}

/// Fire-and-forget wrapper guarded by a circuit breaker.
pub struct GuardedTracker {
    inner: Arc<dyn ExperimentTracker>,
    breaker: CircuitBreaker,
}

impl GuardedTracker {
    pub fn new(inner: Arc<dyn ExperimentTracker>) -> Self {
        Self { inner, breaker: CircuitBreaker::new("experiment-tracker", 3, Duration::from_secs(30)) }
    }

    pub fn record(&self, candidate: &Candidate) -> Option<TrackingId> {
        match self.breaker.call(|| self.inner.record(candidate)) {
            Ok(id) => Some(id),
            Err(ResilienceError::CircuitOpen) => None,
            Err(ResilienceError::Inner(e)) => {
                warn!(error = %e, candidate_id = %candidate.candidate_id, "experiment tracker rejected candidate");
                None
            }
        }
    }
}
