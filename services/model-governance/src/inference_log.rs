//! Bounded request/response log written by the serving path and drained by
//! the drift monitor. When full the oldest entry is evicted and counted.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use opentelemetry::metrics::ObservableGauge;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::schema::Record;
use crate::telemetry::governance_metrics;

static LOG_DEPTH: AtomicU64 = AtomicU64::new(0);
static LOG_DEPTH_GAUGE: Lazy<ObservableGauge<u64>> = Lazy::new(|| {
    opentelemetry::global::meter("attrition_governance")
        .u64_observable_gauge("governance_inference_log_depth")
        .with_description("Inference entries waiting for a drift window")
        .with_callback(|obs| obs.observe(LOG_DEPTH.load(Ordering::Relaxed), &[]))
        .build()
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceEntry {
    pub model_version: u64,
    pub features: Record,
    pub probability: f64,
    pub prediction: bool,
    pub at: DateTime<Utc>,
}

impl InferenceEntry {
    pub fn new(model_version: u64, features: Record, probability: f64, prediction: bool) -> Self {
        Self { model_version, features, probability, prediction, at: Utc::now() }
    }
}

pub struct InferenceLog {
    entries: Mutex<VecDeque<InferenceEntry>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl InferenceLog {
    pub fn new(capacity: usize) -> Self {
        Lazy::force(&LOG_DEPTH_GAUGE);
        Self { entries: Mutex::new(VecDeque::with_capacity(capacity.min(65_536))), capacity: capacity.max(1), dropped: AtomicU64::new(0) }
    }

    pub fn push(&self, entry: InferenceEntry) {
        let mut q = self.entries.lock();
        if q.len() >= self.capacity {
            q.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            governance_metrics().inference_log_dropped_total.add(1, &[]);
        }
        q.push_back(entry);
        LOG_DEPTH.store(q.len() as u64, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize { self.entries.lock().len() }
    pub fn is_empty(&self) -> bool { self.entries.lock().is_empty() }
    pub fn dropped(&self) -> u64 { self.dropped.load(Ordering::Relaxed) }

    /// Drain up to `max` of the oldest entries served by `version`, once at
    /// least `min` of them are buffered. Entries from older versions are
    /// discarded since they cannot be compared against this reference.
    /// Entries from newer versions stay queued for the next reference.
    pub fn take_window(&self, version: Option<u64>, min: usize, max: usize) -> Option<Vec<InferenceEntry>> {
        let mut q = self.entries.lock();
        let Some(v) = version else {
            let taken = if q.len() < min.max(1) {
                None
            } else {
                let take = max.max(1).min(q.len());
                Some(q.drain(..take).collect())
            };
            LOG_DEPTH.store(q.len() as u64, Ordering::Relaxed);
            return taken;
        };

        let before = q.len();
        q.retain(|e| e.model_version >= v);
        if q.len() < before { debug!(discarded = before - q.len(), version = v, "stale inference entries discarded"); }
        let matching = q.iter().filter(|e| e.model_version == v).count();
        let taken = if matching < min.max(1) {
            None
        } else {
            let take = max.max(1).min(matching);
            let mut window = Vec::with_capacity(take);
            let mut rest = VecDeque::with_capacity(q.len() - take);
            for e in q.drain(..) {
                if e.model_version == v && window.len() < take { window.push(e) } else { rest.push_back(e) }
            }
            *q = rest;
            Some(window)
        };
        LOG_DEPTH.store(q.len() as u64, Ordering::Relaxed);
        taken
    }
}
