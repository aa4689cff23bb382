//! Candidate search: sample hyperparameters, train and score candidates in
//! parallel rounds, and rank them by the primary metric.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::artifacts::{ArtifactHandle, ArtifactStore};
use crate::error::{GovernanceError, Result};
use crate::metrics::{self, MetricName};
use crate::model::{FeatureEncoder, Hyperparameters, SearchSpace, TrainedModel, Trainer};
use crate::schema::Dataset;
use crate::telemetry::governance_metrics;
use crate::tracker::GuardedTracker;

/// One trained and scored model. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate_id: String,
    pub search_id: Uuid,
    pub trainer: String,
    pub iteration: usize,
    pub hyperparameters: Hyperparameters,
    pub artifact: ArtifactHandle,
    pub metrics: BTreeMap<String, f64>,
    pub created_at: DateTime<Utc>,
}

impl Candidate {
    pub fn metric(&self, name: MetricName) -> Option<f64> { self.metrics.get(name.as_str()).copied() }
}

fn fingerprint(search_id: &Uuid, iteration: usize, hp: &Hyperparameters) -> String {
    let mut h = Sha256::new();
    h.update(search_id.as_bytes());
    h.update((iteration as u64).to_le_bytes());
    h.update(serde_json::to_vec(hp).unwrap_or_default());
    format!("cand-{}", &hex::encode(h.finalize())[..16])
}

/// Sort by `metric` descending, earlier iteration first on ties. Missing or
/// NaN scores rank last.
pub fn rank(candidates: &mut [Candidate], metric: MetricName) {
    let key = |c: &Candidate| c.metric(metric).filter(|v| !v.is_nan()).unwrap_or(f64::NEG_INFINITY);
    candidates.sort_by(|a, b| key(b).total_cmp(&key(a)).then_with(|| a.iteration.cmp(&b.iteration)));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub max_iterations: usize,
    pub max_duration: Option<Duration>,
}

impl Budget {
    pub fn iterations(max_iterations: usize) -> Self { Self { max_iterations, max_duration: None } }
    pub fn with_deadline(mut self, d: Duration) -> Self { self.max_duration = Some(d); self }

    fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 { return Err(GovernanceError::InvalidInput("search budget must allow at least one iteration".into())); }
        if self.max_duration.is_some_and(|d| d.is_zero()) { return Err(GovernanceError::InvalidInput("search time budget must be positive".into())); }
        Ok(())
    }
}

/// Cooperative cancellation shared between the caller and a running search.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self { Self::default() }
    pub fn cancel(&self) { self.0.store(true, Ordering::SeqCst); }
    pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::SeqCst) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Every planned iteration was evaluated.
    Exhausted,
    /// No meaningful improvement for `patience` rounds.
    Converged,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchReport {
    pub search_id: Uuid,
    pub candidates: Vec<Candidate>,
    pub termination: Termination,
    pub evaluated: usize,
    pub failed: usize,
    pub elapsed_ms: f64,
}

impl SearchReport {
    pub fn best(&self) -> Option<&Candidate> { self.candidates.first() }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub primary_metric: MetricName,
    pub min_rows: usize,
    pub seed: u64,
    pub validation_fraction: f64,
    /// Candidates evaluated concurrently per round.
    pub parallelism: usize,
    /// Rounds without improvement before the search counts as converged.
    pub patience: Option<usize>,
    pub min_improvement: f64,
    pub max_iterations: usize,
    pub max_duration_secs: Option<u64>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            primary_metric: MetricName::F1,
            min_rows: 50,
            seed: 42,
            validation_fraction: 0.25,
            parallelism: 4,
            patience: None,
            min_improvement: 1e-4,
            max_iterations: 32,
            max_duration_secs: Some(300),
        }
    }
}

impl SearchSettings {
    pub fn budget(&self) -> Budget {
        Budget { max_iterations: self.max_iterations, max_duration: self.max_duration_secs.map(Duration::from_secs) }
    }
}

pub struct SearchEngine {
    trainer: Arc<dyn Trainer>,
    artifacts: Arc<dyn ArtifactStore>,
    tracker: Option<Arc<GuardedTracker>>,
    space: SearchSpace,
    settings: SearchSettings,
}

struct Prepared {
    search_id: Uuid,
    encoder: Arc<FeatureEncoder>,
    x_train: Vec<Vec<f64>>,
    y_train: Vec<bool>,
    x_valid: Vec<Vec<f64>>,
    y_valid: Vec<bool>,
}

impl SearchEngine {
    pub fn new(trainer: Arc<dyn Trainer>, artifacts: Arc<dyn ArtifactStore>, settings: SearchSettings) -> Self {
        let space = trainer.search_space();
        Self { trainer, artifacts, tracker: None, space, settings }
    }

    pub fn with_tracker(mut self, tracker: Arc<GuardedTracker>) -> Self { self.tracker = Some(tracker); self }

    /// Run one search over `data` within `budget`.
    ///
    /// A time budget that runs out before the planned iterations finish (and
    /// before convergence) yields [`GovernanceError::SearchTimeout`] carrying
    /// the ranked candidates found so far. Cancellation returns `Ok` with
    /// [`Termination::Cancelled`].
    #[instrument(skip(self, data, cancel), fields(rows = data.len(), iterations = budget.max_iterations))]
    pub fn search(&self, data: &Dataset, budget: Budget, cancel: &CancelToken) -> Result<SearchReport> {
        budget.validate()?;
        if data.len() < self.settings.min_rows {
            return Err(GovernanceError::InsufficientData { rows: data.len(), min_rows: self.settings.min_rows });
        }
        let start = Instant::now();
        let deadline = budget.max_duration.map(|d| start + d);
        governance_metrics().searches_total.add(1, &[]);
        let prep = self.prepare(data)?;
        info!(search_id = %prep.search_id, trainer = self.trainer.name(), "search started");

        let round = self.settings.parallelism.max(1);
        let metric = self.settings.primary_metric;
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut failed = 0usize;
        let mut next = 0usize;
        let mut stale_rounds = 0usize;
        let mut best = f64::NEG_INFINITY;
        let mut timed_out = false;
        let termination = loop {
            if next >= budget.max_iterations { break Termination::Exhausted; }
            if cancel.is_cancelled() { break Termination::Cancelled; }
            if deadline.is_some_and(|d| Instant::now() >= d) { timed_out = true; break Termination::Exhausted; }

            let end = (next + round).min(budget.max_iterations);
            let results: Vec<(usize, Result<Candidate>)> = (next..end).into_par_iter()
                .filter(|_| !cancel.is_cancelled() && !deadline.is_some_and(|d| Instant::now() >= d))
                .map(|i| (i, self.evaluate(&prep, i)))
                .collect();
            let cut_short = results.len() < end - next;
            next = end;

            let before = best;
            for (i, res) in results {
                match res {
                    Ok(c) => {
                        governance_metrics().candidates_evaluated_total.add(1, &[]);
                        if let Some(t) = &self.tracker { t.record(&c); }
                        best = best.max(c.metric(metric).unwrap_or(f64::NEG_INFINITY));
                        candidates.push(c);
                    }
                    Err(e) => {
                        governance_metrics().candidates_failed_total.add(1, &[]);
                        failed += 1;
                        warn!(iteration = i, error = %e, "candidate evaluation failed");
                    }
                }
            }
            if best > before + self.settings.min_improvement { stale_rounds = 0; } else { stale_rounds += 1; }
            debug!(evaluated = candidates.len(), best, stale_rounds, "search round complete");
            if cut_short && !cancel.is_cancelled() { timed_out = true; break Termination::Exhausted; }
            if self.settings.patience.is_some_and(|p| stale_rounds >= p) { break Termination::Converged; }
        };

        rank(&mut candidates, metric);
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        governance_metrics().search_latency_ms.record(elapsed_ms, &[]);
        let evaluated = candidates.len() + failed;
        if timed_out {
            warn!(search_id = %prep.search_id, evaluated, "search time budget exhausted");
            return Err(GovernanceError::SearchTimeout { evaluated, best_so_far: candidates });
        }
        if candidates.is_empty() && termination != Termination::Cancelled {
            return Err(GovernanceError::Training(format!("all {failed} candidate evaluation(s) failed")));
        }
        info!(search_id = %prep.search_id, ?termination, evaluated, best = candidates.first().and_then(|c| c.metric(metric)), "search finished");
        Ok(SearchReport { search_id: prep.search_id, candidates, termination, evaluated, failed, elapsed_ms })
    }

    fn prepare(&self, data: &Dataset) -> Result<Prepared> {
        let (train, valid) = data.split(self.settings.validation_fraction, self.settings.seed)?;
        let encoder = Arc::new(FeatureEncoder::fit(&train));
        Ok(Prepared {
            search_id: Uuid::new_v4(),
            x_train: encoder.encode_all(&train),
            y_train: train.labels(),
            x_valid: encoder.encode_all(&valid),
            y_valid: valid.labels(),
            encoder,
        })
    }

    fn evaluate(&self, prep: &Prepared, iteration: usize) -> Result<Candidate> {
        let hp = self.space.sample(self.settings.seed, iteration);
        let predictor = self.trainer.fit(&prep.x_train, &prep.y_train, &hp)?;
        let probs: Vec<f64> = prep.x_valid.iter().map(|x| predictor.predict_proba(x)).collect();
        let model = TrainedModel::new(prep.encoder.clone(), predictor);
        let metrics = metrics::score(&prep.y_valid, &probs, model.threshold);
        let artifact = self.artifacts.save(Arc::new(model))?;
        Ok(Candidate {
            candidate_id: fingerprint(&prep.search_id, iteration, &hp),
            search_id: prep.search_id,
            trainer: self.trainer.name().to_string(),
            iteration,
            hyperparameters: hp,
            artifact,
            metrics,
            created_at: Utc::now(),
        })
    }
}
