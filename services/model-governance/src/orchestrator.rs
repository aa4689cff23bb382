//! One governance cycle: clean, split, search, audit the leaders, promote
//! the first that clears the gate, and install its drift reference.
//!
//! Cycles are serialized; the drift monitor and serving façade run beside
//! them and only meet the cycle through the registry and the reference
//! snapshot.

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use opentelemetry::metrics::Histogram;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::artifacts::ArtifactStore;
use crate::audit::FairnessAuditor;
use crate::drift::{DriftMonitor, ReferenceSnapshot, Verdict};
use crate::error::{AuditDataError, GovernanceError, Result};
use crate::gate::{self, PromotionRejected, RejectionReason};
use crate::lifecycle::{DeploymentLifecycle, DeploymentPhase};
use crate::model::Trainer;
use crate::registry::{ModelRegistry, ModelVersion, PromotionOutcome};
use crate::schema::{CleaningSummary, Dataset};
use crate::search::{CancelToken, Candidate, SearchEngine, Termination};
use crate::serving::ReauditRequest;
use crate::settings::GovernanceConfig;
use crate::store::GovernanceStore;
use crate::telemetry::governance_metrics;
use crate::tracker::GuardedTracker;

static STAGE_LAT_HISTO: Lazy<Histogram<f64>> = Lazy::new(|| {
    opentelemetry::global::meter("attrition_governance")
        .f64_histogram("governance_cycle_stage_latency_ms")
        .with_description("Latency per governance cycle stage (ms)")
        .with_unit("ms")
        .build()
});

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageLatencies { pub clean_ms: f64, pub search_ms: f64, pub audit_ms: f64, pub promote_ms: f64, pub snapshot_ms: f64, pub total_ms: f64 }

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Promoted(Arc<ModelVersion>),
    /// The active version already came from the winning candidate.
    AlreadyActive(Arc<ModelVersion>),
    /// Every audited candidate was rejected or blocked.
    Rejected { rejections: Vec<PromotionRejected>, blocked: Vec<AuditDataError> },
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub search_id: Option<Uuid>,
    /// `None` when the search ran out of time and the partial ranking was used.
    pub termination: Option<Termination>,
    pub candidates: usize,
    pub audited: Vec<String>,
    pub cleaning: CleaningSummary,
    pub outcome: CycleOutcome,
    pub phase: DeploymentPhase,
    pub latency: StageLatencies,
}

impl CycleReport {
    pub fn promoted(&self) -> Option<&Arc<ModelVersion>> {
        match &self.outcome { CycleOutcome::Promoted(v) => Some(v), _ => None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportSource {
    /// Audited again against the latest cycle's holdout.
    Fresh,
    /// The report stored when the version was promoted.
    Stored,
}

/// A serving version checked against the thresholds in force now.
#[derive(Debug, Clone)]
pub struct ReauditOutcome {
    pub version_id: u64,
    pub candidate_id: String,
    pub source: ReportSource,
    pub max_disparity: Option<f64>,
    pub violations: Vec<RejectionReason>,
}

impl ReauditOutcome {
    pub fn passed(&self) -> bool { self.violations.is_empty() }
}

struct Phases {
    /// The version being served and its lifecycle since promotion.
    serving: Option<(u64, DeploymentLifecycle)>,
    last_drift_window: Option<String>,
}

fn ms(since: Instant) -> f64 { since.elapsed().as_secs_f64() * 1000.0 }

fn record_stage(stage: &'static str, value: f64) { STAGE_LAT_HISTO.record(value, &[KeyValue::new("stage", stage)]); }

pub struct Orchestrator {
    config: Arc<ArcSwap<GovernanceConfig>>,
    trainer: Arc<dyn Trainer>,
    artifacts: Arc<dyn ArtifactStore>,
    tracker: Option<Arc<GuardedTracker>>,
    registry: Arc<ModelRegistry>,
    monitor: Arc<DriftMonitor>,
    store: Option<GovernanceStore>,
    phases: Mutex<Phases>,
    /// Holdout of the latest cycle, reused for re-audits.
    holdout: Mutex<Option<Arc<Dataset>>>,
    cycle: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<ArcSwap<GovernanceConfig>>,
        trainer: Arc<dyn Trainer>,
        artifacts: Arc<dyn ArtifactStore>,
        registry: Arc<ModelRegistry>,
        monitor: Arc<DriftMonitor>,
        store: Option<GovernanceStore>,
    ) -> Self {
        // A version recovered from the log resumes as Active.
        let serving = registry.get_active().map(|v| {
            let mut lc = DeploymentLifecycle::new();
            for p in [DeploymentPhase::Auditing, DeploymentPhase::Promoted, DeploymentPhase::Active] { let _ = lc.advance(p); }
            (v.version_id, lc)
        });
        Self {
            config, trainer, artifacts, tracker: None, registry, monitor, store,
            phases: Mutex::new(Phases { serving, last_drift_window: None }),
            holdout: Mutex::new(None),
            cycle: Mutex::new(()),
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<GuardedTracker>) -> Self { self.tracker = Some(tracker); self }

    /// Lifecycle phase of the serving version, folding in the latest drift
    /// verdict for it.
    pub fn serving_phase(&self) -> Option<(u64, DeploymentPhase)> {
        let mut phases = self.phases.lock();
        self.sync_drift(&mut phases);
        phases.serving.as_ref().map(|(v, lc)| (*v, lc.phase()))
    }

    fn sync_drift(&self, phases: &mut Phases) {
        let Some(report) = self.monitor.status().last() else { return };
        if phases.last_drift_window.as_deref() == Some(report.window_id.as_str()) { return; }
        phases.last_drift_window = Some(report.window_id.clone());
        let Some((version_id, lc)) = phases.serving.as_mut() else { return };
        if report.version_id != Some(*version_id) { return; }
        let next = match report.verdict { Verdict::Stable => DeploymentPhase::Stable, Verdict::Drifted => DeploymentPhase::Drifted };
        if let Err(e) = lc.advance(next) { debug!(error = %e, version_id = *version_id, "drift verdict does not change phase"); }
    }

    /// Run one full cycle over `data`. Cancellation stops the search early;
    /// whatever it ranked so far still goes through the audit and gate.
    #[instrument(skip_all, fields(rows = data.len()))]
    pub fn run_cycle(&self, data: &Dataset, cancel: &CancelToken) -> Result<CycleReport> {
        let _running = self.cycle.lock();
        let cfg = self.config.load_full();
        let start = Instant::now();
        let mut lat = StageLatencies::default();
        let mut lifecycle = DeploymentLifecycle::new();
        {
            let mut phases = self.phases.lock();
            self.sync_drift(&mut phases);
        }

        let s = Instant::now();
        let (cleaned, cleaning) = data.clean();
        let (train, holdout) = cleaned.split(cfg.audit.holdout_fraction, cfg.search.seed)?;
        let holdout = Arc::new(holdout);
        *self.holdout.lock() = Some(holdout.clone());
        lat.clean_ms = ms(s);
        record_stage("clean", lat.clean_ms);

        let s = Instant::now();
        let mut engine = SearchEngine::new(self.trainer.clone(), self.artifacts.clone(), cfg.search.clone());
        if let Some(t) = &self.tracker { engine = engine.with_tracker(t.clone()); }
        let (search_id, termination, ranked) = match engine.search(&train, cfg.search.budget(), cancel) {
            Ok(report) => (Some(report.search_id), Some(report.termination), report.candidates),
            Err(GovernanceError::SearchTimeout { evaluated, best_so_far }) => {
                warn!(evaluated, kept = best_so_far.len(), "search timed out; auditing partial ranking");
                (best_so_far.first().map(|c| c.search_id), None, best_so_far)
            }
            Err(e) => return Err(e),
        };
        lat.search_ms = ms(s);
        record_stage("search", lat.search_ms);

        let candidates = ranked.len();
        let leaders: Vec<&Candidate> = ranked.iter().take(cfg.audit.candidates_to_audit.max(1)).collect();
        let auditor = FairnessAuditor::new(self.artifacts.clone(), cfg.audit.clone());
        let thresholds = cfg.promotion_thresholds();
        lifecycle.advance(if leaders.is_empty() { DeploymentPhase::Rejected } else { DeploymentPhase::Auditing })?;

        let mut audited = Vec::new();
        let mut rejections = Vec::new();
        let mut blocked = Vec::new();
        let mut outcome = None;
        for candidate in leaders {
            let s = Instant::now();
            let report = match auditor.audit(candidate, &holdout, &cfg.audit.protected_attributes) {
                Ok(r) => r,
                Err(GovernanceError::AuditData(e)) => {
                    self.registry.block_candidate(&candidate.candidate_id, e.clone());
                    blocked.push(e);
                    lat.audit_ms += ms(s);
                    continue;
                }
                Err(e) => return Err(e),
            };
            lat.audit_ms += ms(s);
            audited.push(candidate.candidate_id.clone());
            if let Some(store) = &self.store {
                match store.put_fairness(&report) {
                    Err(GovernanceError::AlreadyPersisted(_)) => debug!(candidate_id = %candidate.candidate_id, "fairness report already stored"),
                    other => other?,
                }
            }

            let s = Instant::now();
            let previous = self.registry.get_active().map(|v| v.version_id);
            let result = self.registry.promote(candidate, &report, &thresholds)?;
            lat.promote_ms += ms(s);
            match result {
                PromotionOutcome::Promoted(v) if Some(v.version_id) == previous => { outcome = Some(CycleOutcome::AlreadyActive(v)); break; }
                PromotionOutcome::Promoted(v) => { outcome = Some(CycleOutcome::Promoted(v)); break; }
                PromotionOutcome::Rejected(r) => rejections.push(r),
            }
        }
        record_stage("audit", lat.audit_ms);
        record_stage("promote", lat.promote_ms);

        let outcome = match outcome {
            Some(o) => o,
            None => {
                if lifecycle.phase() == DeploymentPhase::Auditing { lifecycle.advance(DeploymentPhase::Rejected)?; }
                CycleOutcome::Rejected { rejections, blocked }
            }
        };
        if let CycleOutcome::Promoted(version) | CycleOutcome::AlreadyActive(version) = &outcome {
            lifecycle.advance(DeploymentPhase::Promoted)?;
            if matches!(outcome, CycleOutcome::Promoted(_)) || self.monitor.reference().is_none() {
                let s = Instant::now();
                self.install_reference(version, &holdout, cfg.drift.max_reference_points)?;
                lat.snapshot_ms = ms(s);
                record_stage("snapshot", lat.snapshot_ms);
            }
            lifecycle.advance(DeploymentPhase::Active)?;
        }

        let phase = lifecycle.phase();
        if let CycleOutcome::Promoted(version) = &outcome {
            let mut phases = self.phases.lock();
            if let Some((old, mut lc)) = phases.serving.take() {
                match lc.advance(DeploymentPhase::Retired) {
                    Ok(()) => info!(version_id = old, lifetime_ms = lc.elapsed().as_secs_f64() * 1000.0, "version retired"),
                    Err(e) => warn!(error = %e, version_id = old, "retired version was not serving"),
                }
            }
            phases.serving = Some((version.version_id, lifecycle));
        }

        lat.total_ms = ms(start);
        record_stage("total", lat.total_ms);
        info!(
            search_id = ?search_id,
            candidates,
            audited = audited.len(),
            ?phase,
            total_ms = lat.total_ms,
            "governance cycle finished"
        );
        Ok(CycleReport { search_id, termination, candidates, audited, cleaning, outcome, phase, latency: lat })
    }

    /// Audit the version named by `req` again and check the result against
    /// the current fairness thresholds. Uses the latest cycle's holdout when
    /// there is one, otherwise the report stored at promotion.
    #[instrument(skip_all, fields(version_id = req.version_id))]
    pub fn reaudit(&self, req: &ReauditRequest) -> Result<ReauditOutcome> {
        let cfg = self.config.load_full();
        let version = self.registry.versions().into_iter().find(|v| v.version_id == req.version_id)
            .ok_or_else(|| GovernanceError::InvalidInput(format!("unknown model version {}", req.version_id)))?;
        let holdout = self.holdout.lock().clone();
        let (source, report) = match holdout {
            Some(holdout) => {
                let auditor = FairnessAuditor::new(self.artifacts.clone(), cfg.audit.clone());
                (ReportSource::Fresh, auditor.audit_artifact(&version.candidate_id, &version.artifact, &holdout, &cfg.audit.protected_attributes)?)
            }
            None => {
                let stored = match &self.store { Some(store) => store.fairness(&version.candidate_id)?, None => None };
                let report = stored.ok_or_else(|| GovernanceError::InvalidInput(format!("no holdout or stored audit for version {}", version.version_id)))?;
                (ReportSource::Stored, report)
            }
        };
        let outcome = ReauditOutcome {
            version_id: version.version_id,
            candidate_id: version.candidate_id.clone(),
            source,
            max_disparity: report.max_disparity(),
            violations: gate::fairness_violations(&report, &cfg.promotion_thresholds()),
        };
        let result = if outcome.passed() { "pass" } else { "fail" };
        governance_metrics().reaudits_total.add(1, &[KeyValue::new("result", result)]);
        if outcome.passed() {
            info!(version_id = outcome.version_id, ?source, max_disparity = outcome.max_disparity, "serving version passes re-audit");
        } else {
            let reasons: Vec<String> = outcome.violations.iter().map(ToString::to_string).collect();
            warn!(version_id = outcome.version_id, ?source, ?reasons, "serving version fails re-audit");
        }
        Ok(outcome)
    }

    fn install_reference(&self, version: &ModelVersion, holdout: &Dataset, max_points: usize) -> Result<()> {
        let model = self.artifacts.load(&version.artifact)?;
        let predicted: Vec<bool> = holdout.rows().iter().map(|r| model.predict(&r.features)).collect();
        let snapshot = ReferenceSnapshot::capture(format!("ref-{}", Uuid::new_v4()), Some(version.version_id), holdout, &predicted, max_points);
        if let Some(store) = &self.store { store.put_snapshot(&snapshot)?; }
        self.monitor.set_reference(snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::InMemoryArtifactStore;
    use crate::inference_log::{InferenceEntry, InferenceLog};
    use crate::model::LogisticTrainer;
    use crate::testing::synthetic_dataset;

    fn config() -> GovernanceConfig {
        let mut cfg = GovernanceConfig::default();
        cfg.search.max_iterations = 4;
        cfg.search.parallelism = 2;
        cfg.search.max_duration_secs = None;
        cfg.audit.protected_attributes = vec!["Gender".into()];
        cfg.audit.min_subgroup_size = 20;
        cfg.thresholds.min_quality = 0.0;
        cfg.thresholds.max_disparity = 1.0;
        cfg.drift.min_window = 50;
        cfg
    }

    fn orchestrator(cfg: GovernanceConfig) -> (Orchestrator, Arc<ModelRegistry>, Arc<DriftMonitor>, GovernanceStore) {
        let cfg = Arc::new(ArcSwap::from_pointee(cfg));
        let store = GovernanceStore::temporary().unwrap();
        let registry = Arc::new(ModelRegistry::open(store.clone()).unwrap());
        let monitor = Arc::new(DriftMonitor::new(cfg.clone(), Some(store.clone())));
        let orch = Orchestrator::new(cfg, Arc::new(LogisticTrainer), Arc::new(InMemoryArtifactStore::new()), registry.clone(), monitor.clone(), Some(store.clone()));
        (orch, registry, monitor, store)
    }

    #[test]
    fn cycle_promotes_and_installs_reference() {
        let (orch, registry, monitor, store) = orchestrator(config());
        let report = orch.run_cycle(&synthetic_dataset(600, 0.0, 11), &CancelToken::new()).unwrap();
        let version = report.promoted().unwrap();
        assert_eq!(report.phase, DeploymentPhase::Active);
        assert_eq!(registry.get_active().unwrap().version_id, version.version_id);
        assert_eq!(report.audited.len(), 1);
        assert!(store.fairness(&report.audited[0]).unwrap().is_some());
        let reference = monitor.reference().unwrap();
        assert_eq!(reference.version_id, Some(version.version_id));
        assert!(reference.label_counts.is_some());
        assert!(store.snapshot_for_version(version.version_id).unwrap().is_some());
        assert_eq!(orch.serving_phase(), Some((version.version_id, DeploymentPhase::Active)));
    }

    #[test]
    fn unreachable_quality_is_rejected_for_every_leader() {
        let mut cfg = config();
        cfg.thresholds.min_quality = 2.0;
        let (orch, registry, monitor, _) = orchestrator(cfg);
        let report = orch.run_cycle(&synthetic_dataset(600, 0.0, 12), &CancelToken::new()).unwrap();
        assert_eq!(report.phase, DeploymentPhase::Rejected);
        match &report.outcome {
            CycleOutcome::Rejected { rejections, blocked } => {
                assert_eq!(rejections.len(), 3);
                assert!(blocked.is_empty());
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(registry.get_active().is_none());
        assert!(monitor.reference().is_none());
    }

    #[test]
    fn unpopulated_attribute_blocks_candidates() {
        let mut cfg = config();
        cfg.audit.min_subgroup_size = 10_000;
        let (orch, registry, _, _) = orchestrator(cfg);
        let report = orch.run_cycle(&synthetic_dataset(600, 0.0, 13), &CancelToken::new()).unwrap();
        let CycleOutcome::Rejected { blocked, .. } = &report.outcome else { panic!("expected rejection") };
        assert_eq!(blocked.len(), 3);
        assert!(blocked.iter().all(|b| b.attribute == "Gender"));
        assert!(registry.get_active().is_none());
    }

    #[test]
    fn second_promotion_retires_first_and_drift_updates_phase() {
        let (orch, registry, monitor, _) = orchestrator(config());
        let first = orch.run_cycle(&synthetic_dataset(600, 0.0, 14), &CancelToken::new()).unwrap();
        let v1 = first.promoted().unwrap().version_id;

        let log = InferenceLog::new(1000);
        for row in synthetic_dataset(200, 3.0, 15).rows() { log.push(InferenceEntry::new(v1, row.features.clone(), 0.5, true)); }
        let drift = monitor.tick(&log).unwrap().unwrap();
        assert_eq!(drift.verdict, Verdict::Drifted);
        assert_eq!(orch.serving_phase(), Some((v1, DeploymentPhase::Drifted)));

        let second = orch.run_cycle(&synthetic_dataset(600, 0.0, 16), &CancelToken::new()).unwrap();
        let v2 = second.promoted().unwrap().version_id;
        assert!(v2 > v1);
        assert_eq!(registry.versions().iter().filter(|v| v.status == crate::registry::ModelStatus::Active).count(), 1);
        assert_eq!(monitor.reference().unwrap().version_id, Some(v2));
        assert_eq!(orch.serving_phase(), Some((v2, DeploymentPhase::Active)));
    }

    #[test]
    fn reaudit_checks_serving_version_against_current_thresholds() {
        let cfg = Arc::new(ArcSwap::from_pointee(config()));
        let store = GovernanceStore::temporary().unwrap();
        let registry = Arc::new(ModelRegistry::open(store.clone()).unwrap());
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let monitor = Arc::new(DriftMonitor::new(cfg.clone(), Some(store.clone())));
        let orch = Orchestrator::new(cfg.clone(), Arc::new(LogisticTrainer), artifacts.clone(), registry.clone(), monitor.clone(), Some(store.clone()));
        let version = orch.run_cycle(&synthetic_dataset(600, 0.0, 18), &CancelToken::new()).unwrap().promoted().unwrap().clone();
        let req = ReauditRequest { version_id: version.version_id, candidate_id: version.candidate_id.clone() };

        let fresh = orch.reaudit(&req).unwrap();
        assert_eq!(fresh.source, ReportSource::Fresh);
        assert!(fresh.passed());
        assert_eq!(fresh.max_disparity, store.fairness(&version.candidate_id).unwrap().unwrap().max_disparity());

        let mut stricter = config();
        stricter.thresholds.required_attributes = vec!["Age".into()];
        cfg.store(Arc::new(stricter));
        let failed = orch.reaudit(&req).unwrap();
        assert_eq!(failed.violations, vec![RejectionReason::MissingAttribute { attribute: "Age".into() }]);

        // A restarted orchestrator has no holdout and falls back to the stored report.
        let restarted = Orchestrator::new(cfg, Arc::new(LogisticTrainer), artifacts, registry, monitor, Some(store));
        let stored = restarted.reaudit(&req).unwrap();
        assert_eq!(stored.source, ReportSource::Stored);
        assert!(!stored.passed());
        assert!(matches!(restarted.reaudit(&ReauditRequest { version_id: 99, candidate_id: "none".into() }), Err(GovernanceError::InvalidInput(_))));
    }

    #[test]
    fn too_little_data_fails_the_cycle() {
        let (orch, registry, _, _) = orchestrator(config());
        let err = orch.run_cycle(&synthetic_dataset(40, 0.0, 17), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, GovernanceError::InsufficientData { .. }));
        assert!(registry.get_active().is_none());
    }
}
