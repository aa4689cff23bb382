//! Versioned model registry.
//!
//! Promotion is the single serialization point: one mutex-guarded writer
//! validates the gate, appends the transition batch to the durable log and
//! swaps the active pointer. Readers load the pointer without locking.

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};

use crate::artifacts::ArtifactHandle;
use crate::audit::FairnessReport;
use crate::error::{AuditDataError, GovernanceError, Result};
use crate::gate::{self, PromotionRejected, PromotionThresholds};
use crate::search::Candidate;
use crate::store::GovernanceStore;
use crate::telemetry::governance_metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus { Pending, Active, Retired }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub version_id: u64,
    pub candidate_id: String,
    pub artifact: ArtifactHandle,
    pub promoted_at: Option<DateTime<Utc>>,
    pub status: ModelStatus,
}

/// One entry of the append-only status log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub seq: u64,
    pub version_id: u64,
    pub candidate_id: String,
    pub artifact: ArtifactHandle,
    /// `None` when the version is created.
    pub from: Option<ModelStatus>,
    pub to: ModelStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum PromotionOutcome {
    Promoted(Arc<ModelVersion>),
    Rejected(PromotionRejected),
}

impl PromotionOutcome {
    pub fn version(&self) -> Option<&Arc<ModelVersion>> {
        match self { PromotionOutcome::Promoted(v) => Some(v), PromotionOutcome::Rejected(_) => None }
    }

    pub fn rejection(&self) -> Option<&PromotionRejected> {
        match self { PromotionOutcome::Rejected(r) => Some(r), PromotionOutcome::Promoted(_) => None }
    }
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Promoted { version: Arc<ModelVersion>, retired: Option<u64> },
    Halted { reason: String },
}

#[derive(Debug, Clone)]
struct RegistryState {
    versions: BTreeMap<u64, ModelVersion>,
    log: Vec<Transition>,
    blocks: BTreeMap<String, Vec<AuditDataError>>,
    halted: Option<String>,
    next_version: u64,
    next_seq: u64,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self { versions: BTreeMap::new(), log: Vec::new(), blocks: BTreeMap::new(), halted: None, next_version: 1, next_seq: 1 }
    }
}

impl RegistryState {
    fn apply(&mut self, t: &Transition) -> std::result::Result<(), String> {
        if t.seq != self.next_seq { return Err(format!("transition {} out of sequence, expected {}", t.seq, self.next_seq)); }
        match (t.from, self.versions.get_mut(&t.version_id)) {
            (None, None) if t.to == ModelStatus::Pending => {
                self.versions.insert(t.version_id, ModelVersion { version_id: t.version_id, candidate_id: t.candidate_id.clone(), artifact: t.artifact.clone(), promoted_at: None, status: ModelStatus::Pending });
            }
            (Some(from), Some(v)) if v.status == from && legal(from, t.to) => {
                v.status = t.to;
                if t.to == ModelStatus::Active { v.promoted_at = Some(t.at); }
            }
            (from, current) => {
                return Err(format!("illegal transition {:?} -> {:?} for version {} (current {:?})", from, t.to, t.version_id, current.map(|v| v.status)));
            }
        }
        self.next_seq = t.seq + 1;
        self.next_version = self.next_version.max(t.version_id + 1);
        self.log.push(t.clone());
        Ok(())
    }

    fn active(&self) -> impl Iterator<Item = &ModelVersion> { self.versions.values().filter(|v| v.status == ModelStatus::Active) }
}

fn legal(from: ModelStatus, to: ModelStatus) -> bool {
    matches!((from, to), (ModelStatus::Pending, ModelStatus::Active) | (ModelStatus::Active, ModelStatus::Retired))
}

pub struct ModelRegistry {
    state: Mutex<RegistryState>,
    active: ArcSwapOption<ModelVersion>,
    store: Option<GovernanceStore>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for ModelRegistry {
    fn default() -> Self { Self::new() }
}

impl ModelRegistry {
    /// Registry without durable log.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self { state: Mutex::new(RegistryState::default()), active: ArcSwapOption::empty(), store: None, events }
    }

    /// Rebuild state by replaying the persisted transition log.
    pub fn open(store: GovernanceStore) -> Result<Self> {
        let mut state = RegistryState::default();
        for t in store.transitions()? {
            state.apply(&t).map_err(|e| GovernanceError::RegistryConsistency(format!("replay: {e}")))?;
        }
        let active: Vec<&ModelVersion> = state.active().collect();
        if active.len() > 1 {
            return Err(GovernanceError::RegistryConsistency(format!("replay found {} active versions", active.len())));
        }
        let pointer = active.first().map(|v| Arc::new((*v).clone()));
        info!(versions = state.versions.len(), transitions = state.log.len(), active = pointer.as_ref().map(|v| v.version_id), "registry recovered");
        let (events, _) = broadcast::channel(64);
        Ok(Self { state: Mutex::new(state), active: ArcSwapOption::new(pointer), store: Some(store), events })
    }

    /// Lock-free read of the committed active version.
    pub fn get_active(&self) -> Option<Arc<ModelVersion>> { self.active.load_full() }

    pub fn versions(&self) -> Vec<ModelVersion> { self.state.lock().versions.values().cloned().collect() }

    pub fn transitions(&self) -> Vec<Transition> { self.state.lock().log.clone() }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> { self.events.subscribe() }

    pub fn is_halted(&self) -> bool { self.state.lock().halted.is_some() }

    /// Record an audit failure that blocks `candidate_id` until resolved.
    pub fn block_candidate(&self, candidate_id: &str, err: AuditDataError) {
        let mut state = self.state.lock();
        let blocks = state.blocks.entry(candidate_id.to_string()).or_default();
        if !blocks.contains(&err) {
            warn!(candidate_id, attribute = %err.attribute, "candidate blocked by audit data error");
            blocks.push(err);
        }
    }

    /// Clear audit blocks for `candidate_id`; returns how many were cleared.
    pub fn resolve_audit(&self, candidate_id: &str) -> usize {
        let cleared = self.state.lock().blocks.remove(candidate_id).map(|b| b.len()).unwrap_or(0);
        if cleared > 0 { info!(candidate_id, cleared, "audit blocks resolved"); }
        cleared
    }

    /// Operator action after a consistency halt: resynchronise the active
    /// pointer with the log and accept promotions again.
    pub fn clear_halt(&self) -> Option<String> {
        let mut state = self.state.lock();
        let reason = state.halted.take()?;
        let active = state.active().next().cloned().map(Arc::new);
        self.active.store(active);
        warn!(%reason, "registry halt cleared");
        Some(reason)
    }

    fn halt(&self, state: &mut RegistryState, reason: String) -> GovernanceError {
        error!(%reason, "registry consistency violated; promotions halted");
        state.halted = Some(reason.clone());
        let _ = self.events.send(RegistryEvent::Halted { reason: reason.clone() });
        GovernanceError::RegistryConsistency(reason)
    }

    /// Gate `candidate` and, if it passes, make it the active version.
    ///
    /// Rejection leaves every piece of state untouched. Promoting the
    /// candidate that is already active returns the current version.
    #[instrument(skip_all, fields(candidate_id = %candidate.candidate_id))]
    pub fn promote(&self, candidate: &Candidate, report: &FairnessReport, thresholds: &PromotionThresholds) -> Result<PromotionOutcome> {
        thresholds.validate()?;
        let mut state = self.state.lock();
        if let Some(reason) = &state.halted {
            return Err(GovernanceError::RegistryConsistency(format!("promotions halted: {reason}")));
        }
        let blocks = state.blocks.get(&candidate.candidate_id).cloned().unwrap_or_default();
        if let Err(rejected) = gate::evaluate(candidate, report, thresholds, &blocks) {
            governance_metrics().rejections_total.add(1, &[]);
            info!(reasons = %rejected, "promotion rejected");
            return Ok(PromotionOutcome::Rejected(rejected));
        }

        let previous = state.active().next().cloned();
        let pointer = self.active.load_full().map(|v| v.version_id);
        if state.active().count() > 1 || pointer != previous.as_ref().map(|v| v.version_id) {
            let reason = format!("active pointer {:?} disagrees with log {:?}", pointer, previous.as_ref().map(|v| v.version_id));
            return Err(self.halt(&mut state, reason));
        }
        if let Some(prev) = previous.as_ref().filter(|p| p.candidate_id == candidate.candidate_id) {
            info!(version_id = prev.version_id, "candidate already active");
            return Ok(PromotionOutcome::Promoted(Arc::new(prev.clone())));
        }

        let version_id = state.next_version;
        let at = Utc::now();
        let entry = |seq: u64, version_id: u64, candidate_id: &str, artifact: &ArtifactHandle, from, to| Transition {
            seq, version_id, candidate_id: candidate_id.to_string(), artifact: artifact.clone(), from, to, at,
        };
        let mut seq = state.next_seq;
        let mut batch = vec![entry(seq, version_id, &candidate.candidate_id, &candidate.artifact, None, ModelStatus::Pending)];
        if let Some(prev) = &previous {
            seq += 1;
            batch.push(entry(seq, prev.version_id, &prev.candidate_id, &prev.artifact, Some(ModelStatus::Active), ModelStatus::Retired));
        }
        batch.push(entry(seq + 1, version_id, &candidate.candidate_id, &candidate.artifact, Some(ModelStatus::Pending), ModelStatus::Active));

        let mut next = state.clone();
        for t in &batch {
            if let Err(reason) = next.apply(t) { return Err(self.halt(&mut state, reason)); }
        }
        if next.active().count() != 1 {
            let reason = format!("promotion of version {version_id} would leave {} active versions", next.active().count());
            return Err(self.halt(&mut state, reason));
        }
        if let Some(store) = &self.store { store.append_transitions(&batch)?; }

        *state = next;
        let active = Arc::new(state.versions[&version_id].clone());
        self.active.store(Some(active.clone()));
        drop(state);

        governance_metrics().promotions_total.add(1, &[]);
        let retired = previous.map(|p| p.version_id);
        info!(version_id, ?retired, "candidate promoted");
        let _ = self.events.send(RegistryEvent::Promoted { version: active.clone(), retired });
        Ok(PromotionOutcome::Promoted(active))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::tests::report;
    use crate::search::tests::candidate;

    fn active_count(r: &ModelRegistry) -> usize { r.versions().iter().filter(|v| v.status == ModelStatus::Active).count() }

    #[test]
    fn passing_candidate_becomes_active() {
        let registry = ModelRegistry::new();
        let c = candidate(0, 0.81);
        let r = report(&c.candidate_id, &[("Gender", 0.03), ("AgeBand", 0.03)]);
        let outcome = registry.promote(&c, &r, &PromotionThresholds::default()).unwrap();
        let v = outcome.version().unwrap();
        assert_eq!((v.version_id, v.status), (1, ModelStatus::Active));
        assert_eq!(registry.get_active().unwrap().candidate_id, c.candidate_id);
    }

    #[test]
    fn excess_disparity_rejected_without_state_change() {
        let registry = ModelRegistry::new();
        let c = candidate(0, 0.81);
        let r = report(&c.candidate_id, &[("Gender", 0.03), ("AgeBand", 0.09)]);
        let mut rx = registry.subscribe();
        let first = registry.promote(&c, &r, &PromotionThresholds::default()).unwrap();
        let rejected = first.rejection().unwrap();
        assert!(rejected.cites_attribute("AgeBand"));
        assert!(!rejected.cites_attribute("Gender"));
        assert!(registry.get_active().is_none());
        assert!(registry.versions().is_empty() && registry.transitions().is_empty());
        assert!(rx.try_recv().is_err());

        let again = registry.promote(&c, &r, &PromotionThresholds::default()).unwrap();
        assert_eq!(again.rejection(), Some(rejected));
    }

    #[test]
    fn promotion_retires_previous_version() {
        let registry = ModelRegistry::new();
        let t = PromotionThresholds::default();
        for i in 0..3 {
            let c = candidate(i, 0.9);
            registry.promote(&c, &report(&c.candidate_id, &[("Gender", 0.01)]), &t).unwrap();
            assert_eq!(active_count(&registry), 1);
        }
        let statuses: Vec<_> = registry.versions().iter().map(|v| v.status).collect();
        assert_eq!(statuses, vec![ModelStatus::Retired, ModelStatus::Retired, ModelStatus::Active]);
        assert_eq!(registry.get_active().unwrap().version_id, 3);
        let log = registry.transitions();
        assert_eq!(log.len(), 2 + 3 + 3);
        assert!(log.windows(2).all(|w| w[1].seq == w[0].seq + 1));
    }

    #[test]
    fn concurrent_promotions_keep_one_active() {
        let registry = Arc::new(ModelRegistry::new());
        std::thread::scope(|s| {
            for i in 0..8 {
                let registry = registry.clone();
                s.spawn(move || {
                    let c = candidate(i, 0.9);
                    registry.promote(&c, &report(&c.candidate_id, &[("Gender", 0.0)]), &PromotionThresholds::default()).unwrap();
                    assert!(registry.get_active().is_some());
                });
            }
        });
        assert_eq!(registry.versions().len(), 8);
        assert_eq!(active_count(&registry), 1);
        assert_eq!(registry.get_active().unwrap().version_id, 8);
    }

    #[test]
    fn audit_block_prevents_promotion_until_resolved() {
        let registry = ModelRegistry::new();
        let c = candidate(0, 0.9);
        let r = report(&c.candidate_id, &[("Gender", 0.0)]);
        registry.block_candidate(&c.candidate_id, AuditDataError { attribute: "MaritalStatus".into(), populated: 1, min_subgroup_size: 30 });
        assert!(registry.promote(&c, &r, &PromotionThresholds::default()).unwrap().rejection().is_some());
        assert_eq!(registry.resolve_audit(&c.candidate_id), 1);
        assert!(registry.promote(&c, &r, &PromotionThresholds::default()).unwrap().version().is_some());
    }

    #[test]
    fn pointer_divergence_halts_until_cleared() {
        let registry = ModelRegistry::new();
        let t = PromotionThresholds::default();
        let a = candidate(0, 0.9);
        registry.promote(&a, &report(&a.candidate_id, &[("Gender", 0.0)]), &t).unwrap();
        registry.active.store(None);
        let b = candidate(1, 0.9);
        let rb = report(&b.candidate_id, &[("Gender", 0.0)]);
        assert!(matches!(registry.promote(&b, &rb, &t), Err(GovernanceError::RegistryConsistency(_))));
        assert!(registry.is_halted());
        assert!(matches!(registry.promote(&b, &rb, &t), Err(GovernanceError::RegistryConsistency(_))));
        assert!(registry.clear_halt().is_some());
        assert_eq!(registry.get_active().unwrap().version_id, 1);
        assert_eq!(registry.promote(&b, &rb, &t).unwrap().version().unwrap().version_id, 2);
    }

    #[test]
    fn replay_restores_active_version() {
        let store = GovernanceStore::temporary().unwrap();
        let registry = ModelRegistry::open(store.clone()).unwrap();
        let t = PromotionThresholds::default();
        for i in 0..2 {
            let c = candidate(i, 0.9);
            registry.promote(&c, &report(&c.candidate_id, &[("Gender", 0.0)]), &t).unwrap();
        }
        let recovered = ModelRegistry::open(store).unwrap();
        assert_eq!(recovered.get_active().unwrap().version_id, 2);
        assert_eq!(recovered.versions(), registry.versions());
        assert_eq!(recovered.transitions().len(), registry.transitions().len());
    }

    #[test]
    fn replay_rejects_inconsistent_log() {
        let store = GovernanceStore::temporary().unwrap();
        let at = Utc::now();
        let t = |seq, version_id, from, to| Transition { seq, version_id, candidate_id: format!("c{version_id}"), artifact: ArtifactHandle("mem://x".into()), from, to, at };
        store.append_transitions(&[
            t(1, 1, None, ModelStatus::Pending),
            t(2, 1, Some(ModelStatus::Pending), ModelStatus::Active),
            t(3, 2, None, ModelStatus::Pending),
            t(4, 2, Some(ModelStatus::Pending), ModelStatus::Active),
        ]).unwrap();
        assert!(matches!(ModelRegistry::open(store), Err(GovernanceError::RegistryConsistency(_))));
    }
}
