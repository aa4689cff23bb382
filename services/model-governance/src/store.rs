//! Durable governance records on sled: the registry transition log,
//! fairness reports, drift reports and reference snapshots. Every record is
//! write-once.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::{Batch, Db, Tree};
use std::path::PathBuf;
use tracing::debug;

use crate::audit::FairnessReport;
use crate::drift::{DriftReport, ReferenceSnapshot};
use crate::error::{GovernanceError, Result};
use crate::registry::Transition;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub path: PathBuf,
    /// Discard everything on drop; for tests and dry runs.
    pub temporary: bool,
}

impl Default for StoreSettings {
    fn default() -> Self { Self { path: PathBuf::from("/tmp/attrition-governance"), temporary: false } }
}

#[derive(Clone)]
pub struct GovernanceStore {
    db: Db,
    transitions: Tree,
    fairness: Tree,
    drift: Tree,
    snapshots: Tree,
}

impl GovernanceStore {
    pub fn open(settings: &StoreSettings) -> Result<Self> {
        let db = sled::Config::new().path(&settings.path).temporary(settings.temporary).open()?;
        Ok(Self {
            transitions: db.open_tree("transitions")?,
            fairness: db.open_tree("fairness_reports")?,
            drift: db.open_tree("drift_reports")?,
            snapshots: db.open_tree("reference_snapshots")?,
            db,
        })
    }

    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            transitions: db.open_tree("transitions")?,
            fairness: db.open_tree("fairness_reports")?,
            drift: db.open_tree("drift_reports")?,
            snapshots: db.open_tree("reference_snapshots")?,
            db,
        })
    }

    fn put_once<T: Serialize>(&self, tree: &Tree, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        if tree.compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(bytes))?.is_err() {
            return Err(GovernanceError::AlreadyPersisted(key.to_string()));
        }
        self.db.flush()?;
        debug!(tree = %String::from_utf8_lossy(&tree.name()), key, "record persisted");
        Ok(())
    }

    fn get<T: DeserializeOwned>(tree: &Tree, key: &str) -> Result<Option<T>> {
        tree.get(key.as_bytes())?.map(|v| serde_json::from_slice(&v).map_err(GovernanceError::from)).transpose()
    }

    fn all<T: DeserializeOwned>(tree: &Tree) -> Result<Vec<T>> {
        tree.iter().values().map(|v| -> Result<T> { Ok(serde_json::from_slice(&v?)?) }).collect()
    }

    /// Append transitions atomically. Sequence numbers must be new.
    pub fn append_transitions(&self, entries: &[Transition]) -> Result<()> {
        let mut batch = Batch::default();
        for t in entries {
            let key = t.seq.to_be_bytes();
            if self.transitions.contains_key(key)? { return Err(GovernanceError::AlreadyPersisted(format!("transition {}", t.seq))); }
            batch.insert(key.to_vec(), serde_json::to_vec(t)?);
        }
        self.transitions.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }

    /// The full log in sequence order.
    pub fn transitions(&self) -> Result<Vec<Transition>> { Self::all(&self.transitions) }

    pub fn put_fairness(&self, report: &FairnessReport) -> Result<()> { self.put_once(&self.fairness, &report.candidate_id, report) }
    pub fn fairness(&self, candidate_id: &str) -> Result<Option<FairnessReport>> { Self::get(&self.fairness, candidate_id) }

    pub fn put_drift(&self, report: &DriftReport) -> Result<()> { self.put_once(&self.drift, &report.window_id, report) }
    pub fn drift_reports(&self) -> Result<Vec<DriftReport>> { Self::all(&self.drift) }

    pub fn put_snapshot(&self, snapshot: &ReferenceSnapshot) -> Result<()> { self.put_once(&self.snapshots, &snapshot.snapshot_id, snapshot) }

    /// Most recent snapshot captured for `version_id`, if any.
    pub fn snapshot_for_version(&self, version_id: u64) -> Result<Option<ReferenceSnapshot>> {
        let mut found: Vec<ReferenceSnapshot> = Self::all::<ReferenceSnapshot>(&self.snapshots)?.into_iter().filter(|s| s.version_id == Some(version_id)).collect();
        found.sort_by_key(|s| s.captured_at);
        Ok(found.pop())
    }
}
