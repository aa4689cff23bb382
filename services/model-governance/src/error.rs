use thiserror::Error;

use crate::search::Candidate;

pub type Result<T, E = GovernanceError> = std::result::Result<T, E>;

/// A protected attribute that cannot be audited.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[error("attribute `{attribute}` has {populated} populated subgroup(s) with >= {min_subgroup_size} rows, need 2")]
pub struct AuditDataError {
    pub attribute: String,
    pub populated: usize,
    pub min_subgroup_size: usize,
}

#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error("insufficient training data: {rows} row(s), need at least {min_rows}")]
    InsufficientData { rows: usize, min_rows: usize },

    /// Recoverable: the best candidates found before the deadline are kept.
    #[error("search budget exhausted after {evaluated} evaluation(s) before convergence")]
    SearchTimeout { evaluated: usize, best_so_far: Vec<Candidate> },

    #[error(transparent)]
    AuditData(#[from] AuditDataError),

    /// Fatal for promotion processing until cleared by an operator.
    #[error("registry consistency violated: {0}")]
    RegistryConsistency(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("schema violation: {0}")]
    Schema(String),

    #[error("training failed: {0}")]
    Training(String),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("no active model version")]
    NoActiveModel,

    #[error("record `{0}` already persisted")]
    AlreadyPersisted(String),

    #[error("storage: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

impl GovernanceError {
    /// Errors after which the caller may keep going with degraded output.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, GovernanceError::SearchTimeout { .. } | GovernanceError::AuditData(_))
    }
}
