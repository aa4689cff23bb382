use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::{GovernanceError, Result};
use crate::model::TrainedModel;

/// Opaque reference to a stored model; the core never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactHandle(pub String);

impl fmt::Display for ArtifactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

pub trait ArtifactStore: Send + Sync {
    fn save(&self, model: Arc<TrainedModel>) -> Result<ArtifactHandle>;
    fn load(&self, handle: &ArtifactHandle) -> Result<Arc<TrainedModel>>;
}

#[derive(Default)]
pub struct InMemoryArtifactStore {
    models: RwLock<HashMap<ArtifactHandle, Arc<TrainedModel>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self { Self::default() }
    pub fn len(&self) -> usize { self.models.read().len() }
    pub fn is_empty(&self) -> bool { self.models.read().is_empty() }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn save(&self, model: Arc<TrainedModel>) -> Result<ArtifactHandle> {
        let handle = ArtifactHandle(format!("mem://{}", uuid::Uuid::new_v4()));
        self.models.write().insert(handle.clone(), model);
        debug!(%handle, "artifact saved");
        Ok(handle)
    }

    fn load(&self, handle: &ArtifactHandle) -> Result<Arc<TrainedModel>> {
        self.models.read().get(handle).cloned().ok_or_else(|| GovernanceError::Artifact(format!("unknown artifact {handle}")))
    }
}
