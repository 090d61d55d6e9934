//! Model bytes, training state and the summary derived from a live session.

use crate::error::{LoadStage, Result, SessionError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Free-form model configuration, persisted as JSON.
pub type ModelConfig = serde_json::Map<String, serde_json::Value>;

/// Serialized weights and optimizer state, both opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrainingState {
    pub model: Vec<u8>,
    pub optimizer: Vec<u8>,
}

/// Model code + config + optional training state.
///
/// An artifact with zero-length code is the *empty* artifact, meaning "no
/// model". It is distinct from `None` (nothing stored at all) and from a real
/// model whose state blobs happen to be zero-length.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelArtifact {
    pub code: Vec<u8>,
    pub config: ModelConfig,
    pub state: Option<TrainingState>,
}

impl ModelArtifact {
    pub fn new(code: impl Into<Vec<u8>>, config: ModelConfig) -> Self {
        Self {
            code: code.into(),
            config,
            state: None,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn with_state(mut self, state: TrainingState) -> Self {
        self.state = Some(state);
        self
    }
}

/// Read-only summary of a loaded model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub known_classes: Vec<u32>,
    pub has_training: bool,
}

impl ModelInfo {
    pub fn num_classes(&self) -> usize {
        self.known_classes.len()
    }
}

/// Yields raw model bytes for a user-chosen path.
#[async_trait]
pub trait ModelSource: Send + Sync {
    async fn read_model(&self, path: &Path) -> Result<Vec<u8>>;
}

/// Reads model files from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsModelSource;

#[async_trait]
impl ModelSource for FsModelSource {
    async fn read_model(&self, path: &Path) -> Result<Vec<u8>> {
        let bytes = tokio::fs::read(path).await?;
        if bytes.is_empty() {
            return Err(SessionError::protocol(
                LoadStage::ReadingModel,
                format!("{} is empty", path.display()),
            ));
        }
        Ok(bytes)
    }
}
