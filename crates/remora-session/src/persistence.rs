//! Blob persistence for model artifacts.
//!
//! Every store keeps bytes exactly as given (embedded zero bytes included) and
//! distinguishes an absent key from a zero-length value.

use crate::artifact::{ModelArtifact, ModelConfig, ModelInfo, TrainingState};
use crate::error::{Result, SessionError};
use dashmap::DashMap;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Key/value storage for opaque byte blobs.
pub trait BlobStore: Send + Sync {
    fn save_blob(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// `Ok(None)` if the key was never saved (or was removed).
    fn load_blob(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Removing a missing key is not an error.
    fn remove_blob(&self, key: &str) -> Result<()>;
}

/// In-memory blob store.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn save_blob(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn load_blob(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(key).map(|entry| entry.value().clone()))
    }

    fn remove_blob(&self, key: &str) -> Result<()> {
        self.blobs.remove(key);
        Ok(())
    }
}

/// One file per key under a root directory. `/` in keys maps to
/// subdirectories.
#[derive(Debug, Clone)]
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(SessionError::Store(format!("invalid blob key '{key}'")));
        }
        Ok(self.root.join(relative))
    }
}

impl BlobStore for DirBlobStore {
    fn save_blob(&self, key: &str, bytes: &[u8]) -> Result<()> {
        write_atomically(&self.path_for(key)?, bytes)
    }

    fn load_blob(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_blob(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write through a uniquely named sibling file and rename it over `path`, so
/// readers and concurrent writers only ever see complete files.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| SessionError::Io(e.error))?;
    Ok(())
}

pub const CODE_KEY: &str = "model/code";
pub const CONFIG_KEY: &str = "model/config";
pub const STATE_KEY: &str = "model/state";
pub const OPTIMIZER_KEY: &str = "model/optimizer";
pub const INFO_KEY: &str = "model/info";

/// Persists [`ModelArtifact`] and [`ModelInfo`] through a [`BlobStore`].
///
/// The empty artifact is stored as the absence of the code key. Training state
/// is present only if the state key exists, so zero-length state blobs survive
/// as present-but-empty.
#[derive(Clone)]
pub struct ArtifactStore {
    blobs: Arc<dyn BlobStore>,
}

impl ArtifactStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBlobStore::new()))
    }

    pub fn save_artifact(&self, artifact: &ModelArtifact) -> Result<()> {
        if artifact.is_empty() {
            for key in [CODE_KEY, CONFIG_KEY, STATE_KEY, OPTIMIZER_KEY] {
                self.blobs.remove_blob(key)?;
            }
            return Ok(());
        }

        self.blobs.save_blob(CODE_KEY, &artifact.code)?;
        self.blobs
            .save_blob(CONFIG_KEY, &serde_json::to_vec(&artifact.config)?)?;

        match &artifact.state {
            Some(state) => {
                self.blobs.save_blob(STATE_KEY, &state.model)?;
                self.blobs.save_blob(OPTIMIZER_KEY, &state.optimizer)?;
            }
            None => {
                self.blobs.remove_blob(STATE_KEY)?;
                self.blobs.remove_blob(OPTIMIZER_KEY)?;
            }
        }

        tracing::debug!(
            "saved model artifact ({} bytes, state: {})",
            artifact.code.len(),
            artifact.state.is_some()
        );
        Ok(())
    }

    pub fn load_artifact(&self) -> Result<ModelArtifact> {
        let Some(code) = self.blobs.load_blob(CODE_KEY)? else {
            return Ok(ModelArtifact::empty());
        };

        let config = match self.blobs.load_blob(CONFIG_KEY)? {
            Some(bytes) => serde_json::from_slice::<ModelConfig>(&bytes)?,
            None => ModelConfig::new(),
        };

        let state = match self.blobs.load_blob(STATE_KEY)? {
            Some(model) => Some(TrainingState {
                model,
                optimizer: self.blobs.load_blob(OPTIMIZER_KEY)?.unwrap_or_default(),
            }),
            None => None,
        };

        Ok(ModelArtifact {
            code,
            config,
            state,
        })
    }

    pub fn save_info(&self, info: Option<&ModelInfo>) -> Result<()> {
        match info {
            Some(info) => self.blobs.save_blob(INFO_KEY, &serde_json::to_vec(info)?),
            None => self.blobs.remove_blob(INFO_KEY),
        }
    }

    pub fn load_info(&self) -> Result<Option<ModelInfo>> {
        self.blobs
            .load_blob(INFO_KEY)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(SessionError::from))
            .transpose()
    }

    /// Remove everything this store owns.
    pub fn clear(&self) -> Result<()> {
        for key in [CODE_KEY, CONFIG_KEY, STATE_KEY, OPTIMIZER_KEY, INFO_KEY] {
            self.blobs.remove_blob(key)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore").finish_non_exhaustive()
    }
}
