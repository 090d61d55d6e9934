//! Interfaces to the remote inference server.
//!
//! The wire protocol lives outside this crate; these traits are what the
//! provisioner and controller need from it.

use crate::artifact::{ModelArtifact, TrainingState};
use crate::config::{DeviceInfo, ServerEndpoint};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// A dense block of input or output data.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TensorBlock {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorBlock {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    /// Number of elements `shape` describes.
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_consistent(&self) -> bool {
        self.element_count() == self.data.len()
    }
}

/// Opens connections to a server endpoint.
#[async_trait]
pub trait ServerConnector: Send + Sync {
    async fn connect(&self, endpoint: ServerEndpoint) -> Result<Arc<dyn ServerConnection>>;
}

/// A live connection to a server.
#[async_trait]
pub trait ServerConnection: Send + Sync {
    async fn available_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Load `artifact` into a new session on the given devices.
    async fn create_model_session(
        &self,
        artifact: &ModelArtifact,
        device_ids: &[String],
    ) -> Result<Box<dyn RemoteModelSession>>;
}

/// A model loaded on the server.
#[async_trait]
pub trait RemoteModelSession: Send + Sync {
    fn name(&self) -> &str;

    fn known_classes(&self) -> Vec<u32>;

    fn has_training(&self) -> bool;

    async fn forward(&self, input: TensorBlock) -> Result<TensorBlock>;

    async fn pause_training(&self) -> Result<()>;

    async fn resume_training(&self) -> Result<()>;

    async fn download_state(&self) -> Result<TrainingState>;

    /// Release the server-side session. Must succeed if the session is
    /// already gone.
    async fn close(&self) -> Result<()>;
}
