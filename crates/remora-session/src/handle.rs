//! The live session owned by the controller.

use crate::artifact::{ModelInfo, TrainingState};
use crate::connection::{RemoteModelSession, TensorBlock};
use crate::error::Result;
use crate::provisioner::ProvisionedServer;

/// A model session on a provisioned server.
///
/// Only [`SessionController`](crate::SessionController) holds one. Closing
/// releases the remote session first, then stops the server launcher.
pub struct SessionHandle {
    session: Box<dyn RemoteModelSession>,
    server: ProvisionedServer,
}

impl SessionHandle {
    pub(crate) fn new(session: Box<dyn RemoteModelSession>, server: ProvisionedServer) -> Self {
        Self { session, server }
    }

    pub(crate) fn info(&self) -> ModelInfo {
        ModelInfo {
            name: self.session.name().to_string(),
            known_classes: self.session.known_classes(),
            has_training: self.session.has_training(),
        }
    }

    pub(crate) async fn forward(&self, input: TensorBlock) -> Result<TensorBlock> {
        self.session.forward(input).await
    }

    pub(crate) async fn pause_training(&self) -> Result<()> {
        self.session.pause_training().await
    }

    pub(crate) async fn resume_training(&self) -> Result<()> {
        self.session.resume_training().await
    }

    pub(crate) async fn download_state(&self) -> Result<TrainingState> {
        self.session.download_state().await
    }

    /// Release the remote session and stop the server. Never fails: a session
    /// that is already gone is only logged.
    pub(crate) async fn close(&self) {
        if let Err(e) = self.session.close().await {
            tracing::warn!("closing session '{}' failed: {}", self.session.name(), e);
        }
        self.server.shutdown().await;
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("model", &self.session.name())
            .field("server", &self.server)
            .finish()
    }
}
