//! RemoraEngine that coordinates the session, graph and dispatch subsystems

use crate::{Error, Result};
use remora_dispatch::{join_all, BatchDispatcher, DispatchStats};
use remora_session::{
    ConnectionProvisioner, ControllerState, DeviceInfo, ModelInfo, ProfileStore, ServerProfile,
    SessionConfig, SessionController, SessionError, SessionGraph, TensorBlock,
};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Client-side engine for a remote inference server.
///
/// Data flows one way: the [`SessionConfig`] held in the [`SessionGraph`]
/// determines the server target, the [`SessionController`] provisions a server
/// and loads the model onto it, and [`predict_blocks`](Self::predict_blocks)
/// fans inference requests out through the [`BatchDispatcher`].
///
/// # Example
///
/// ```ignore
/// use remora::prelude::*;
///
/// let engine = RemoraEngine::builder()
///     .connector(connector)
///     .build()?;
///
/// let devices = engine.refresh_devices().await?;
/// engine.load_model("model.zip").await?;
///
/// for output in engine.predict_blocks(blocks).await {
///     println!("{:?}", output?.shape);
/// }
/// engine.shutdown().await;
/// ```
pub struct RemoraEngine {
    graph: Arc<SessionGraph>,
    controller: SessionController,
    dispatcher: BatchDispatcher,
    provisioner: ConnectionProvisioner,
    profiles: Option<Arc<dyn ProfileStore>>,
}

impl RemoraEngine {
    pub fn builder() -> crate::RemoraEngineBuilder {
        crate::RemoraEngineBuilder::default()
    }

    pub(crate) fn from_parts(
        graph: Arc<SessionGraph>,
        controller: SessionController,
        dispatcher: BatchDispatcher,
        provisioner: ConnectionProvisioner,
        profiles: Option<Arc<dyn ProfileStore>>,
    ) -> Self {
        Self {
            graph,
            controller,
            dispatcher,
            provisioner,
            profiles,
        }
    }

    // =========================================================================
    // Server configuration
    // =========================================================================

    pub fn server_config(&self) -> Result<SessionConfig> {
        Ok(self.graph.config()?)
    }

    /// Replace the server config. A live session bound to the old target is
    /// closed in the background and the controller falls back to `Read`.
    pub fn set_server_config(&self, config: SessionConfig) -> Result<()> {
        config.validate()?;
        self.graph.set_config(config)?;
        Ok(())
    }

    /// Switch to a saved profile.
    pub fn use_profile(&self, id: &str) -> Result<ServerProfile> {
        let profiles = self.profile_store()?;
        let profile = profiles
            .get(id)?
            .ok_or_else(|| SessionError::Store(format!("no server profile with id '{id}'")))?;
        self.set_server_config(profile.config.clone())?;
        tracing::info!("using server profile '{}' ({})", profile.name, profile.id);
        Ok(profile)
    }

    /// Save the current config as a new profile.
    pub fn save_profile(&self, name: &str) -> Result<ServerProfile> {
        let profiles = self.profile_store()?;
        let profile = ServerProfile::new(name, self.server_config()?);
        profiles.set(profile.clone())?;
        Ok(profile)
    }

    pub fn profiles(&self) -> Result<Vec<ServerProfile>> {
        Ok(self.profile_store()?.list()?)
    }

    fn profile_store(&self) -> Result<&Arc<dyn ProfileStore>> {
        self.profiles.as_ref().ok_or_else(|| {
            Error::Session(SessionError::Store(
                "no profile store configured".to_string(),
            ))
        })
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// Devices offered by the server for the current config.
    pub async fn discover_devices(&self) -> Result<Vec<DeviceInfo>> {
        let config = self.server_config()?;
        Ok(self
            .provisioner
            .discover_devices(&config, &CancellationToken::new())
            .await?)
    }

    /// Discover devices and merge them into the config, keeping the selection
    /// of devices that were already known.
    pub async fn refresh_devices(&self) -> Result<SessionConfig> {
        let devices = self.discover_devices().await?;
        let merged = self.server_config()?.merge_devices(&devices);
        self.graph.set_config(merged.clone())?;
        Ok(merged)
    }

    /// Select exactly the devices in `ids`.
    pub fn select_devices(&self, ids: &[&str]) -> Result<SessionConfig> {
        let mut config = self.server_config()?;
        for device in &mut config.devices {
            device.selected = ids.contains(&device.id.as_str());
        }
        self.graph.set_config(config.clone())?;
        Ok(config)
    }

    // =========================================================================
    // Model lifecycle
    // =========================================================================

    pub async fn load_model(&self, path: impl AsRef<Path>) -> Result<ModelInfo> {
        Ok(self.controller.load_model(path).await?)
    }

    pub async fn upload_model(&self) -> Result<ModelInfo> {
        Ok(self.controller.upload_model().await?)
    }

    pub async fn close_model(&self) -> Result<()> {
        Ok(self.controller.close_model().await?)
    }

    pub fn state(&self) -> ControllerState {
        self.controller.state()
    }

    pub fn model_info(&self) -> Option<ModelInfo> {
        self.controller.model_info()
    }

    // =========================================================================
    // Inference
    // =========================================================================

    /// Run one block through the dispatcher.
    pub async fn predict(&self, block: TensorBlock) -> Result<TensorBlock> {
        let controller = self.controller.clone();
        Ok(self
            .dispatcher
            .submit(move || async move { controller.forward(block).await })
            .await?)
    }

    /// Run every block as its own request, at most `batch_size` at a time.
    ///
    /// Results are in input order. A failed block does not affect the others.
    pub async fn predict_blocks(&self, blocks: Vec<TensorBlock>) -> Vec<Result<TensorBlock>> {
        tracing::debug!("dispatching {} blocks", blocks.len());
        let tickets = self.dispatcher.submit_all(blocks, |block| {
            let controller = self.controller.clone();
            async move { controller.forward(block).await }
        });

        join_all(tickets)
            .await
            .into_iter()
            .map(|result| result.map_err(Error::from))
            .collect()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    // =========================================================================
    // Subsystem access
    // =========================================================================

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    pub fn graph(&self) -> &Arc<SessionGraph> {
        &self.graph
    }

    pub fn dispatcher(&self) -> &BatchDispatcher {
        &self.dispatcher
    }

    pub fn provisioner(&self) -> &ConnectionProvisioner {
        &self.provisioner
    }

    /// Stop accepting requests, let queued ones finish, then close the session.
    pub async fn shutdown(&self) {
        self.dispatcher.close();
        self.dispatcher.wait_idle().await;
        self.controller.shutdown().await;
        tracing::info!("remora engine shut down");
    }
}

impl std::fmt::Debug for RemoraEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoraEngine")
            .field("controller", &self.controller)
            .field("dispatch", &self.dispatcher.stats())
            .finish()
    }
}
