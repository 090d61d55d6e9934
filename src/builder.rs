//! Builder for configuring and constructing a `RemoraEngine`.

use crate::{Error, RemoraEngine, Result};
use remora_dispatch::BatchDispatcher;
use remora_session::{
    ArtifactStore, ConnectionProvisioner, LauncherFactory, ModelSource, ProfileStore,
    ProvisionerConfig, ServerConnector, SessionConfig, SessionController, SessionError,
    SessionGraph,
};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Default number of inference requests in flight at once.
pub const DEFAULT_BATCH_SIZE: usize = 4;

/// A server connector is required; everything else has a default.
///
/// # Example
///
/// ```ignore
/// use remora::prelude::*;
///
/// let engine = RemoraEngine::builder()
///     .connector(my_connector)
///     .server_config(SessionConfig::local())
///     .batch_size(8)
///     .build()?;
///
/// engine.load_model("model.zip").await?;
/// let outputs = engine.predict_blocks(blocks).await;
/// ```
pub struct RemoraEngineBuilder {
    batch_size: usize,
    connector: Option<Arc<dyn ServerConnector>>,
    launchers: Option<Arc<dyn LauncherFactory>>,
    provisioner_config: ProvisionerConfig,
    runtime: Option<Handle>,
    server_config: SessionConfig,
    model_source: Option<Arc<dyn ModelSource>>,
    store: Option<ArtifactStore>,
    profiles: Option<Arc<dyn ProfileStore>>,
}

impl Default for RemoraEngineBuilder {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            connector: None,
            launchers: None,
            provisioner_config: ProvisionerConfig::default(),
            runtime: None,
            server_config: SessionConfig::default(),
            model_source: None,
            store: None,
            profiles: None,
        }
    }
}

impl RemoraEngineBuilder {
    /// Default: 4
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn ServerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replace the stock local/SSH/null launchers.
    pub fn launchers(mut self, launchers: Arc<dyn LauncherFactory>) -> Self {
        self.launchers = Some(launchers);
        self
    }

    pub fn provisioner_config(mut self, config: ProvisionerConfig) -> Self {
        self.provisioner_config = config;
        self
    }

    /// Runtime for dispatched work and background reactions. Defaults to the
    /// runtime of the calling context.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Default: local server on ports 5556/5557 with autostart.
    pub fn server_config(mut self, config: SessionConfig) -> Self {
        self.server_config = config;
        self
    }

    /// Where model files are read from. Defaults to the filesystem.
    pub fn model_source(mut self, source: Arc<dyn ModelSource>) -> Self {
        self.model_source = Some(source);
        self
    }

    /// Persist the loaded model through `store`.
    pub fn store(mut self, store: ArtifactStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Saved server profiles, used by [`RemoraEngine::use_profile`].
    pub fn profiles(mut self, profiles: Arc<dyn ProfileStore>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn build(self) -> Result<RemoraEngine> {
        let connector = self.connector.ok_or_else(|| {
            Error::Session(SessionError::InvalidConfig(
                "no server connector configured".to_string(),
            ))
        })?;

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| {
                SessionError::InvalidConfig(format!("no tokio runtime available: {e}"))
            })?,
        };

        let provisioner = match self.launchers {
            Some(launchers) => {
                ConnectionProvisioner::new(self.provisioner_config, connector, launchers)
            }
            None => ConnectionProvisioner::with_default_launchers(self.provisioner_config, connector),
        };

        let graph = Arc::new(SessionGraph::new(self.server_config)?);

        let mut controller = SessionController::builder(Arc::clone(&graph), provisioner.clone())
            .runtime(runtime.clone());
        if let Some(source) = self.model_source {
            controller = controller.model_source(source);
        }
        if let Some(store) = self.store {
            controller = controller.store(store);
        }
        let controller = controller.build()?;

        let dispatcher = BatchDispatcher::new(self.batch_size, runtime)?;

        tracing::info!(
            "remora engine ready (batch size {}, server {})",
            self.batch_size,
            graph.config()?.address
        );

        Ok(RemoraEngine::from_parts(
            graph,
            controller,
            dispatcher,
            provisioner,
            self.profiles,
        ))
    }
}
