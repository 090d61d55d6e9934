//! Remote inference sessions: provisioning a server, loading a model onto it,
//! and tracking where that session stands.
//!
//! # Primary API
//!
//! - [`SessionController`]: owns the model artifact and the live session,
//!   reports [`ControllerState`] changes to listeners
//! - [`ConnectionProvisioner`]: resolves, launches and connects to servers,
//!   always stopping what it started
//! - [`SessionGraph`]: the server config as a graph input with the derived
//!   [`ServerTarget`]
//!
//! The wire protocol is not part of this crate. Implement [`ServerConnector`],
//! [`ServerConnection`] and [`RemoteModelSession`] for the server in use.
//!
//! # Example
//!
//! ```no_run
//! use remora_session::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run(connector: Arc<dyn ServerConnector>) -> remora_session::Result<()> {
//! let graph = Arc::new(SessionGraph::new(SessionConfig::local())?);
//! let provisioner =
//!     ConnectionProvisioner::with_default_launchers(ProvisionerConfig::default(), connector);
//!
//! let controller = SessionController::builder(graph, provisioner).build()?;
//! controller.register_listener(|state| println!("state: {state}"));
//!
//! let info = controller.load_model("model.zip").await?;
//! println!("{} classes", info.num_classes());
//! controller.close_model().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub use error::{LoadStage, Result, SessionError};

pub mod config;
pub use config::{
    is_local_address, Device, DeviceInfo, LaunchKind, ProvisionerConfig, ServerEndpoint,
    SessionConfig, SshCredentials, DEFAULT_PRIMARY_PORT, DEFAULT_SECONDARY_PORT,
};

mod artifact;
pub use artifact::{FsModelSource, ModelArtifact, ModelConfig, ModelInfo, ModelSource, TrainingState};

pub mod persistence;
pub use persistence::{ArtifactStore, BlobStore, DirBlobStore, MemoryBlobStore};

pub mod profiles;
pub use profiles::{MemoryProfileStore, ProfileStore, ServerProfile, TomlProfileStore};

mod connection;
pub use connection::{RemoteModelSession, ServerConnection, ServerConnector, TensorBlock};

pub mod launcher;
pub use launcher::{
    DefaultLauncherFactory, LauncherFactory, LocalLauncher, NullLauncher, ServerLauncher,
    SshLauncher,
};

mod provisioner;
pub use provisioner::{ConnectionProvisioner, ProvisionedServer};

mod handle;
pub use handle::SessionHandle;

mod state;
pub use state::{derive_state, ControllerState};

mod graph;
pub use graph::{ServerTarget, SessionGraph, CONFIG_NODE, TARGET_NODE};

mod controller;
pub use controller::{ListenerId, SessionController, SessionControllerBuilder};

pub mod prelude {
    pub use crate::{
        ArtifactStore, ConnectionProvisioner, ControllerState, DeviceInfo, LaunchKind,
        ModelArtifact, ModelInfo, ProvisionerConfig, RemoteModelSession, ServerConnection,
        ServerConnector, SessionConfig, SessionController, SessionError, SessionGraph,
        TensorBlock,
    };
}
