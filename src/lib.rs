//! # Remora - Remote Inference Client
//!
//! Client-side plumbing for running models on a remote inference server.
//!
//! ## Architecture
//!
//! Remora is an umbrella crate that coordinates:
//! - **remora-core** - Lazily evaluated, dependency-tracked values (ValueNode, ComputationGraph)
//! - **remora-session** - Server provisioning, model loading and session state (SessionController)
//! - **remora-dispatch** - Bounded-concurrency request dispatch (BatchDispatcher)
//!
//! ## Quick Start
//!
//! ```ignore
//! use remora::prelude::*;
//!
//! let engine = RemoraEngine::builder()
//!     .connector(connector)
//!     .server_config(SessionConfig::local())
//!     .build()?;
//!
//! engine.controller().register_listener(|state| println!("{state}"));
//! engine.load_model("model.zip").await?;
//!
//! let outputs = engine.predict_blocks(blocks).await;
//! engine.close_model().await?;
//! ```

/// Re-export of remora-core for direct access
pub use remora_core as core;

/// Re-export of remora-session
pub use remora_session as session;

/// Re-export of remora-dispatch
pub use remora_dispatch as dispatch;

pub use remora_core::{ComputationGraph, NodeId, ValueNode};

pub use remora_session::{
    derive_state, ArtifactStore, ConnectionProvisioner, ControllerState, DeviceInfo, LaunchKind,
    ListenerId, ModelArtifact, ModelInfo, ProvisionerConfig, RemoteModelSession, ServerConnection,
    ServerConnector, ServerProfile, SessionConfig, SessionController, SessionError, SessionGraph,
    TensorBlock,
};

pub use remora_dispatch::{join_all, BatchDispatcher, BatchTicket, DispatchError, DispatchStats};

mod builder;
mod engine;
mod error;

pub use builder::{RemoraEngineBuilder, DEFAULT_BATCH_SIZE};
pub use engine::RemoraEngine;
pub use error::{Error, Result};

/// Common imports for application code.
pub mod prelude {
    pub use crate::{
        ControllerState, DeviceInfo, Error, ModelInfo, RemoraEngine, RemoraEngineBuilder, Result,
        ServerConnector, SessionConfig, SessionError, TensorBlock,
    };
    pub use tokio_util::sync::CancellationToken;
}
