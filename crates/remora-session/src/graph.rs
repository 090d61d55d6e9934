//! Server target derived from the current session config.

use crate::config::{LaunchKind, SessionConfig};
use crate::error::Result;
use remora_core::{ComputationGraph, ListenerId, NodeId, ValueNode};
use std::sync::Arc;

pub const CONFIG_NODE: &str = "server_config";
pub const TARGET_NODE: &str = "server_target";

/// What a session is created against: a validated config, how its server is
/// launched and which devices it runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTarget {
    pub config: SessionConfig,
    pub launch_kind: LaunchKind,
    pub device_ids: Vec<String>,
}

impl ServerTarget {
    fn derive(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            launch_kind: config.launch_kind(),
            device_ids: config.selected_device_ids(),
            config,
        })
    }
}

/// `server_config` (input) -> `server_target` (derived).
///
/// Replacing the config invalidates the target; it is re-derived lazily on the
/// next [`target`](Self::target) call.
pub struct SessionGraph {
    graph: ComputationGraph,
    config: Arc<ValueNode<SessionConfig>>,
    target: Arc<ValueNode<ServerTarget>>,
}

impl SessionGraph {
    pub fn new(config: SessionConfig) -> Result<Self> {
        let graph = ComputationGraph::new();
        let config_node = graph.input_with(CONFIG_NODE, config)?;

        let source = Arc::clone(&config_node);
        let target = graph.derive(TARGET_NODE, &[CONFIG_NODE], move || {
            Ok(ServerTarget::derive(source.get()?)?)
        })?;

        Ok(Self {
            graph,
            config: config_node,
            target,
        })
    }

    pub fn config(&self) -> Result<SessionConfig> {
        Ok(self.config.get()?)
    }

    /// Replace the config wholesale. Downstream values go dirty.
    pub fn set_config(&self, config: SessionConfig) -> Result<()> {
        if self.config.peek().as_ref() == Some(&config) {
            return Ok(());
        }
        tracing::debug!("server config replaced ({})", config.address);
        self.config.set(config)?;
        Ok(())
    }

    /// The current target, deriving it if the config changed.
    pub fn target(&self) -> Result<ServerTarget> {
        Ok(self.target.get()?)
    }

    pub fn is_target_current(&self) -> bool {
        self.target.peek().is_some()
    }

    /// Called each time the target is invalidated.
    pub fn on_target_invalidated<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(NodeId) + Send + Sync + 'static,
    {
        self.target.on_invalidate(listener)
    }

    pub fn remove_target_listener(&self, id: ListenerId) -> bool {
        self.target.remove_listener(id)
    }

    pub fn target_listener_count(&self) -> usize {
        self.target.listener_count()
    }

    pub fn graph(&self) -> &ComputationGraph {
        &self.graph
    }
}

impl std::fmt::Debug for SessionGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGraph")
            .field("config", &self.config.peek())
            .field("target_current", &self.is_target_current())
            .finish()
    }
}
