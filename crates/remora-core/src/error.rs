//! Error types for remora-core.

use std::sync::Arc;
use thiserror::Error;

/// Boxed error returned by node compute closures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type for graph wiring and evaluation.
///
/// `Clone` so that every waiter on a shared in-flight computation can be handed
/// the same failure.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Cyclic dependency: wiring {producer} -> {consumer} closes a cycle")]
    CyclicDependency { producer: String, consumer: String },

    #[error("Node '{0}' has no value")]
    NotReady(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Computing '{node}' failed: {source}")]
    Compute {
        node: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl Error {
    pub(crate) fn compute(node: &str, source: BoxError) -> Self {
        Error::Compute {
            node: node.to_string(),
            source: Arc::from(source),
        }
    }

    /// Wiring errors are fatal; everything else can be retried.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig(_) | Error::CyclicDependency { .. } | Error::UnknownNode(_)
        )
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
