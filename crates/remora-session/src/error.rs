//! Error types for session provisioning and lifecycle.

use thiserror::Error;

/// Step of provisioning or model loading at which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Resolving,
    Launching,
    Connecting,
    DeviceQuery,
    ReadingModel,
    CreatingSession,
    Inference,
    Training,
}

impl std::fmt::Display for LoadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadStage::Resolving => write!(f, "resolving address"),
            LoadStage::Launching => write!(f, "launching server"),
            LoadStage::Connecting => write!(f, "connecting"),
            LoadStage::DeviceQuery => write!(f, "querying devices"),
            LoadStage::ReadingModel => write!(f, "reading model"),
            LoadStage::CreatingSession => write!(f, "creating session"),
            LoadStage::Inference => write!(f, "running inference"),
            LoadStage::Training => write!(f, "controlling training"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Server unreachable at {endpoint}: {reason}")]
    Connectivity { endpoint: String, reason: String },

    #[error("Timeout after {duration_ms}ms: {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    #[error("Failed to launch server via {launcher}: {reason}")]
    LaunchFailed { launcher: String, reason: String },

    #[error("Server rejected request at {stage} stage: {reason}")]
    Protocol { stage: LoadStage, reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("A model load is already in progress")]
    Busy,

    #[error("No model loaded")]
    NoModel,

    #[error("No live session")]
    NoSession,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Graph error: {0}")]
    Graph(#[from] remora_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    pub fn protocol(stage: LoadStage, reason: impl Into<String>) -> Self {
        SessionError::Protocol {
            stage,
            reason: reason.into(),
        }
    }

    pub fn connectivity(endpoint: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        SessionError::Connectivity {
            endpoint: endpoint.to_string(),
            reason: reason.into(),
        }
    }

    /// Unreachable endpoint, expired timeout or launcher failure.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            SessionError::Connectivity { .. }
                | SessionError::Timeout { .. }
                | SessionError::LaunchFailed { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SessionError::Cancelled)
    }

    /// Errors raised while wiring or configuring, as opposed to runtime faults.
    pub fn is_config_error(&self) -> bool {
        match self {
            SessionError::InvalidConfig(_) => true,
            SessionError::Graph(e) => e.is_config_error(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
