//! Centralized error type for the remora umbrella crate.
//!
//! Wraps all subsystem errors so `?` propagates naturally across crate boundaries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Graph(#[from] remora_core::Error),

    #[error("Session: {0}")]
    Session(#[from] remora_session::SessionError),

    #[error("Dispatch: {0}")]
    Dispatch(#[from] remora_dispatch::DispatchError<remora_session::SessionError>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<remora_dispatch::DispatchError> for Error {
    fn from(err: remora_dispatch::DispatchError) -> Self {
        Error::Dispatch(err.cast())
    }
}

impl Error {
    /// The session error behind this failure, whether it surfaced directly or
    /// from a dispatched worker.
    pub fn session_error(&self) -> Option<&remora_session::SessionError> {
        match self {
            Error::Session(e) => Some(e),
            Error::Dispatch(e) => e.worker_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
