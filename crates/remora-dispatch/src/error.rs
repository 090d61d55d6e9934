//! Error types for the dispatcher.

use std::convert::Infallible;
use thiserror::Error;

/// Outcome of a dispatched item that did not produce a value.
///
/// `E` is the worker's own error type; dispatcher-level failures never depend
/// on it, which is why construction errors use the `Infallible` default.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError<E = Infallible> {
    #[error("Worker failed: {0}")]
    Worker(E),

    #[error("Dispatcher closed")]
    Closed,

    #[error("Dispatch cancelled")]
    Cancelled,

    #[error("Worker panicked")]
    Panicked,

    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

impl<E> DispatchError<E> {
    /// The worker's error, if this failure came from the worker itself.
    pub fn worker_error(&self) -> Option<&E> {
        match self {
            DispatchError::Worker(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_worker_error(self) -> Option<E> {
        match self {
            DispatchError::Worker(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DispatchError::Cancelled)
    }

    pub fn map_worker<F, E2>(self, f: F) -> DispatchError<E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            DispatchError::Worker(e) => DispatchError::Worker(f(e)),
            DispatchError::Closed => DispatchError::Closed,
            DispatchError::Cancelled => DispatchError::Cancelled,
            DispatchError::Panicked => DispatchError::Panicked,
            DispatchError::InvalidConfig(msg) => DispatchError::InvalidConfig(msg),
        }
    }
}

impl DispatchError {
    /// Widen a dispatcher-level error to any worker error type.
    pub fn cast<E>(self) -> DispatchError<E> {
        self.map_worker(|never| match never {})
    }
}

pub type Result<T, E = Infallible> = std::result::Result<T, DispatchError<E>>;
