//! Per-item result futures.

use crate::error::DispatchError;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Completion of one submitted item.
///
/// Resolves exactly once, independently of every other ticket. If the item is
/// dropped without running (runtime shut down, dispatcher aborted) the ticket
/// resolves to [`DispatchError::Cancelled`] rather than pending forever.
#[must_use = "a ticket does nothing unless awaited"]
pub struct BatchTicket<T, E> {
    rx: oneshot::Receiver<Result<T, DispatchError<E>>>,
}

impl<T, E> BatchTicket<T, E> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T, DispatchError<E>>>) -> Self {
        Self { rx }
    }

    /// Ticket that is already resolved to `error`.
    pub(crate) fn rejected(error: DispatchError<E>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self { rx }
    }

    /// Non-blocking check; `None` while the item is still queued or running.
    pub fn try_result(&mut self) -> Option<Result<T, DispatchError<E>>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(DispatchError::Cancelled)),
        }
    }
}

impl<T, E> Future for BatchTicket<T, E> {
    type Output = Result<T, DispatchError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(DispatchError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T, E> std::fmt::Debug for BatchTicket<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchTicket").finish_non_exhaustive()
    }
}

/// Wait for every ticket. Results are returned in the order the tickets were
/// given, regardless of completion order.
pub async fn join_all<T, E, I>(tickets: I) -> Vec<Result<T, DispatchError<E>>>
where
    I: IntoIterator<Item = BatchTicket<T, E>>,
{
    futures::future::join_all(tickets).await
}
