//! Bounded-concurrency dispatcher.
//!
//! Items queue in FIFO order. A pump moves queued items into the running set
//! while fewer than `batch_size` are in flight; it runs on every submit and on
//! every completion, so no poller task is needed and completion never recurses
//! into the previous item's stack.

use crate::error::DispatchError;
use crate::ticket::BatchTicket;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};

/// A queued unit of work, type-erased over its result type.
trait Job: Send {
    fn start(self: Box<Self>) -> BoxFuture<'static, ()>;

    /// Resolve the ticket without running the worker.
    fn cancel(self: Box<Self>);
}

struct WorkItem<F, T, E> {
    worker: F,
    reply: oneshot::Sender<Result<T, DispatchError<E>>>,
}

impl<F, Fut, T, E> Job for WorkItem<F, T, E>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    fn start(self: Box<Self>) -> BoxFuture<'static, ()> {
        let WorkItem { worker, reply } = *self;
        async move {
            let outcome = AssertUnwindSafe(async move { worker().await })
                .catch_unwind()
                .await;
            let result = match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(DispatchError::Worker(e)),
                Err(_) => {
                    tracing::error!("dispatched worker panicked");
                    Err(DispatchError::Panicked)
                }
            };
            // The caller may have dropped its ticket.
            let _ = reply.send(result);
        }
        .boxed()
    }

    fn cancel(self: Box<Self>) {
        let _ = self.reply.send(Err(DispatchError::Cancelled));
    }
}

#[derive(Default)]
struct PumpState {
    in_flight: usize,
    pending: VecDeque<Box<dyn Job>>,
    closed: bool,
    submitted: u64,
    completed: u64,
}

struct Inner {
    batch_size: usize,
    state: Mutex<PumpState>,
    runtime: Handle,
    idle: Notify,
}

/// Snapshot of dispatcher counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchStats {
    pub in_flight: usize,
    pub queued: usize,
    pub submitted: u64,
    pub completed: u64,
    pub closed: bool,
}

/// Runs submitted workers with at most `batch_size` in flight.
///
/// "Batch" bounds concurrency only: every submission is its own worker call and
/// gets its own [`BatchTicket`]. A failing or panicking worker resolves only its
/// own ticket.
///
/// Cloning is cheap; clones share the queue and the in-flight bound.
#[derive(Clone)]
pub struct BatchDispatcher {
    inner: Arc<Inner>,
}

impl BatchDispatcher {
    /// Create a dispatcher that spawns workers on `runtime`.
    pub fn new(batch_size: usize, runtime: Handle) -> Result<Self, DispatchError> {
        if batch_size == 0 {
            return Err(DispatchError::InvalidConfig(
                "batch size must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                batch_size,
                state: Mutex::new(PumpState::default()),
                runtime,
                idle: Notify::new(),
            }),
        })
    }

    /// Create a dispatcher on the runtime of the calling context.
    pub fn on_current_runtime(batch_size: usize) -> Result<Self, DispatchError> {
        let runtime = Handle::try_current().map_err(|e| {
            DispatchError::InvalidConfig(format!("no tokio runtime available: {e}"))
        })?;
        Self::new(batch_size, runtime)
    }

    pub fn batch_size(&self) -> usize {
        self.inner.batch_size
    }

    /// Queue `worker` and return its ticket. Never blocks.
    ///
    /// After [`close`](Self::close) the returned ticket is already resolved to
    /// [`DispatchError::Closed`].
    pub fn submit<F, Fut, T, E>(&self, worker: F) -> BatchTicket<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                tracing::debug!("rejecting submission to closed dispatcher");
                return BatchTicket::rejected(DispatchError::Closed);
            }
            state.submitted += 1;
            state
                .pending
                .push_back(Box::new(WorkItem { worker, reply }));
        }

        pump(&self.inner);
        BatchTicket::new(rx)
    }

    /// Submit one worker per item, built by `make_worker`.
    pub fn submit_all<I, F, Fut, T, E>(&self, items: I, make_worker: F) -> Vec<BatchTicket<T, E>>
    where
        I: IntoIterator,
        F: Fn(I::Item) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        items
            .into_iter()
            .map(|item| {
                let fut = make_worker(item);
                self.submit(move || fut)
            })
            .collect()
    }

    /// Stop accepting submissions. Queued and running items still complete.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if !state.closed {
            tracing::debug!(
                "closing dispatcher ({} queued, {} in flight)",
                state.pending.len(),
                state.in_flight
            );
            state.closed = true;
        }
    }

    /// Close and resolve every queued item to [`DispatchError::Cancelled`].
    ///
    /// Items already running are left to finish. Returns how many queued
    /// items were cancelled.
    pub fn abort(&self) -> usize {
        let cancelled: Vec<Box<dyn Job>> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let drained: Vec<_> = state.pending.drain(..).collect();
            state.completed += drained.len() as u64;
            drained
        };

        let count = cancelled.len();
        if count > 0 {
            tracing::debug!("aborting dispatcher, cancelling {} queued items", count);
        }
        for job in cancelled {
            job.cancel();
        }
        self.notify_if_idle();
        count
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.in_flight == 0 && state.pending.is_empty()
    }

    pub fn stats(&self) -> DispatchStats {
        let state = self.inner.state.lock();
        DispatchStats {
            in_flight: state.in_flight,
            queued: state.pending.len(),
            submitted: state.submitted,
            completed: state.completed,
            closed: state.closed,
        }
    }

    /// Resolve once nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    fn notify_if_idle(&self) {
        if self.is_idle() {
            self.inner.idle.notify_waiters();
        }
    }
}

impl std::fmt::Debug for BatchDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchDispatcher")
            .field("batch_size", &self.inner.batch_size)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Start queued jobs while capacity remains. Jobs are spawned outside the lock.
fn pump(inner: &Arc<Inner>) {
    let mut ready = Vec::new();
    {
        let mut state = inner.state.lock();
        while state.in_flight < inner.batch_size {
            match state.pending.pop_front() {
                Some(job) => {
                    state.in_flight += 1;
                    ready.push(job);
                }
                None => break,
            }
        }
    }

    for job in ready {
        let runtime = inner.runtime.clone();
        let inner = Arc::clone(inner);
        let work = job.start();
        runtime.spawn(async move {
            work.await;
            complete(&inner);
        });
    }
}

fn complete(inner: &Arc<Inner>) {
    let idle = {
        let mut state = inner.state.lock();
        state.in_flight -= 1;
        state.completed += 1;
        state.in_flight == 0 && state.pending.is_empty()
    };

    if idle {
        inner.idle.notify_waiters();
    } else {
        pump(inner);
    }
}
