//! Memoized, invalidatable value with single-flight computation.
//!
//! A [`ValueNode`] is either an *input* (value set from outside) or *derived*
//! (value produced by a compute closure on first read). Derived nodes cache the
//! last successful result; concurrent readers that miss the cache share one
//! in-flight computation and observe the same value or the same error.
//!
//! Invalidation is pull-based: [`ValueNode::invalidate`] drops the cache and
//! marks every transitive dependent dirty, but nothing is recomputed until the
//! next [`ValueNode::get`].

use crate::error::{BoxError, Error, Result};
use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Serializes edge insertion so a reachability check and the insert it guards
/// cannot interleave with another wiring call.
static WIRING: Mutex<()> = parking_lot::const_mutex(());

/// Process-unique node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Type-erased view of a node, used for wiring and invalidation propagation.
pub trait Dependent: Send + Sync {
    fn id(&self) -> NodeId;

    fn name(&self) -> &str;

    /// Drop the cached value and mark all transitive dependents dirty.
    fn invalidate(&self);

    /// Live dependents (dropped dependents are skipped).
    fn dependents(&self) -> Vec<Arc<dyn Dependent>>;

    #[doc(hidden)]
    fn add_dependent(&self, dependent: Weak<dyn Dependent>);

    fn is_cached(&self) -> bool;
}

/// Callback fired after a node has been invalidated (or an input replaced).
pub type InvalidationListener = Arc<dyn Fn(NodeId) + Send + Sync>;

/// Handle for removing an invalidation listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ComputeFn<T> = Box<dyn Fn() -> std::result::Result<T, BoxError> + Send + Sync>;

enum Source<T> {
    Input,
    Derived(ComputeFn<T>),
}

/// In-flight bookkeeping, guarded by the node lock.
struct Flight<T> {
    /// Bumped on every invalidation; a computation only publishes its result if
    /// the epoch it started under is still current.
    epoch: u64,
    /// Bumped every time a computation starts.
    seq: u64,
    running: bool,
    /// Epoch the running computation started under.
    running_epoch: u64,
    /// Outcome of the most recent computation, tagged with its `seq`.
    outcome: Option<(u64, Result<Arc<T>>)>,
}

/// A single memoized, invalidatable value.
pub struct ValueNode<T> {
    id: NodeId,
    name: String,
    source: Source<T>,
    cached: ArcSwapOption<T>,
    flight: Mutex<Flight<T>>,
    done: Condvar,
    dependents: Mutex<Vec<Weak<dyn Dependent>>>,
    listeners: Mutex<Vec<(ListenerId, InvalidationListener)>>,
}

impl<T> ValueNode<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn with_source(name: impl Into<String>, source: Source<T>) -> Self {
        Self {
            id: NodeId::next(),
            name: name.into(),
            source,
            cached: ArcSwapOption::empty(),
            flight: Mutex::new(Flight {
                epoch: 0,
                seq: 0,
                running: false,
                running_epoch: 0,
                outcome: None,
            }),
            done: Condvar::new(),
            dependents: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Input node with no value yet. Reads fail with [`Error::NotReady`] until
    /// [`set`](Self::set) is called.
    pub fn input(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::with_source(name, Source::Input))
    }

    /// Input node seeded with `value`.
    pub fn input_with(name: impl Into<String>, value: T) -> Arc<Self> {
        let node = Self::with_source(name, Source::Input);
        node.cached.store(Some(Arc::new(value)));
        Arc::new(node)
    }

    /// Derived node computed lazily by `compute`.
    pub fn derived<F>(name: impl Into<String>, compute: F) -> Arc<Self>
    where
        F: Fn() -> std::result::Result<T, BoxError> + Send + Sync + 'static,
    {
        Arc::new(Self::with_source(name, Source::Derived(Box::new(compute))))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_input(&self) -> bool {
        matches!(self.source, Source::Input)
    }

    /// Cached value without triggering a computation.
    pub fn peek(&self) -> Option<T> {
        self.cached.load_full().map(|v| T::clone(&v))
    }

    /// Return the cached value, computing it first on a miss.
    ///
    /// At most one computation per node runs at a time. Callers arriving while
    /// it runs block until it finishes and receive its outcome, unless it was
    /// started before an invalidation they already observe; then they compute
    /// afresh. Failures are not cached, so the next call after a failed
    /// computation retries.
    pub fn get(&self) -> Result<T> {
        if let Some(value) = self.cached.load_full() {
            return Ok(T::clone(&value));
        }

        let compute = match &self.source {
            Source::Input => return Err(Error::NotReady(self.name.clone())),
            Source::Derived(compute) => compute,
        };

        let mut flight = self.flight.lock();
        loop {
            if let Some(value) = self.cached.load_full() {
                return Ok(T::clone(&value));
            }
            if !flight.running {
                break;
            }

            let awaited = flight.seq;
            let current = flight.running_epoch == flight.epoch;
            while flight.running && flight.seq == awaited {
                self.done.wait(&mut flight);
            }
            if !current {
                continue;
            }
            if let Some((seq, outcome)) = &flight.outcome {
                if *seq == awaited {
                    return outcome.clone().map(|v| T::clone(&v));
                }
            }
        }

        flight.seq += 1;
        flight.running = true;
        flight.running_epoch = flight.epoch;
        let seq = flight.seq;
        let epoch = flight.epoch;
        drop(flight);

        tracing::trace!("computing node '{}' ({})", self.name, self.id);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(compute));

        let mut flight = self.flight.lock();
        flight.running = false;
        let result = match outcome {
            Ok(Ok(value)) => {
                let value = Arc::new(value);
                if flight.epoch == epoch {
                    self.cached.store(Some(Arc::clone(&value)));
                } else {
                    tracing::debug!(
                        "node '{}' invalidated during computation, result not cached",
                        self.name
                    );
                }
                Ok(value)
            }
            Ok(Err(source)) => {
                tracing::debug!("node '{}' failed: {}", self.name, source);
                Err(Error::compute(&self.name, source))
            }
            Err(_) => Err(Error::compute(
                &self.name,
                "compute closure panicked".into(),
            )),
        };
        flight.outcome = Some((seq, result.clone()));
        self.done.notify_all();
        drop(flight);

        result.map(|v| T::clone(&v))
    }

    /// Replace the value of an input node wholesale and invalidate dependents.
    pub fn set(&self, value: T) -> Result<()> {
        if !self.is_input() {
            return Err(Error::InvalidConfig(format!(
                "'{}' is derived; only input nodes accept values",
                self.name
            )));
        }

        {
            let mut flight = self.flight.lock();
            flight.epoch += 1;
            self.cached.store(Some(Arc::new(value)));
        }
        self.invalidate_dependents();
        self.notify_listeners();
        Ok(())
    }

    /// Clear an input node so that reads report [`Error::NotReady`].
    pub fn clear(&self) {
        Dependent::invalidate(self);
    }

    /// Record that this node's value depends on `producer`.
    ///
    /// Fails with [`Error::CyclicDependency`] if `producer` is already a
    /// transitive dependent of this node (or the node itself).
    pub fn depends_on<U>(self: &Arc<Self>, producer: &Arc<ValueNode<U>>) -> Result<()>
    where
        U: Clone + Send + Sync + 'static,
    {
        let producer: Arc<dyn Dependent> = producer.clone();
        let consumer: Arc<dyn Dependent> = self.clone();
        link(&producer, &consumer)
    }

    /// Register a callback fired after every invalidation of this node.
    pub fn on_invalidate<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(NodeId) + Send + Sync + 'static,
    {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Returns whether the listener was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn invalidate_dependents(&self) {
        for dependent in Dependent::dependents(self) {
            dependent.invalidate();
        }
    }

    /// Listeners run without the listener lock held, so they may register or
    /// remove listeners themselves.
    fn notify_listeners(&self) {
        let listeners: Vec<InvalidationListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in &listeners {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(self.id)))
                .is_err()
            {
                tracing::error!("invalidation listener on '{}' panicked", self.name);
            }
        }
    }
}

impl<T> Dependent for ValueNode<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn invalidate(&self) {
        {
            let mut flight = self.flight.lock();
            flight.epoch += 1;
            self.cached.store(None);
        }
        self.invalidate_dependents();
        self.notify_listeners();
    }

    fn dependents(&self) -> Vec<Arc<dyn Dependent>> {
        let mut dependents = self.dependents.lock();
        dependents.retain(|d| d.strong_count() > 0);
        dependents.iter().filter_map(Weak::upgrade).collect()
    }

    fn add_dependent(&self, dependent: Weak<dyn Dependent>) {
        self.dependents.lock().push(dependent);
    }

    fn is_cached(&self) -> bool {
        self.cached.load().is_some()
    }
}

impl<T> fmt::Debug for ValueNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("cached", &self.cached.load().is_some())
            .finish()
    }
}

/// Wire `producer -> consumer`, rejecting edges that would close a cycle.
pub fn link(producer: &Arc<dyn Dependent>, consumer: &Arc<dyn Dependent>) -> Result<()> {
    let _wiring = WIRING.lock();
    if reaches(consumer, producer.id()) {
        return Err(Error::CyclicDependency {
            producer: producer.name().to_string(),
            consumer: consumer.name().to_string(),
        });
    }

    let already_linked = producer
        .dependents()
        .iter()
        .any(|d| d.id() == consumer.id());
    if !already_linked {
        producer.add_dependent(Arc::downgrade(consumer));
    }
    Ok(())
}

/// True if `target` is `from` or one of its transitive dependents.
fn reaches(from: &Arc<dyn Dependent>, target: NodeId) -> bool {
    let mut visited = HashSet::new();
    let mut stack = vec![Arc::clone(from)];

    while let Some(node) = stack.pop() {
        if node.id() == target {
            return true;
        }
        if !visited.insert(node.id()) {
            continue;
        }
        stack.extend(node.dependents());
    }

    false
}
