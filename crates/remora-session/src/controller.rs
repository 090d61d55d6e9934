//! Lifecycle of the remote model session.
//!
//! The controller owns the model artifact, the derived [`ModelInfo`] and the
//! live [`SessionHandle`]. All three are kept in one slot set behind a single
//! lock, so an observer never sees info without a session or the reverse.
//! State changes are delivered to listeners in the order they happened, one
//! listener call at a time.

use crate::artifact::{FsModelSource, ModelArtifact, ModelConfig, ModelInfo, ModelSource, TrainingState};
use crate::connection::TensorBlock;
use crate::error::{LoadStage, Result, SessionError};
use crate::graph::SessionGraph;
use crate::handle::SessionHandle;
use crate::persistence::ArtifactStore;
use crate::provisioner::{cancellable, ConnectionProvisioner};
use crate::state::{derive_state, ControllerState};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Identifies a registered state listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(ControllerState) + Send + Sync>;

#[derive(Default)]
struct Slots {
    artifact: Option<ModelArtifact>,
    info: Option<ModelInfo>,
    session: Option<Arc<SessionHandle>>,
    state: ControllerState,
    last_error: Option<String>,
    /// Bumped by every load and by shutdown. A load only publishes its
    /// session while its generation is current.
    generation: u64,
}

impl Slots {
    fn derived_state(&self) -> ControllerState {
        derive_state(
            self.info.is_some(),
            self.artifact.as_ref().is_some_and(|a| !a.is_empty()),
            self.session.is_some(),
        )
    }
}

/// A queued state notification. `only` addresses the initial callback of a
/// freshly registered listener.
struct Notice {
    seq: u64,
    state: ControllerState,
    only: Option<ListenerId>,
}

#[derive(Default)]
struct Outbox {
    queue: VecDeque<Notice>,
    next_seq: u64,
}

impl Outbox {
    fn push(&mut self, state: ControllerState, only: Option<ListenerId>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push_back(Notice { seq, state, only });
        seq
    }
}

struct Registered {
    id: ListenerId,
    /// Sequence number of the listener's initial notice; broadcasts queued
    /// before it are not delivered to it.
    since: u64,
    listener: Listener,
}

struct ControllerInner {
    graph: Arc<SessionGraph>,
    provisioner: ConnectionProvisioner,
    models: Arc<dyn ModelSource>,
    store: Option<ArtifactStore>,
    runtime: Handle,
    /// Parent of every load's cancellation token; replaced on shutdown.
    shutdown: Mutex<CancellationToken>,
    /// Woken whenever the state leaves `Provisioning`.
    settled: Notify,

    slots: Mutex<Slots>,
    /// Bumped whenever the server target is invalidated.
    target_epoch: AtomicU64,
    target_hook: remora_core::ListenerId,

    listeners: Mutex<Vec<Registered>>,
    next_listener: AtomicU64,
    outbox: Mutex<Outbox>,
    draining: AtomicBool,
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        self.graph.remove_target_listener(self.target_hook);
    }
}

/// Builder for [`SessionController`].
pub struct SessionControllerBuilder {
    graph: Arc<SessionGraph>,
    provisioner: ConnectionProvisioner,
    models: Arc<dyn ModelSource>,
    store: Option<ArtifactStore>,
    runtime: Option<Handle>,
}

impl SessionControllerBuilder {
    pub fn model_source(mut self, models: Arc<dyn ModelSource>) -> Self {
        self.models = models;
        self
    }

    /// Persist the artifact and model info on every change.
    pub fn store(mut self, store: ArtifactStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Runtime used for reacting to server-target changes. Defaults to the
    /// runtime of the calling context.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<SessionController> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| {
                SessionError::InvalidConfig(format!("no tokio runtime available: {e}"))
            })?,
        };

        let inner = Arc::new_cyclic(|weak: &Weak<ControllerInner>| {
            let weak = weak.clone();
            let target_hook = self.graph.on_target_invalidated(move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.target_epoch.fetch_add(1, Ordering::SeqCst);
                    let controller = SessionController {
                        inner: Arc::clone(&inner),
                    };
                    inner.runtime.spawn(async move {
                        controller.handle_target_change().await;
                    });
                }
            });

            ControllerInner {
                graph: self.graph,
                provisioner: self.provisioner,
                models: self.models,
                store: self.store,
                runtime,
                shutdown: Mutex::new(CancellationToken::new()),
                settled: Notify::new(),
                slots: Mutex::new(Slots::default()),
                target_epoch: AtomicU64::new(0),
                target_hook,
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                outbox: Mutex::new(Outbox::default()),
                draining: AtomicBool::new(false),
            }
        });

        Ok(SessionController { inner })
    }
}

/// Owns the remote model session and tracks its [`ControllerState`].
///
/// Cloning is cheap; clones share state and listeners.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    pub fn builder(graph: Arc<SessionGraph>, provisioner: ConnectionProvisioner) -> SessionControllerBuilder {
        SessionControllerBuilder {
            graph,
            provisioner,
            models: Arc::new(FsModelSource),
            store: None,
            runtime: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.inner.slots.lock().state
    }

    /// Model info while in `Ready` or `Read`.
    pub fn model_info(&self) -> Option<ModelInfo> {
        self.inner.slots.lock().info.clone()
    }

    pub fn artifact(&self) -> Option<ModelArtifact> {
        self.inner.slots.lock().artifact.clone()
    }

    pub fn has_session(&self) -> bool {
        self.inner.slots.lock().session.is_some()
    }

    /// Message of the last failed load or upload, cleared on success.
    pub fn last_error(&self) -> Option<String> {
        self.inner.slots.lock().last_error.clone()
    }

    pub fn graph(&self) -> &Arc<SessionGraph> {
        &self.inner.graph
    }

    pub fn provisioner(&self) -> &ConnectionProvisioner {
        &self.inner.provisioner
    }

    /// Register `listener` and call it with the current state.
    ///
    /// The initial call is queued like any transition: it happens on this
    /// thread unless another thread is delivering, and always before any later
    /// state. A listener is never called concurrently with itself.
    pub fn register_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(ControllerState) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        {
            let slots = self.inner.slots.lock();
            let since = self.inner.outbox.lock().push(slots.state, Some(id));
            self.inner.listeners.lock().push(Registered {
                id,
                since,
                listener: Arc::new(listener),
            });
        }
        self.deliver();
        id
    }

    /// Returns whether the listener was registered.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    /// Read a model from `path`, create a session for it and move to `Ready`.
    pub async fn load_model(&self, path: impl AsRef<Path>) -> Result<ModelInfo> {
        self.load_model_with(path, &CancellationToken::new()).await
    }

    /// As [`load_model`](Self::load_model), also abandoned when `cancel` fires.
    /// [`shutdown`](Self::shutdown) cancels it either way.
    pub async fn load_model_with(
        &self,
        path: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<ModelInfo> {
        let cancel = self.load_token(cancel);
        let _finished = cancel.clone().drop_guard();

        let path = path.as_ref();
        let (generation, _) = self.begin_load(false).await?;
        tracing::info!("loading model from {}", path.display());

        let bytes = match cancellable(&cancel, self.inner.models.read_model(path)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) | Err(e) => return Err(self.fail_load(generation, e)),
        };

        let artifact = ModelArtifact::new(bytes, ModelConfig::new());
        self.install(generation, artifact, &cancel).await
    }

    /// Load an in-memory artifact, as [`load_model`](Self::load_model) does for
    /// a file.
    pub async fn load_artifact(
        &self,
        artifact: ModelArtifact,
        cancel: &CancellationToken,
    ) -> Result<ModelInfo> {
        if artifact.is_empty() {
            return Err(SessionError::NoModel);
        }
        let cancel = self.load_token(cancel);
        let _finished = cancel.clone().drop_guard();

        let (generation, _) = self.begin_load(false).await?;
        self.install(generation, artifact, &cancel).await
    }

    /// Push the stored model bytes again, e.g. to a restarted server.
    pub async fn upload_model(&self) -> Result<ModelInfo> {
        self.upload_model_with(&CancellationToken::new()).await
    }

    pub async fn upload_model_with(&self, cancel: &CancellationToken) -> Result<ModelInfo> {
        let cancel = self.load_token(cancel);
        let _finished = cancel.clone().drop_guard();

        match self.begin_load(true).await? {
            (generation, Some(artifact)) => self.install(generation, artifact, &cancel).await,
            (generation, None) => Err(self.fail_load(generation, SessionError::NoModel)),
        }
    }

    /// Close the session and forget the model.
    ///
    /// Moves to `Empty`. Closing a session that is already defunct is not an
    /// error. Rejected with [`SessionError::Busy`] while a load is in progress.
    pub async fn close_model(&self) -> Result<()> {
        let session = {
            let mut slots = self.inner.slots.lock();
            if slots.state == ControllerState::Provisioning {
                return Err(SessionError::Busy);
            }
            let session = slots.session.take();
            slots.artifact = None;
            slots.info = None;
            slots.last_error = None;
            self.transition(&mut slots, ControllerState::Empty);
            session
        };
        self.deliver();

        if let Some(session) = session {
            session.close().await;
        }
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.clear() {
                tracing::warn!("failed to clear stored model: {}", e);
            }
        }
        tracing::info!("model closed");
        Ok(())
    }

    /// Install a persisted artifact without creating a session.
    ///
    /// With model info this moves to `Read`; [`upload_model`](Self::upload_model)
    /// then makes it `Ready`.
    pub async fn restore(&self, artifact: ModelArtifact, info: Option<ModelInfo>) -> Result<ControllerState> {
        let (session, state) = {
            let mut slots = self.inner.slots.lock();
            if slots.state == ControllerState::Provisioning {
                return Err(SessionError::Busy);
            }
            let session = slots.session.take();
            slots.artifact = (!artifact.is_empty()).then_some(artifact);
            slots.info = info;
            slots.last_error = None;
            let state = slots.derived_state();
            self.transition(&mut slots, state);
            (session, state)
        };
        self.deliver();

        if let Some(session) = session {
            session.close().await;
        }
        Ok(state)
    }

    /// Restore from the configured [`ArtifactStore`].
    pub async fn restore_from_store(&self) -> Result<ControllerState> {
        let store = self
            .inner
            .store
            .as_ref()
            .ok_or_else(|| SessionError::Store("no artifact store configured".to_string()))?;
        let artifact = store.load_artifact()?;
        let info = store.load_info()?;
        self.restore(artifact, info).await
    }

    /// Re-derive the state from which slots are filled and notify listeners.
    ///
    /// A no-op while a load is in progress or after a failed one; those states
    /// are only left through another load or [`close_model`](Self::close_model).
    pub fn refresh_state(&self) -> ControllerState {
        let state = {
            let mut slots = self.inner.slots.lock();
            if matches!(
                slots.state,
                ControllerState::Provisioning | ControllerState::Error
            ) {
                return slots.state;
            }
            let state = slots.derived_state();
            self.transition(&mut slots, state);
            state
        };
        self.deliver();
        state
    }

    /// Run one inference request on the live session.
    pub async fn forward(&self, input: TensorBlock) -> Result<TensorBlock> {
        let session = self.session()?;
        session.forward(input).await
    }

    pub async fn pause_training(&self) -> Result<()> {
        self.training_session()?.pause_training().await
    }

    pub async fn resume_training(&self) -> Result<()> {
        self.training_session()?.resume_training().await
    }

    /// Fetch the training state and keep it in the artifact so it is
    /// persisted with the model.
    pub async fn download_state(&self) -> Result<TrainingState> {
        let state = self.training_session()?.download_state().await?;

        let artifact = {
            let mut slots = self.inner.slots.lock();
            match slots.artifact.as_mut() {
                Some(artifact) => {
                    artifact.state = Some(state.clone());
                    Some(artifact.clone())
                }
                None => None,
            }
        };
        if let Some(artifact) = artifact {
            self.persist(&artifact, None);
        }
        Ok(state)
    }

    /// Cancel in-flight loads, close the session and wait for a load in
    /// progress to settle. The controller is `Empty` afterwards but remains
    /// usable; loads started before this returns are rejected as busy.
    pub async fn shutdown(&self) {
        std::mem::replace(&mut *self.inner.shutdown.lock(), CancellationToken::new()).cancel();
        let session = {
            let mut slots = self.inner.slots.lock();
            slots.generation += 1;
            let session = slots.session.take();
            slots.artifact = None;
            slots.info = None;
            slots.last_error = None;
            // A load in progress settles the state itself once it sees the
            // generation has moved on.
            if slots.state != ControllerState::Provisioning {
                self.transition(&mut slots, ControllerState::Empty);
            }
            session
        };
        self.deliver();

        if let Some(session) = session {
            session.close().await;
        }
        self.settled().await;
        tracing::debug!("controller shut down");
    }

    fn session(&self) -> Result<Arc<SessionHandle>> {
        self.inner
            .slots
            .lock()
            .session
            .clone()
            .ok_or(SessionError::NoSession)
    }

    fn training_session(&self) -> Result<Arc<SessionHandle>> {
        let slots = self.inner.slots.lock();
        let session = slots.session.clone().ok_or(SessionError::NoSession)?;
        match &slots.info {
            Some(info) if info.has_training => Ok(session),
            _ => Err(SessionError::protocol(
                LoadStage::Training,
                "model does not support training",
            )),
        }
    }

    /// Token for one load: a child of the shutdown token that also fires when
    /// the caller's token does. Cancel it when the load finishes.
    fn load_token(&self, cancel: &CancellationToken) -> CancellationToken {
        let token = self.inner.shutdown.lock().child_token();
        let (linked, caller) = (token.clone(), cancel.clone());
        self.inner.runtime.spawn(async move {
            tokio::select! {
                _ = caller.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });
        token
    }

    /// Resolves once no load is in progress.
    async fn settled(&self) {
        loop {
            let notified = self.inner.settled.notified();
            if self.state() != ControllerState::Provisioning {
                return;
            }
            notified.await;
        }
    }

    /// Enter `Provisioning`, dropping any current session, and return the new
    /// load generation. With `keep_artifact` the stored artifact is returned
    /// too; without one this fails with [`SessionError::NoModel`] and no
    /// transition.
    async fn begin_load(&self, keep_artifact: bool) -> Result<(u64, Option<ModelArtifact>)> {
        let (session, generation, artifact) = {
            let mut slots = self.inner.slots.lock();
            if !slots.state.accepts_load() {
                return Err(SessionError::Busy);
            }
            let artifact = if keep_artifact {
                let Some(artifact) = slots.artifact.clone().filter(|a| !a.is_empty()) else {
                    return Err(SessionError::NoModel);
                };
                Some(artifact)
            } else {
                slots.artifact = None;
                slots.info = None;
                None
            };
            slots.generation += 1;
            let session = slots.session.take();
            self.transition(&mut slots, ControllerState::Provisioning);
            (session, slots.generation, artifact)
        };
        self.deliver();

        if let Some(session) = session {
            session.close().await;
        }
        Ok((generation, artifact))
    }

    /// Provision a server, create the session and publish it.
    async fn install(
        &self,
        generation: u64,
        artifact: ModelArtifact,
        cancel: &CancellationToken,
    ) -> Result<ModelInfo> {
        let epoch = self.inner.target_epoch.load(Ordering::SeqCst);

        let target = match self.inner.graph.target() {
            Ok(target) => target,
            Err(e) => return Err(self.fail_load(generation, e)),
        };

        let server = match self.inner.provisioner.ensure_connection(&target.config, cancel).await {
            Ok(server) => server,
            Err(e) => return Err(self.fail_load(generation, e)),
        };

        let created = cancellable(
            cancel,
            server
                .connection()
                .create_model_session(&artifact, &target.device_ids),
        )
        .await;
        let session = match created {
            Ok(Ok(session)) => session,
            Ok(Err(e)) | Err(e) => {
                server.shutdown().await;
                return Err(self.fail_load(generation, e));
            }
        };

        let handle = Arc::new(SessionHandle::new(session, server));
        let info = handle.info();

        // Both checks happen under the slot lock: an invalidation after this
        // point finds the session published and closes it itself.
        let (superseded, stale, replaced) = {
            let mut slots = self.inner.slots.lock();
            let superseded = slots.generation != generation;
            let stale = self.inner.target_epoch.load(Ordering::SeqCst) != epoch;
            let replaced = if superseded {
                None
            } else {
                slots.artifact = Some(artifact.clone());
                slots.info = Some(info.clone());
                slots.last_error = None;
                if stale {
                    slots.session.take()
                } else {
                    slots.session.replace(Arc::clone(&handle))
                }
            };
            let state = slots.derived_state();
            self.transition(&mut slots, state);
            (superseded, stale, replaced)
        };
        self.deliver();

        if let Some(replaced) = replaced {
            replaced.close().await;
        }
        if superseded {
            tracing::info!("controller shut down during load, session '{}' closed", info.name);
            handle.close().await;
            return Err(SessionError::Cancelled);
        }
        if stale {
            // Keep the model, drop the session that points at the old server.
            tracing::info!("server target changed during load, session '{}' dropped", info.name);
            handle.close().await;
        } else {
            tracing::info!(
                "model '{}' ready ({} classes, training: {})",
                info.name,
                info.num_classes(),
                info.has_training
            );
        }

        self.persist(&artifact, Some(&info));
        Ok(info)
    }

    /// Record a failed load. Cancellation is not a fault, and neither is any
    /// failure of a load that shutdown has superseded: the state is re-derived
    /// instead of moving to `Error`.
    fn fail_load(&self, generation: u64, error: SessionError) -> SessionError {
        {
            let mut slots = self.inner.slots.lock();
            if error.is_cancelled() || slots.generation != generation {
                let state = slots.derived_state();
                self.transition(&mut slots, state);
            } else {
                slots.last_error = Some(error.to_string());
                self.transition(&mut slots, ControllerState::Error);
            }
        }
        self.deliver();

        if error.is_cancelled() {
            tracing::info!("model load cancelled");
        } else {
            tracing::warn!("model load failed: {}", error);
        }
        error
    }

    async fn handle_target_change(&self) {
        let session = {
            let mut slots = self.inner.slots.lock();
            if slots.state == ControllerState::Provisioning {
                // The load in progress compares the epoch before publishing.
                return;
            }
            let Some(session) = slots.session.take() else {
                return;
            };
            let state = slots.derived_state();
            self.transition(&mut slots, state);
            session
        };
        self.deliver();

        tracing::info!("server target changed, closing stale session");
        session.close().await;
    }

    fn persist(&self, artifact: &ModelArtifact, info: Option<&ModelInfo>) {
        let Some(store) = &self.inner.store else {
            return;
        };
        let saved = store
            .save_artifact(artifact)
            .and_then(|_| match info {
                Some(info) => store.save_info(Some(info)),
                None => Ok(()),
            });
        if let Err(e) = saved {
            tracing::warn!("failed to persist model: {}", e);
        }
    }

    /// Set the state and queue a notification if it changed. Must be called
    /// with the slot lock held so queued states follow transition order.
    fn transition(&self, slots: &mut Slots, state: ControllerState) {
        if slots.state == state {
            return;
        }
        tracing::debug!("controller state {} -> {}", slots.state, state);
        let settling = slots.state == ControllerState::Provisioning;
        slots.state = state;
        self.inner.outbox.lock().push(state, None);
        if settling {
            self.inner.settled.notify_waiters();
        }
    }

    /// Deliver queued notices to listeners. Only one thread delivers at a time;
    /// notices queued meanwhile are picked up by the delivering thread, which
    /// also covers transitions made from inside a listener.
    fn deliver(&self) {
        loop {
            if self.inner.draining.swap(true, Ordering::AcqRel) {
                return;
            }

            loop {
                let next = self.inner.outbox.lock().queue.pop_front();
                let Some(notice) = next else {
                    break;
                };
                let listeners: Vec<Listener> = self
                    .inner
                    .listeners
                    .lock()
                    .iter()
                    .filter(|r| match notice.only {
                        Some(id) => r.id == id,
                        None => r.since < notice.seq,
                    })
                    .map(|r| Arc::clone(&r.listener))
                    .collect();
                for listener in &listeners {
                    call_listener(listener, notice.state);
                }
            }

            self.inner.draining.store(false, Ordering::Release);
            if self.inner.outbox.lock().queue.is_empty() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.inner.slots.lock();
        f.debug_struct("SessionController")
            .field("state", &slots.state)
            .field("model", &slots.info.as_ref().map(|i| i.name.clone()))
            .field("session", &slots.session.is_some())
            .finish()
    }
}

fn call_listener(listener: &Listener, state: ControllerState) {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(state)));
    if outcome.is_err() {
        tracing::error!("state listener panicked while handling '{}'", state);
    }
}
