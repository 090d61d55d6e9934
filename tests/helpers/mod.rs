//! Test helpers and fixtures for Remora integration tests
//!
//! An in-process fake inference server: [`MockConnector`] hands out
//! [`MockConnection`]s whose sessions double every input value, and
//! [`CountingLaunchers`] records how often servers were started and stopped.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use remora::prelude::*;
use remora::session::{
    LauncherFactory, ModelArtifact, ModelSource, RemoteModelSession, ServerConnection,
    ServerEndpoint, ServerLauncher, TrainingState,
};
use remora::LaunchKind;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

/// Model code that the fake server refuses to create a session for.
pub const REJECTED_MODEL: &[u8] = b"rejected";

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Shared counters of everything the fake server saw.
#[derive(Default)]
pub struct ServerLog {
    pub connects: AtomicUsize,
    pub sessions: AtomicUsize,
    pub closes: AtomicUsize,
    pub forwards: AtomicUsize,
    pub running: AtomicUsize,
    pub peak_running: AtomicUsize,
    pub endpoints: Mutex<Vec<ServerEndpoint>>,
}

impl ServerLog {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct MockConnector {
    pub log: Arc<ServerLog>,
    pub devices: Vec<DeviceInfo>,
    pub forward_delay: Duration,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            log: Arc::new(ServerLog::default()),
            devices: vec![
                DeviceInfo::new("cpu", "CPU"),
                DeviceInfo::new("cuda:0", "GeForce RTX"),
            ],
            forward_delay: Duration::ZERO,
        }
    }

    pub fn with_forward_delay(mut self, delay: Duration) -> Self {
        self.forward_delay = delay;
        self
    }
}

#[async_trait]
impl ServerConnector for MockConnector {
    async fn connect(&self, endpoint: ServerEndpoint) -> remora::session::Result<Arc<dyn ServerConnection>> {
        self.log.connects.fetch_add(1, Ordering::SeqCst);
        self.log.endpoints.lock().push(endpoint);
        Ok(Arc::new(MockConnection {
            connector: self.clone(),
        }))
    }
}

pub struct MockConnection {
    connector: MockConnector,
}

#[async_trait]
impl ServerConnection for MockConnection {
    async fn available_devices(&self) -> remora::session::Result<Vec<DeviceInfo>> {
        Ok(self.connector.devices.clone())
    }

    async fn create_model_session(
        &self,
        artifact: &ModelArtifact,
        device_ids: &[String],
    ) -> remora::session::Result<Box<dyn RemoteModelSession>> {
        if artifact.code == REJECTED_MODEL {
            return Err(SessionError::protocol(
                remora::session::LoadStage::CreatingSession,
                "unsupported model",
            ));
        }
        self.connector.log.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            name: String::from_utf8_lossy(&artifact.code).into_owned(),
            devices: device_ids.to_vec(),
            log: Arc::clone(&self.connector.log),
            delay: self.connector.forward_delay,
        }))
    }
}

pub struct MockSession {
    name: String,
    devices: Vec<String>,
    log: Arc<ServerLog>,
    delay: Duration,
}

#[async_trait]
impl RemoteModelSession for MockSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn known_classes(&self) -> Vec<u32> {
        vec![1, 2]
    }

    fn has_training(&self) -> bool {
        true
    }

    /// Doubles every value. Inconsistent blocks are rejected.
    async fn forward(&self, input: TensorBlock) -> remora::session::Result<TensorBlock> {
        let running = self.log.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.peak_running.fetch_max(running, Ordering::SeqCst);
        self.log.forwards.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.log.running.fetch_sub(1, Ordering::SeqCst);

        if !input.is_consistent() {
            return Err(SessionError::protocol(
                remora::session::LoadStage::Inference,
                format!("shape {:?} does not match {} values", input.shape, input.data.len()),
            ));
        }
        Ok(TensorBlock::new(
            input.shape,
            input.data.into_iter().map(|v| v * 2.0).collect(),
        ))
    }

    async fn pause_training(&self) -> remora::session::Result<()> {
        Ok(())
    }

    async fn resume_training(&self) -> remora::session::Result<()> {
        Ok(())
    }

    async fn download_state(&self) -> remora::session::Result<TrainingState> {
        Ok(TrainingState {
            model: self.devices.join(",").into_bytes(),
            optimizer: Vec::new(),
        })
    }

    async fn close(&self) -> remora::session::Result<()> {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct LaunchLog {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

/// Launchers that only count calls.
#[derive(Default, Clone)]
pub struct CountingLaunchers {
    pub log: Arc<LaunchLog>,
}

struct CountingLauncher {
    kind: LaunchKind,
    log: Arc<LaunchLog>,
}

#[async_trait]
impl ServerLauncher for CountingLauncher {
    fn kind(&self) -> LaunchKind {
        self.kind
    }

    fn describe(&self) -> String {
        format!("counting {:?} launcher", self.kind)
    }

    async fn start(&self) -> remora::session::Result<()> {
        self.log.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> remora::session::Result<()> {
        self.log.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl LauncherFactory for CountingLaunchers {
    fn launcher(
        &self,
        config: &SessionConfig,
        _endpoint: ServerEndpoint,
    ) -> remora::session::Result<Box<dyn ServerLauncher>> {
        Ok(Box::new(CountingLauncher {
            kind: config.launch_kind(),
            log: Arc::clone(&self.log),
        }))
    }
}

/// Serves model bytes equal to the file name, without touching the disk.
pub struct NameAsModel;

#[async_trait]
impl ModelSource for NameAsModel {
    async fn read_model(&self, path: &Path) -> remora::session::Result<Vec<u8>> {
        Ok(path.to_string_lossy().into_owned().into_bytes())
    }
}

/// A loopback config, so no name resolution leaves the machine.
pub fn loopback_config() -> SessionConfig {
    SessionConfig {
        address: "127.0.0.1".to_string(),
        ..SessionConfig::default()
    }
}

pub struct TestEngine {
    pub engine: RemoraEngine,
    pub server: Arc<ServerLog>,
    pub launches: Arc<LaunchLog>,
}

/// Engine wired to the fake server with the given dispatch bound.
pub fn test_engine(batch_size: usize, connector: MockConnector) -> TestEngine {
    init_tracing();
    let launchers = CountingLaunchers::default();
    let server = Arc::clone(&connector.log);
    let launches = Arc::clone(&launchers.log);

    let engine = RemoraEngine::builder()
        .connector(Arc::new(connector))
        .launchers(Arc::new(launchers))
        .model_source(Arc::new(NameAsModel))
        .server_config(loopback_config())
        .batch_size(batch_size)
        .build()
        .expect("Failed to create test engine");

    TestEngine {
        engine,
        server,
        launches,
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// `count` consistent blocks of `len` values, block `i` filled with `i`.
pub fn blocks(count: usize, len: usize) -> Vec<TensorBlock> {
    (0..count)
        .map(|i| TensorBlock::new(vec![len], vec![i as f32; len]))
        .collect()
}
