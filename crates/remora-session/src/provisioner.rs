//! Making a server reachable: resolve, launch, connect, clean up.

use crate::config::{DeviceInfo, ProvisionerConfig, ServerEndpoint, SessionConfig};
use crate::connection::{ServerConnection, ServerConnector};
use crate::error::{LoadStage, Result, SessionError};
use crate::launcher::{DefaultLauncherFactory, LauncherFactory, ServerLauncher};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Upper bound on stopping a launcher once its deadline has passed.
const STOP_GRACE: Duration = Duration::from_millis(500);

/// A connection together with the launcher that started its server.
///
/// The launcher is stopped by [`shutdown`](Self::shutdown). Dropping without
/// shutting down leaves process cleanup to the launcher's own drop.
pub struct ProvisionedServer {
    endpoint: ServerEndpoint,
    connection: Arc<dyn ServerConnection>,
    launcher: Box<dyn ServerLauncher>,
    stop_timeout: Duration,
}

impl ProvisionedServer {
    pub fn endpoint(&self) -> ServerEndpoint {
        self.endpoint
    }

    pub fn connection(&self) -> &Arc<dyn ServerConnection> {
        &self.connection
    }

    /// Stop the launcher. Never fails; stop errors are logged.
    pub async fn shutdown(&self) {
        stop_quietly(self.launcher.as_ref(), self.stop_timeout).await;
    }
}

impl std::fmt::Debug for ProvisionedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionedServer")
            .field("endpoint", &self.endpoint)
            .field("launcher", &self.launcher.describe())
            .finish()
    }
}

/// Resolves endpoints, starts servers and opens connections.
#[derive(Clone)]
pub struct ConnectionProvisioner {
    config: ProvisionerConfig,
    connector: Arc<dyn ServerConnector>,
    launchers: Arc<dyn LauncherFactory>,
}

impl ConnectionProvisioner {
    pub fn new(
        config: ProvisionerConfig,
        connector: Arc<dyn ServerConnector>,
        launchers: Arc<dyn LauncherFactory>,
    ) -> Self {
        Self {
            config,
            connector,
            launchers,
        }
    }

    /// Provisioner with the stock local/SSH/null launchers.
    pub fn with_default_launchers(
        config: ProvisionerConfig,
        connector: Arc<dyn ServerConnector>,
    ) -> Self {
        let launchers = Arc::new(DefaultLauncherFactory::new(config.clone()));
        Self::new(config, connector, launchers)
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Validate `config` and resolve its address.
    pub async fn resolve(&self, config: &SessionConfig) -> Result<ServerEndpoint> {
        config.validate()?;

        let host = config.address.trim().trim_start_matches('[').trim_end_matches(']');
        let timeout = self.config.connect_timeout();
        let lookup = tokio::time::timeout(
            timeout,
            tokio::net::lookup_host((host, config.primary_port)),
        )
        .await
        .map_err(|_| SessionError::Timeout {
            operation: format!("resolve {host}"),
            duration_ms: self.config.connect_timeout_ms,
        })?
        .map_err(|e| SessionError::connectivity(host, format!("{}: {}", LoadStage::Resolving, e)))?;

        let addrs: Vec<SocketAddr> = lookup.collect();
        let addr = addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .ok_or_else(|| SessionError::connectivity(host, "no addresses found"))?;

        Ok(ServerEndpoint {
            ip: addr.ip(),
            primary_port: config.primary_port,
            secondary_port: config.secondary_port,
        })
    }

    /// Start a throwaway server (if autostart is on), list its devices and
    /// stop it again.
    ///
    /// The probe server listens on ports shifted by `control_port_shift` so it
    /// cannot collide with the real server. Resolving, starting, connecting
    /// and listing share one connect-timeout deadline. The launcher is stopped
    /// exactly once whatever the outcome; a stop failure is logged and never
    /// replaces the primary result.
    pub async fn discover_devices(
        &self,
        config: &SessionConfig,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeviceInfo>> {
        let deadline = Instant::now() + self.config.connect_timeout();
        let endpoint = tokio::time::timeout_at(deadline, self.resolve(config))
            .await
            .map_err(|_| self.timed_out(format!("resolve {}", config.address)))??;
        let probe = if config.autostart {
            endpoint.shifted(self.config.control_port_shift)?
        } else {
            endpoint
        };

        let launcher = self.launchers.launcher(config, probe)?;
        tracing::debug!("discovering devices via {}", launcher.describe());

        let work = async {
            let connection = self.start_and_connect(launcher.as_ref(), probe, cancel).await?;
            let devices = self
                .bounded(cancel, "query devices", connection.available_devices())
                .await??;
            Ok::<_, SessionError>(devices)
        };
        let outcome = match tokio::time::timeout_at(deadline, work).await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.timed_out(format!("discover devices at {probe}"))),
        };

        let stop_budget = deadline.saturating_duration_since(Instant::now()).max(STOP_GRACE);
        stop_quietly(launcher.as_ref(), stop_budget).await;

        match &outcome {
            Ok(devices) => tracing::info!("found {} devices at {}", devices.len(), probe),
            Err(e) => tracing::warn!("device discovery at {} failed: {}", probe, e),
        }
        outcome
    }

    /// Alias for [`discover_devices`](Self::discover_devices).
    pub async fn provision(
        &self,
        config: &SessionConfig,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeviceInfo>> {
        self.discover_devices(config, cancel).await
    }

    /// Start the server for `config` (if needed) and connect to it.
    ///
    /// On failure the launcher has already been stopped. On success the
    /// returned [`ProvisionedServer`] owns it.
    pub async fn ensure_connection(
        &self,
        config: &SessionConfig,
        cancel: &CancellationToken,
    ) -> Result<ProvisionedServer> {
        let endpoint = self.resolve(config).await?;
        let launcher = self.launchers.launcher(config, endpoint)?;

        match self.start_and_connect(launcher.as_ref(), endpoint, cancel).await {
            Ok(connection) => Ok(ProvisionedServer {
                endpoint,
                connection,
                launcher,
                stop_timeout: self.config.connect_timeout(),
            }),
            Err(e) => {
                stop_quietly(launcher.as_ref(), self.config.connect_timeout()).await;
                Err(e)
            }
        }
    }

    async fn start_and_connect(
        &self,
        launcher: &dyn ServerLauncher,
        endpoint: ServerEndpoint,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn ServerConnection>> {
        cancellable(cancel, launcher.start()).await??;
        self.bounded(cancel, &format!("connect to {endpoint}"), self.connector.connect(endpoint))
            .await?
    }

    fn timed_out(&self, operation: String) -> SessionError {
        SessionError::Timeout {
            operation,
            duration_ms: self.config.connect_timeout_ms,
        }
    }

    /// Run `fut` under the connect timeout and `cancel`.
    async fn bounded<F, T>(&self, cancel: &CancellationToken, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let timed = tokio::time::timeout(self.config.connect_timeout(), fut);
        cancellable(cancel, timed)
            .await?
            .map_err(|_| self.timed_out(operation.to_string()))
    }
}

impl std::fmt::Debug for ConnectionProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionProvisioner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Resolve to `Err(Cancelled)` as soon as `cancel` fires, dropping `fut`.
pub(crate) async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Best-effort stop: errors and timeouts are logged, never returned.
pub(crate) async fn stop_quietly(launcher: &dyn ServerLauncher, timeout: Duration) {
    match tokio::time::timeout(timeout, launcher.stop()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("failed to stop {}: {}", launcher.describe(), e),
        Err(_) => tracing::warn!(
            "stopping {} did not finish within {:?}",
            launcher.describe(),
            timeout
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ModelArtifact;
    use crate::config::LaunchKind;
    use crate::connection::RemoteModelSession;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[derive(Clone, Copy)]
    enum ConnectBehavior {
        Ok,
        Refuse,
        Hang,
        /// Connects after a delay, then never answers the device query.
        SlowThenSilent(Duration),
    }

    struct FakeConnector {
        behavior: ConnectBehavior,
        endpoints: Mutex<Vec<ServerEndpoint>>,
    }

    struct FakeConnection {
        silent: bool,
    }

    #[async_trait]
    impl ServerConnection for FakeConnection {
        async fn available_devices(&self) -> Result<Vec<DeviceInfo>> {
            if self.silent {
                return std::future::pending().await;
            }
            Ok(vec![DeviceInfo::new("cpu", "CPU"), DeviceInfo::new("cuda:0", "A100")])
        }

        async fn create_model_session(
            &self,
            _artifact: &ModelArtifact,
            _device_ids: &[String],
        ) -> Result<Box<dyn RemoteModelSession>> {
            Err(SessionError::protocol(LoadStage::CreatingSession, "not in this test"))
        }
    }

    #[async_trait]
    impl ServerConnector for FakeConnector {
        async fn connect(&self, endpoint: ServerEndpoint) -> Result<Arc<dyn ServerConnection>> {
            self.endpoints.lock().push(endpoint);
            match self.behavior {
                ConnectBehavior::Ok => Ok(Arc::new(FakeConnection { silent: false })),
                ConnectBehavior::SlowThenSilent(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(Arc::new(FakeConnection { silent: true }))
                }
                ConnectBehavior::Refuse => Err(SessionError::connectivity(endpoint, "refused")),
                ConnectBehavior::Hang => std::future::pending().await,
            }
        }
    }

    #[derive(Default)]
    struct LaunchLog {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    struct FakeLauncher {
        log: Arc<LaunchLog>,
        fail_start: bool,
        fail_stop: bool,
    }

    #[async_trait]
    impl ServerLauncher for FakeLauncher {
        fn kind(&self) -> LaunchKind {
            LaunchKind::Local
        }

        fn describe(&self) -> String {
            "fake launcher".into()
        }

        async fn start(&self) -> Result<()> {
            self.log.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(SessionError::LaunchFailed {
                    launcher: self.describe(),
                    reason: "no such binary".into(),
                });
            }
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.log.stops.fetch_add(1, Ordering::SeqCst);
            if self.fail_stop {
                return Err(SessionError::Io(std::io::Error::other("kill failed")));
            }
            Ok(())
        }
    }

    struct FakeLaunchers {
        log: Arc<LaunchLog>,
        fail_start: bool,
        fail_stop: bool,
    }

    impl LauncherFactory for FakeLaunchers {
        fn launcher(
            &self,
            _config: &SessionConfig,
            _endpoint: ServerEndpoint,
        ) -> Result<Box<dyn ServerLauncher>> {
            Ok(Box::new(FakeLauncher {
                log: Arc::clone(&self.log),
                fail_start: self.fail_start,
                fail_stop: self.fail_stop,
            }))
        }
    }

    fn provisioner(
        behavior: ConnectBehavior,
        fail_start: bool,
        fail_stop: bool,
    ) -> (ConnectionProvisioner, Arc<FakeConnector>, Arc<LaunchLog>) {
        let connector = Arc::new(FakeConnector {
            behavior,
            endpoints: Mutex::new(Vec::new()),
        });
        let log = Arc::new(LaunchLog::default());
        let launchers = Arc::new(FakeLaunchers {
            log: Arc::clone(&log),
            fail_start,
            fail_stop,
        });
        let config = ProvisionerConfig::default().with_connect_timeout(Duration::from_millis(200));
        (
            ConnectionProvisioner::new(config, connector.clone(), launchers),
            connector,
            log,
        )
    }

    fn loopback() -> SessionConfig {
        SessionConfig {
            address: "127.0.0.1".into(),
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_discovery_uses_shifted_ports_and_stops_launcher() {
        let (provisioner, connector, log) = provisioner(ConnectBehavior::Ok, false, false);
        let devices = provisioner
            .discover_devices(&loopback(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(log.starts.load(Ordering::SeqCst), 1);
        assert_eq!(log.stops.load(Ordering::SeqCst), 1);

        let probed = connector.endpoints.lock()[0];
        assert_eq!(probed.primary_port, 5558);
        assert_eq!(probed.secondary_port, 5559);
    }

    #[tokio::test]
    async fn test_discovery_without_autostart_uses_real_ports() {
        let (provisioner, connector, _log) = provisioner(ConnectBehavior::Ok, false, false);
        let config = loopback().with_autostart(false);
        provisioner
            .discover_devices(&config, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(connector.endpoints.lock()[0].primary_port, 5556);
    }

    #[tokio::test]
    async fn test_unreachable_server_times_out_within_bound() {
        let (provisioner, _connector, log) = provisioner(ConnectBehavior::Hang, false, false);
        let started = Instant::now();

        let err = provisioner
            .discover_devices(&loopback(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_connectivity(), "unexpected error: {err}");
        assert!(matches!(err, SessionError::Timeout { duration_ms: 200, .. }));
        assert!(started.elapsed() < Duration::from_millis(200) + Duration::from_secs(1));
        assert_eq!(log.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_steps_share_one_deadline() {
        let (provisioner, _connector, log) = provisioner(
            ConnectBehavior::SlowThenSilent(Duration::from_millis(150)),
            false,
            false,
        );
        let started = tokio::time::Instant::now();

        let err = provisioner
            .discover_devices(&loopback(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Timeout { duration_ms: 200, .. }));
        assert!(started.elapsed() <= Duration::from_millis(210), "took {:?}", started.elapsed());
        assert_eq!(log.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refused_connection_is_reported_after_cleanup() {
        let (provisioner, _connector, log) = provisioner(ConnectBehavior::Refuse, false, true);
        let err = provisioner
            .discover_devices(&loopback(), &CancellationToken::new())
            .await
            .unwrap_err();

        // The stop failure is only logged; the connect error is what surfaces.
        assert!(matches!(err, SessionError::Connectivity { .. }));
        assert_eq!(log.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_launch_failure_still_stops_once() {
        let (provisioner, connector, log) = provisioner(ConnectBehavior::Ok, true, false);
        let err = provisioner
            .ensure_connection(&loopback(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::LaunchFailed { .. }));
        assert!(connector.endpoints.lock().is_empty());
        assert_eq!(log.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_abandons_connect() {
        let (provisioner, _connector, log) = provisioner(ConnectBehavior::Hang, false, false);
        let provisioner = ConnectionProvisioner {
            config: ProvisionerConfig::default().with_connect_timeout(Duration::from_secs(60)),
            ..provisioner
        };
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = provisioner
            .ensure_connection(&loopback(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(log.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ensure_connection_hands_launcher_to_caller() {
        let (provisioner, _connector, log) = provisioner(ConnectBehavior::Ok, false, false);
        let server = provisioner
            .ensure_connection(&loopback(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(server.endpoint().primary_port, 5556);
        assert_eq!(log.stops.load(Ordering::SeqCst), 0);
        assert_eq!(server.connection().available_devices().await.unwrap().len(), 2);

        server.shutdown().await;
        assert_eq!(log.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_launch() {
        let (provisioner, _connector, log) = provisioner(ConnectBehavior::Ok, false, false);
        let config = loopback().with_ports(7000, 7000);
        let err = provisioner
            .discover_devices(&config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidConfig(_)));
        assert_eq!(log.starts.load(Ordering::SeqCst), 0);
    }
}
