//! Server launchers: local child process, SSH, or nothing.

use crate::config::{LaunchKind, ProvisionerConfig, ServerEndpoint, SessionConfig, SshCredentials};
use crate::error::{Result, SessionError};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Starts and stops a server process for one endpoint.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    fn kind(&self) -> LaunchKind;

    /// Human-readable description for logs and errors.
    fn describe(&self) -> String;

    async fn start(&self) -> Result<()>;

    /// Stop the server. Stopping a launcher that never started, or stopping
    /// twice, is not an error.
    async fn stop(&self) -> Result<()>;
}

/// Builds the launcher for a config.
pub trait LauncherFactory: Send + Sync {
    fn launcher(
        &self,
        config: &SessionConfig,
        endpoint: ServerEndpoint,
    ) -> Result<Box<dyn ServerLauncher>>;
}

/// Launcher used when the server is managed by someone else.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLauncher;

#[async_trait]
impl ServerLauncher for NullLauncher {
    fn kind(&self) -> LaunchKind {
        LaunchKind::External
    }

    fn describe(&self) -> String {
        "external server".to_string()
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Runs `program args...` as a child process, killed on stop or drop.
struct ChildProcess {
    program: PathBuf,
    args: Vec<OsString>,
    child: Mutex<Option<Child>>,
}

impl ChildProcess {
    fn new(program: PathBuf, args: Vec<OsString>) -> Self {
        Self {
            program,
            args,
            child: Mutex::new(None),
        }
    }

    async fn spawn(&self, launcher: &str) -> Result<()> {
        let mut slot = self.child.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::LaunchFailed {
                launcher: launcher.to_string(),
                reason: format!("{}: {}", self.program.display(), e),
            })?;

        tracing::info!("started {} (pid {:?})", launcher, child.id());
        *slot = Some(child);
        Ok(())
    }

    async fn kill(&self, launcher: &str) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        if let Some(status) = child.try_wait()? {
            tracing::info!("{} already exited ({})", launcher, status);
            return Ok(());
        }

        child.kill().await?;
        tracing::info!("stopped {}", launcher);
        Ok(())
    }
}

fn server_args(endpoint: &ServerEndpoint, bind: &str) -> Vec<OsString> {
    vec![
        "--addr".into(),
        bind.into(),
        "--port1".into(),
        endpoint.primary_port.to_string().into(),
        "--port2".into(),
        endpoint.secondary_port.to_string().into(),
    ]
}

/// Spawns the server binary on this machine.
pub struct LocalLauncher {
    endpoint: ServerEndpoint,
    process: ChildProcess,
}

impl LocalLauncher {
    pub fn new(config: &ProvisionerConfig, endpoint: ServerEndpoint) -> Self {
        let mut args: Vec<OsString> = config.server_args.iter().map(OsString::from).collect();
        args.extend(server_args(&endpoint, &endpoint.ip.to_string()));
        Self {
            endpoint,
            process: ChildProcess::new(config.server_executable.clone(), args),
        }
    }
}

#[async_trait]
impl ServerLauncher for LocalLauncher {
    fn kind(&self) -> LaunchKind {
        LaunchKind::Local
    }

    fn describe(&self) -> String {
        format!("local server at {}", self.endpoint)
    }

    async fn start(&self) -> Result<()> {
        self.process.spawn(&self.describe()).await
    }

    async fn stop(&self) -> Result<()> {
        self.process.kill(&self.describe()).await
    }
}

/// Starts the server on a remote host through the `ssh` client.
pub struct SshLauncher {
    host: String,
    endpoint: ServerEndpoint,
    process: ChildProcess,
}

impl SshLauncher {
    pub fn new(
        config: &ProvisionerConfig,
        host: impl Into<String>,
        credentials: &SshCredentials,
        endpoint: ServerEndpoint,
    ) -> Self {
        let host = host.into();
        let mut args: Vec<OsString> = vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-p".into(),
            credentials.port.to_string().into(),
        ];
        if let Some(key) = &credentials.key_path {
            args.push("-i".into());
            args.push(key.into());
        }
        args.push(format!("{}@{}", credentials.username, host).into());
        args.push(config.remote_command.clone().into());
        args.extend(config.server_args.iter().map(OsString::from));
        args.extend(server_args(&endpoint, "0.0.0.0"));

        Self {
            host,
            endpoint,
            process: ChildProcess::new(config.ssh_executable.clone(), args),
        }
    }

    #[cfg(test)]
    fn args(&self) -> &[OsString] {
        &self.process.args
    }
}

#[async_trait]
impl ServerLauncher for SshLauncher {
    fn kind(&self) -> LaunchKind {
        LaunchKind::Remote
    }

    fn describe(&self) -> String {
        format!("ssh server on {} at {}", self.host, self.endpoint)
    }

    async fn start(&self) -> Result<()> {
        self.process.spawn(&self.describe()).await
    }

    async fn stop(&self) -> Result<()> {
        self.process.kill(&self.describe()).await
    }
}

/// Picks [`LocalLauncher`], [`SshLauncher`] or [`NullLauncher`] from the
/// config's [`LaunchKind`].
#[derive(Debug, Clone, Default)]
pub struct DefaultLauncherFactory {
    config: ProvisionerConfig,
}

impl DefaultLauncherFactory {
    pub fn new(config: ProvisionerConfig) -> Self {
        Self { config }
    }
}

impl LauncherFactory for DefaultLauncherFactory {
    fn launcher(
        &self,
        config: &SessionConfig,
        endpoint: ServerEndpoint,
    ) -> Result<Box<dyn ServerLauncher>> {
        match config.launch_kind() {
            LaunchKind::External => Ok(Box::new(NullLauncher)),
            LaunchKind::Local => Ok(Box::new(LocalLauncher::new(&self.config, endpoint))),
            LaunchKind::Remote => {
                let credentials = config.credentials.as_ref().ok_or_else(|| {
                    SessionError::InvalidConfig(format!(
                        "remote server {} needs SSH credentials",
                        config.address
                    ))
                })?;
                Ok(Box::new(SshLauncher::new(
                    &self.config,
                    config.address.clone(),
                    credentials,
                    endpoint,
                )))
            }
        }
    }
}
