//! Server and provisioning configuration.

use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PRIMARY_PORT: u16 = 5556;
pub const DEFAULT_SECONDARY_PORT: u16 = 5557;

/// A compute device offered by the server, as reported by device discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A device entry in a server profile, with the user's selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub selected: bool,
}

/// Login for launching the server on a remote host over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshCredentials {
    pub username: String,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

impl SshCredentials {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            key_path: None,
            port: default_ssh_port(),
        }
    }

    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }
}

/// How the server process gets started before connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchKind {
    /// Spawn a child process on this machine.
    Local,
    /// Start the server on the target host over SSH.
    Remote,
    /// Server is already running; nothing is launched.
    External,
}

impl LaunchKind {
    /// Pick the launch strategy for `address`.
    ///
    /// Loopback addresses launch locally, everything else remotely. With
    /// `autostart` off the server is assumed to be running already.
    pub fn for_address(address: &str, autostart: bool) -> Self {
        if !autostart {
            LaunchKind::External
        } else if is_local_address(address) {
            LaunchKind::Local
        } else {
            LaunchKind::Remote
        }
    }
}

pub fn is_local_address(address: &str) -> bool {
    let address = address.trim();
    if address.eq_ignore_ascii_case("localhost") {
        return true;
    }
    address
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

/// Where and how to reach one inference server.
///
/// Treated as an immutable value: changes produce a new config that replaces
/// the old one wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub address: String,
    pub primary_port: u16,
    pub secondary_port: u16,
    pub devices: Vec<Device>,
    pub autostart: bool,
    pub credentials: Option<SshCredentials>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            primary_port: DEFAULT_PRIMARY_PORT,
            secondary_port: DEFAULT_SECONDARY_PORT,
            devices: Vec::new(),
            autostart: true,
            credentials: None,
        }
    }
}

impl SessionConfig {
    pub fn local() -> Self {
        Self::default()
    }

    pub fn remote(address: impl Into<String>, credentials: SshCredentials) -> Self {
        Self {
            address: address.into(),
            credentials: Some(credentials),
            ..Self::default()
        }
    }

    pub fn with_ports(mut self, primary: u16, secondary: u16) -> Self {
        self.primary_port = primary;
        self.secondary_port = secondary;
        self
    }

    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    pub fn with_devices(mut self, devices: Vec<Device>) -> Self {
        self.devices = devices;
        self
    }

    pub fn launch_kind(&self) -> LaunchKind {
        LaunchKind::for_address(&self.address, self.autostart)
    }

    pub fn selected_device_ids(&self) -> Vec<String> {
        self.devices
            .iter()
            .filter(|d| d.selected)
            .map(|d| d.id.clone())
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(SessionError::InvalidConfig(
                "server address is empty".to_string(),
            ));
        }
        if self.primary_port == 0 || self.secondary_port == 0 {
            return Err(SessionError::InvalidConfig(
                "server ports must be non-zero".to_string(),
            ));
        }
        if self.primary_port == self.secondary_port {
            return Err(SessionError::InvalidConfig(format!(
                "server ports must differ (both {})",
                self.primary_port
            )));
        }
        if self.launch_kind() == LaunchKind::Remote {
            match &self.credentials {
                Some(c) if !c.username.is_empty() => {}
                _ => {
                    return Err(SessionError::InvalidConfig(format!(
                        "remote server {} needs SSH credentials",
                        self.address
                    )))
                }
            }
        }
        Ok(())
    }

    /// New config whose device list is `discovered`, keeping the selection of
    /// devices that were already known. Devices no longer reported are dropped.
    pub fn merge_devices(&self, discovered: &[DeviceInfo]) -> Self {
        let devices = discovered
            .iter()
            .map(|info| Device {
                id: info.id.clone(),
                name: info.name.clone(),
                selected: self
                    .devices
                    .iter()
                    .any(|known| known.id == info.id && known.selected),
            })
            .collect();

        Self {
            devices,
            ..self.clone()
        }
    }
}

/// A server address after name resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerEndpoint {
    pub ip: IpAddr,
    pub primary_port: u16,
    pub secondary_port: u16,
}

impl ServerEndpoint {
    pub fn primary(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.primary_port)
    }

    pub fn secondary(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.secondary_port)
    }

    /// Same host with both ports moved up by `shift`.
    pub fn shifted(&self, shift: u16) -> Result<Self> {
        let shift_port = |port: u16| {
            port.checked_add(shift).ok_or_else(|| {
                SessionError::InvalidConfig(format!("port {port} + {shift} overflows"))
            })
        };
        Ok(Self {
            ip: self.ip,
            primary_port: shift_port(self.primary_port)?,
            secondary_port: shift_port(self.secondary_port)?,
        })
    }
}

impl std::fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.primary(), self.secondary_port)
    }
}

/// Provisioning knobs shared by every server profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    pub connect_timeout_ms: u64,
    /// Port offset used while probing a server that is started only for device
    /// discovery, so it cannot collide with the real server's ports.
    pub control_port_shift: u16,
    pub server_executable: PathBuf,
    pub server_args: Vec<String>,
    pub remote_command: String,
    pub ssh_executable: PathBuf,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            control_port_shift: 2,
            server_executable: PathBuf::from("remora-server"),
            server_args: Vec::new(),
            remote_command: "remora-server".to_string(),
            ssh_executable: PathBuf::from("ssh"),
        }
    }
}

impl ProvisionerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        self
    }
}
