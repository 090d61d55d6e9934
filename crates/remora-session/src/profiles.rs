//! Named server profiles.

use crate::config::{ProvisionerConfig, SessionConfig};
use crate::error::{Result, SessionError};
use crate::persistence::write_atomically;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A [`SessionConfig`] saved under a stable id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerProfile {
    pub id: String,
    pub name: String,
    pub config: SessionConfig,
}

impl ServerProfile {
    /// New profile with a fresh id.
    pub fn new(name: impl Into<String>, config: SessionConfig) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            config,
        }
    }

    pub fn local() -> Self {
        Self::new("Local", SessionConfig::local())
    }
}

/// Get/set/enumerate server profiles by id.
pub trait ProfileStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<ServerProfile>>;

    /// Insert or replace the profile with `profile.id`.
    fn set(&self, profile: ServerProfile) -> Result<()>;

    /// Returns whether a profile was removed.
    fn remove(&self, id: &str) -> Result<bool>;

    /// All profiles, ordered by id.
    fn list(&self) -> Result<Vec<ServerProfile>>;
}

#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    profiles: DashMap<String, ServerProfile>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProfileStore for MemoryProfileStore {
    fn get(&self, id: &str) -> Result<Option<ServerProfile>> {
        Ok(self.profiles.get(id).map(|p| p.value().clone()))
    }

    fn set(&self, profile: ServerProfile) -> Result<()> {
        self.profiles.insert(profile.id.clone(), profile);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.profiles.remove(id).is_some())
    }

    fn list(&self) -> Result<Vec<ServerProfile>> {
        let mut profiles: Vec<_> = self.profiles.iter().map(|p| p.value().clone()).collect();
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(profiles)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProfileFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provisioner: Option<ProvisionerConfig>,
    #[serde(default)]
    servers: BTreeMap<String, StoredProfile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredProfile {
    name: String,
    #[serde(default)]
    config: SessionConfig,
}

/// Profiles persisted as `[servers.<id>]` tables in a TOML file, next to an
/// optional `[provisioner]` table shared by all of them.
///
/// ```toml
/// [provisioner]
/// connect_timeout_ms = 3000
///
/// [servers.3f0c9a52-7a4e-4d0b-9c55-1e2f1c7f5a10]
/// name = "Local"
///
/// [servers.3f0c9a52-7a4e-4d0b-9c55-1e2f1c7f5a10.config]
/// address = "localhost"
/// primary_port = 5556
/// ```
///
/// Other top-level tables in the file are not preserved on write.
#[derive(Debug)]
pub struct TomlProfileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TomlProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<ProfileFile> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ProfileFile::default()),
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&text).map_err(|e| {
            SessionError::Store(format!("{}: {}", self.path.display(), e.message()))
        })
    }

    fn write(&self, file: &ProfileFile) -> Result<()> {
        let text = toml::to_string(file).map_err(|e| SessionError::Store(e.to_string()))?;
        write_atomically(&self.path, text.as_bytes())
    }

    /// The `[provisioner]` table, or defaults if the file has none.
    pub fn provisioner_config(&self) -> Result<ProvisionerConfig> {
        let _guard = self.lock.lock();
        Ok(self.read()?.provisioner.unwrap_or_default())
    }

    pub fn set_provisioner_config(&self, config: ProvisionerConfig) -> Result<()> {
        let _guard = self.lock.lock();
        let mut file = self.read()?;
        file.provisioner = Some(config);
        self.write(&file)
    }
}

impl ProfileStore for TomlProfileStore {
    fn get(&self, id: &str) -> Result<Option<ServerProfile>> {
        let _guard = self.lock.lock();
        let file = self.read()?;
        Ok(file.servers.get(id).map(|stored| ServerProfile {
            id: id.to_string(),
            name: stored.name.clone(),
            config: stored.config.clone(),
        }))
    }

    fn set(&self, profile: ServerProfile) -> Result<()> {
        if profile.id.is_empty() {
            return Err(SessionError::InvalidConfig(
                "profile id must not be empty".to_string(),
            ));
        }
        let _guard = self.lock.lock();
        let mut file = self.read()?;
        tracing::debug!("saving server profile '{}' ({})", profile.name, profile.id);
        file.servers.insert(
            profile.id,
            StoredProfile {
                name: profile.name,
                config: profile.config,
            },
        );
        self.write(&file)
    }

    fn remove(&self, id: &str) -> Result<bool> {
        let _guard = self.lock.lock();
        let mut file = self.read()?;
        let removed = file.servers.remove(id).is_some();
        if removed {
            self.write(&file)?;
        }
        Ok(removed)
    }

    fn list(&self) -> Result<Vec<ServerProfile>> {
        let _guard = self.lock.lock();
        let file = self.read()?;
        Ok(file
            .servers
            .into_iter()
            .map(|(id, stored)| ServerProfile {
                id,
                name: stored.name,
                config: stored.config,
            })
            .collect())
    }
}
