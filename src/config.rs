//! Device configuration records and JSON persistence.
//!
//! Configured TVs are stored as a single JSON array on disk. Writes go
//! through a temp file followed by an atomic rename so a crash mid-write
//! never leaves a truncated file behind.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const CONFIG_FILENAME: &str = "webos_config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot access config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown device: {0}")]
    UnknownDevice(String),
}

/// Everything needed to reach and wake one TV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TvConfig {
    pub id: String,
    pub name: String,
    /// IP address or hostname of the TV.
    pub address: String,
    /// Pairing key issued by the TV on first connect.
    #[serde(default)]
    pub key: Option<String>,
    /// Learned from the TV after the first successful connect.
    #[serde(default)]
    pub mac_address: Option<String>,
    /// Second hardware address (wired vs wireless interface).
    #[serde(default)]
    pub mac_address2: Option<String>,
    /// Broadcast address for magic packets; defaults to 255.255.255.255.
    #[serde(default)]
    pub broadcast: Option<String>,
    /// Local interface address to send magic packets from.
    #[serde(default)]
    pub interface: Option<String>,
    /// UDP port for magic packets; defaults to 9.
    #[serde(default)]
    pub wol_port: Option<u16>,
}

impl TvConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            address: address.into(),
            key: None,
            mac_address: None,
            mac_address2: None,
            broadcast: None,
            interface: None,
            wol_port: None,
        }
    }
}

/// On-disk store of configured devices.
pub struct ConfigStore {
    path: PathBuf,
    devices: Mutex<Vec<TvConfig>>,
}

impl ConfigStore {
    /// Opens the store in `data_dir`, loading any existing file. A missing
    /// or unreadable file starts the store empty.
    pub fn new(data_dir: &Path) -> Self {
        let path = data_dir.join(CONFIG_FILENAME);
        let devices = match Self::read_file(&path) {
            Ok(devices) => devices,
            Err(ConfigError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                log::error!("[Config] could not load {}: {}", path.display(), err);
                Vec::new()
            }
        };
        log::debug!("[Config] loaded {} device(s) from {}", devices.len(), path.display());
        Self { path, devices: Mutex::new(devices) }
    }

    fn read_file(path: &Path) -> Result<Vec<TvConfig>, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn all(&self) -> Vec<TvConfig> {
        self.devices.lock().clone()
    }

    pub fn get(&self, id: &str) -> Option<TvConfig> {
        self.devices.lock().iter().find(|d| d.id == id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.lock().iter().any(|d| d.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    /// Inserts or replaces a device and persists the store. Devices without
    /// an id are assigned one. Returns the stored record.
    pub fn add_or_update(&self, mut config: TvConfig) -> Result<TvConfig, ConfigError> {
        if config.id.is_empty() {
            config.id = Uuid::new_v4().to_string();
        }
        let mut devices = self.devices.lock();
        match devices.iter_mut().find(|d| d.id == config.id) {
            Some(existing) => *existing = config.clone(),
            None => devices.push(config.clone()),
        }
        self.persist(&devices)?;
        Ok(config)
    }

    /// Replaces an existing device record and persists the store.
    pub fn update(&self, config: &TvConfig) -> Result<(), ConfigError> {
        let mut devices = self.devices.lock();
        let existing = devices
            .iter_mut()
            .find(|d| d.id == config.id)
            .ok_or_else(|| ConfigError::UnknownDevice(config.id.clone()))?;
        *existing = config.clone();
        self.persist(&devices)
    }

    /// Removes a device and persists the store.
    pub fn remove(&self, id: &str) -> Result<TvConfig, ConfigError> {
        let mut devices = self.devices.lock();
        let index = devices
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| ConfigError::UnknownDevice(id.to_string()))?;
        let removed = devices.remove(index);
        self.persist(&devices)?;
        Ok(removed)
    }

    /// Drops all devices and deletes the backing file.
    pub fn clear(&self) -> Result<(), ConfigError> {
        self.devices.lock().clear();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn persist(&self, devices: &[TvConfig]) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(devices)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        log::debug!("[Config] persisted {} device(s)", devices.len());
        Ok(())
    }
}
