//! Process-wide registry of managed TV devices.
//!
//! The registry hands out one long-lived [`TvDevice`] per configured TV and
//! keeps handle identity stable across config edits: updating a device's
//! address changes the config in place instead of replacing the handle.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;

use crate::config::{ConfigStore, TvConfig};
use crate::device::TvDevice;
use crate::error::LinkResult;
use crate::events::EventEmitter;
use crate::transport::SessionFactory;
use crate::wol::WakeSender;

pub struct DeviceRegistry {
    devices: DashMap<String, Arc<TvDevice>>,
    factory: Arc<dyn SessionFactory>,
    emitter: Arc<dyn EventEmitter>,
    wake: Arc<dyn WakeSender>,
    store: Option<Arc<ConfigStore>>,
}

impl DeviceRegistry {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        emitter: Arc<dyn EventEmitter>,
        wake: Arc<dyn WakeSender>,
        store: Option<Arc<ConfigStore>>,
    ) -> Self {
        Self { devices: DashMap::new(), factory, emitter, wake, store }
    }

    /// Creates handles for every device in the config store without
    /// connecting any of them.
    pub fn load_from_store(&self) -> LinkResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let configs = store.all();
        let count = configs.len();
        for config in configs {
            self.add(config, false)?;
        }
        log::debug!("[Registry] loaded {count} device(s) from the config store");
        Ok(count)
    }

    /// Adds a device, persisting its config when a store is attached. An
    /// already-known id updates the existing handle's config in place.
    /// `connect` spawns an initial connect attempt in the background.
    pub fn add(&self, config: TvConfig, connect: bool) -> LinkResult<Arc<TvDevice>> {
        let config = match &self.store {
            Some(store) => store.add_or_update(config)?,
            None => config,
        };

        let device = if let Some(existing) = self.devices.get(&config.id) {
            let existing = Arc::clone(existing.value());
            log::debug!("[Registry] updating config of known device {}", config.id);
            existing.update_config(config);
            existing
        } else {
            log::debug!("[Registry] adding device {} ({})", config.id, config.address);
            let device = TvDevice::new(
                config.clone(),
                Arc::clone(&self.factory),
                Arc::clone(&self.emitter),
                Arc::clone(&self.wake),
                self.store.clone(),
            );
            self.devices.insert(config.id, Arc::clone(&device));
            device
        };

        if connect {
            let handle = Arc::clone(&device);
            tokio::spawn(async move {
                handle.connect().await;
            });
        }
        Ok(device)
    }

    pub fn get(&self, id: &str) -> Option<Arc<TvDevice>> {
        self.devices.get(id).map(|d| Arc::clone(d.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn all(&self) -> Vec<Arc<TvDevice>> {
        self.devices.iter().map(|d| Arc::clone(d.value())).collect()
    }

    /// Disconnects and drops a device handle. The config store is left
    /// untouched; removing configuration is the host's decision.
    pub async fn remove(&self, id: &str) -> bool {
        match self.devices.remove(id) {
            Some((_, device)) => {
                device.disconnect().await;
                log::debug!("[Registry] removed device {id}");
                true
            }
            None => false,
        }
    }

    pub async fn connect_all(&self) {
        let devices = self.all();
        join_all(devices.iter().map(|d| d.connect())).await;
    }

    pub async fn disconnect_all(&self) {
        let devices = self.all();
        join_all(devices.iter().map(|d| d.disconnect())).await;
    }

    /// Disconnects everything and clears the registry.
    pub async fn shutdown(&self) {
        log::debug!("[Registry] shutting down {} device(s)", self.devices.len());
        self.disconnect_all().await;
        self.devices.clear();
    }
}
