//! Plugin lifecycle management.
//!
//! Keeps the ordered plugin list, mediates `load → start → configure →
//! shutdown`, infers platform kinds from actual registrations and persists
//! the registration list. A failed transition marks the plugin errored;
//! the flag is sticky until `enable` or `remove` resets the record, and an
//! errored plugin never advances further. One plugin's failure never
//! touches the others.

use crate::config::Mode;
use crate::error::{BridgeError, Result};
use crate::plugin::{
    PlatformContext, PlatformFactory, PlatformKind, PluginManifest, PluginRecord, StoredPlugin,
};
use crate::registry::{Device, EndpointRegistry};
use crate::storage::StorageContext;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::timeout;

const PLUGINS_KEY: &str = "plugins";

/// Deadline for a single platform lifecycle call.
const LIFECYCLE_DEADLINE: Duration = Duration::from_secs(30);

pub struct PluginManager {
    mode: Mode,
    registry: Arc<EndpointRegistry>,
    storage: Arc<StorageContext>,
    plugins: RwLock<Vec<Arc<PluginRecord>>>,
    factories: RwLock<HashMap<String, PlatformFactory>>,
    weak: Weak<PluginManager>,
}

impl PluginManager {
    pub fn new(
        mode: Mode,
        registry: Arc<EndpointRegistry>,
        storage: Arc<StorageContext>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            mode,
            registry,
            storage,
            plugins: RwLock::new(Vec::new()),
            factories: RwLock::new(HashMap::new()),
            weak: weak.clone(),
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Register a platform factory under a plugin name. Loading a plugin
    /// resolves its name against this table.
    pub fn register_factory(&self, name: &str, factory: PlatformFactory) {
        self.factories.write().insert(name.to_string(), factory);
    }

    pub fn has_factory(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    /// Recreate plugin records from the persisted registration list.
    pub fn load_from_storage(&self) -> usize {
        let stored: Vec<StoredPlugin> = self.storage.get_or(PLUGINS_KEY, Vec::new());
        let mut plugins = self.plugins.write();
        for entry in &stored {
            let manifest = PluginManifest::read(&entry.path).unwrap_or(PluginManifest {
                name: entry.name.clone(),
                version: entry.version.clone(),
                description: String::new(),
                author: String::new(),
            });
            let record = Arc::new(PluginRecord::new(&manifest, entry.path.clone()));
            record.set_enabled(entry.enabled);
            plugins.push(record);
        }
        info!("[Plugin] Restored {} plugin registration(s)", stored.len());
        stored.len()
    }

    fn persist(&self) {
        let stored: Vec<StoredPlugin> = self
            .plugins
            .read()
            .iter()
            .map(|record| record.to_stored())
            .collect();
        if let Err(e) = self.storage.set(PLUGINS_KEY, &stored) {
            error!("[Plugin] Failed to persist plugin list: {e}");
        }
    }

    /// Register a plugin from a package directory or a bare name. Reads the
    /// manifest when a directory is given and validates that a platform
    /// factory is available under the plugin name.
    pub fn add(&self, path_or_name: &str) -> Result<Arc<PluginRecord>> {
        let path = Path::new(path_or_name);
        let (manifest, path) = if path.join(PluginManifest::FILE_NAME).exists() {
            (PluginManifest::read(path)?, path.to_path_buf())
        } else {
            (
                PluginManifest {
                    name: path_or_name.to_string(),
                    version: "1.0.0".to_string(),
                    description: String::new(),
                    author: String::new(),
                },
                PathBuf::from(path_or_name),
            )
        };

        if !self.has_factory(&manifest.name) {
            return Err(BridgeError::plugin(
                &manifest.name,
                "no platform factory is registered under this name",
            ));
        }
        if self.get(&manifest.name).is_some() {
            return Err(BridgeError::plugin(&manifest.name, "already added"));
        }

        let record = Arc::new(PluginRecord::new(&manifest, path));
        self.plugins.write().push(record.clone());
        self.persist();
        info!("[Plugin] Added {} {}", record.name, record.version);
        Ok(record)
    }

    /// Shut the plugin down (removing its devices), then erase the record.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let record = self
            .get(name)
            .ok_or_else(|| BridgeError::NotFound(name.to_string()))?;
        if record.is_started() {
            self.shutdown(&record, "removed", true, true).await;
        }
        self.plugins.write().retain(|r| r.name != name);
        self.persist();
        info!("[Plugin] Removed {name}");
        Ok(())
    }

    pub fn enable(&self, name: &str) -> Result<()> {
        let record = self
            .get(name)
            .ok_or_else(|| BridgeError::NotFound(name.to_string()))?;
        record.set_enabled(true);
        record.clear_error();
        self.persist();
        info!("[Plugin] Enabled {name}");
        Ok(())
    }

    pub fn disable(&self, name: &str) -> Result<()> {
        let record = self
            .get(name)
            .ok_or_else(|| BridgeError::NotFound(name.to_string()))?;
        record.set_enabled(false);
        self.persist();
        info!("[Plugin] Disabled {name}");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<PluginRecord>> {
        self.plugins.read().iter().find(|r| r.name == name).cloned()
    }

    /// Consistent snapshot of all records in registration order.
    pub fn plugins(&self) -> Vec<Arc<PluginRecord>> {
        self.plugins.read().clone()
    }

    pub fn enabled_plugins(&self) -> Vec<Arc<PluginRecord>> {
        self.plugins
            .read()
            .iter()
            .filter(|r| r.is_enabled())
            .cloned()
            .collect()
    }

    /// Construct the platform instance and wire config + context.
    pub fn load(&self, record: &Arc<PluginRecord>) -> Result<()> {
        if record.has_error() {
            return Err(BridgeError::plugin(&record.name, "errored; enable to reset"));
        }
        if record.is_loaded() {
            return Ok(());
        }
        let factory = self
            .factories
            .read()
            .get(&record.name)
            .cloned()
            .ok_or_else(|| {
                BridgeError::plugin(&record.name, "no platform factory is registered")
            })?;

        let ctx = PlatformContext::new(&record.name, self.weak.clone(), record.config());
        match factory(ctx) {
            Ok(platform) => {
                record.set_platform(Some(platform));
                record.set_loaded(true);
                info!("[Plugin] Loaded {}", record.name);
                Ok(())
            }
            Err(e) => {
                record.set_error();
                Err(BridgeError::plugin(&record.name, format!("load failed: {e}")))
            }
        }
    }

    /// Invoke `on_start` and infer the platform kind from what it
    /// registered.
    pub async fn start(&self, record: &Arc<PluginRecord>, reason: &str) -> Result<()> {
        if record.has_error() {
            return Err(BridgeError::plugin(&record.name, "errored; enable to reset"));
        }
        let platform = record
            .platform()
            .ok_or_else(|| BridgeError::plugin(&record.name, "not loaded"))?;

        record.reset_counters();
        match timeout(LIFECYCLE_DEADLINE, platform.on_start(Some(reason))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                record.set_error();
                return Err(BridgeError::plugin(&record.name, format!("start failed: {e}")));
            }
            Err(_) => {
                record.set_error();
                return Err(BridgeError::Timeout(LIFECYCLE_DEADLINE));
            }
        }

        // Resolve AnyPlatform from the actual registrations: a composed
        // device already switched it to Dynamic; otherwise a single plain
        // device makes it an accessory.
        if record.kind() == PlatformKind::Any {
            match record.registered_devices() {
                0 => {}
                1 => record.set_kind(PlatformKind::Accessory),
                _ => record.set_kind(PlatformKind::Dynamic),
            }
        }

        record.set_started(true);
        info!(
            "[Plugin] Started {} ({:?}, {} device(s))",
            record.name,
            record.kind(),
            record.registered_devices()
        );
        Ok(())
    }

    pub async fn configure(&self, record: &Arc<PluginRecord>) -> Result<()> {
        if record.has_error() {
            return Err(BridgeError::plugin(&record.name, "errored; enable to reset"));
        }
        let platform = record
            .platform()
            .ok_or_else(|| BridgeError::plugin(&record.name, "not loaded"))?;

        match timeout(LIFECYCLE_DEADLINE, platform.on_configure()).await {
            Ok(Ok(())) => {
                record.set_configured(true);
                info!("[Plugin] Configured {}", record.name);
                Ok(())
            }
            Ok(Err(e)) => {
                record.set_error();
                Err(BridgeError::plugin(&record.name, format!("configure failed: {e}")))
            }
            Err(_) => {
                record.set_error();
                Err(BridgeError::Timeout(LIFECYCLE_DEADLINE))
            }
        }
    }

    /// Invoke `on_shutdown` and reset the lifecycle flags. With `force`,
    /// failures are logged and teardown continues.
    pub async fn shutdown(
        &self,
        record: &Arc<PluginRecord>,
        reason: &str,
        remove_devices: bool,
        force: bool,
    ) {
        if let Some(platform) = record.platform() {
            match timeout(LIFECYCLE_DEADLINE, platform.on_shutdown(Some(reason))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if force => {
                    warn!("[Plugin] {} shutdown error (forced): {e}", record.name)
                }
                Ok(Err(e)) => {
                    record.set_error();
                    error!("[Plugin] {} shutdown failed: {e}", record.name);
                }
                Err(_) => warn!(
                    "[Plugin] {} shutdown exceeded {LIFECYCLE_DEADLINE:?}",
                    record.name
                ),
            }
        }

        if remove_devices {
            let removed = self.registry.remove_all(&record.name);
            record.clear_added();
            debug!("[Plugin] {} removed {removed} device(s) at shutdown", record.name);
        }

        record.set_platform(None);
        record.set_started(false);
        record.set_configured(false);
        record.set_loaded(false);
        info!("[Plugin] Shut down {} ({reason})", record.name);
    }

    /// Device registration entry point used by platform contexts. Enforces
    /// the composition constraints per platform kind, then forwards to the
    /// registry.
    pub fn register_device(&self, plugin: &str, device: Device) -> Result<Arc<Device>> {
        let record = self
            .get(plugin)
            .ok_or_else(|| BridgeError::NotFound(plugin.to_string()))?;
        if record.has_error() {
            return Err(BridgeError::plugin(plugin, "errored; registration rejected"));
        }

        // An accessory owns exactly one device.
        if record.kind() == PlatformKind::Accessory && record.added_devices() >= 1 {
            record.set_error();
            return Err(BridgeError::TooManyDevices(plugin.to_string()));
        }
        if record.kind() == PlatformKind::Any && device.composed {
            record.set_kind(PlatformKind::Dynamic);
        }

        let device = self.registry.register(plugin, device)?;
        record.count_registered();
        Ok(device)
    }

    /// Device removal entry point used by platform contexts. Idempotent.
    pub fn unregister_device(&self, plugin: &str, storage_key: &str) {
        let existed = self
            .registry
            .get(storage_key)
            .is_some_and(|d| d.plugin().as_deref() == Some(plugin));
        self.registry.unregister(plugin, storage_key);
        if existed && let Some(record) = self.get(plugin) {
            record.count_removed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Platform;
    use crate::storage::StorageManager;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Registers a fixed number of temperature sensors on start.
    struct MockPlatform {
        ctx: PlatformContext,
        devices: u32,
        composed: bool,
        shutdowns: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Platform for MockPlatform {
        async fn on_start(&self, _reason: Option<&str>) -> Result<()> {
            for i in 0..self.devices {
                let mut device = Device::new(
                    format!("{}:sensor{i}", self.ctx.plugin()),
                    format!("Sensor {i}"),
                )
                .with_device_type(0x0302, 2)
                .with_attribute(0x0402, "measuredValue", json!(2000 + i));
                if self.composed {
                    device = device.composed();
                }
                self.ctx.register_device(device)?;
            }
            Ok(())
        }

        async fn on_configure(&self) -> Result<()> {
            Ok(())
        }

        async fn on_shutdown(&self, _reason: Option<&str>) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager(mode: Mode) -> (TempDir, Arc<PluginManager>) {
        let dir = TempDir::new().unwrap();
        let storage = StorageManager::open(dir.path()).unwrap();
        let ctx = storage.context("matterbridge").unwrap();
        let manager = PluginManager::new(mode, Arc::new(EndpointRegistry::new()), ctx);
        (dir, manager)
    }

    fn mock_factory(devices: u32, composed: bool, shutdowns: Arc<AtomicU32>) -> PlatformFactory {
        Arc::new(move |ctx| {
            Ok(Arc::new(MockPlatform {
                ctx,
                devices,
                composed,
                shutdowns: shutdowns.clone(),
            }) as Arc<dyn Platform>)
        })
    }

    #[tokio::test]
    async fn test_accessory_inference_from_single_device() {
        let (_dir, manager) = manager(Mode::Childbridge);
        manager.register_factory("plugin4", mock_factory(1, false, Default::default()));

        let record = manager.add("plugin4").unwrap();
        manager.load(&record).unwrap();
        manager.start(&record, "test").await.unwrap();

        assert_eq!(record.kind(), PlatformKind::Accessory);
        assert_eq!(record.registered_devices(), 1);
        assert!(record.is_started());
    }

    #[tokio::test]
    async fn test_dynamic_inference_from_composed_device() {
        let (_dir, manager) = manager(Mode::Bridge);
        manager.register_factory("dyn", mock_factory(3, true, Default::default()));

        let record = manager.add("dyn").unwrap();
        manager.load(&record).unwrap();
        manager.start(&record, "test").await.unwrap();

        assert_eq!(record.kind(), PlatformKind::Dynamic);
        assert_eq!(record.registered_devices(), 3);
    }

    #[tokio::test]
    async fn test_too_many_devices_keeps_first() {
        let (_dir, manager) = manager(Mode::Childbridge);
        manager.register_factory("acc", mock_factory(2, false, Default::default()));

        let record = manager.add("acc").unwrap();
        record.set_kind(PlatformKind::Accessory);
        manager.load(&record).unwrap();

        let result = manager.start(&record, "test").await;
        assert!(result.is_err());
        assert!(record.has_error());
        // The first registration stands
        assert_eq!(manager.registry().by_plugin("acc").len(), 1);
    }

    #[tokio::test]
    async fn test_error_is_sticky_until_enable() {
        let (_dir, manager) = manager(Mode::Bridge);
        manager.register_factory("bad", Arc::new(|_ctx| {
            Err(BridgeError::plugin("bad", "boom"))
        }));

        let record = manager.add("bad").unwrap();
        assert!(manager.load(&record).is_err());
        assert!(record.has_error());
        assert!(manager.load(&record).is_err());

        manager.enable("bad").unwrap();
        assert!(!record.has_error());
    }

    #[tokio::test]
    async fn test_shutdown_removes_devices_and_counters() {
        let (_dir, manager) = manager(Mode::Bridge);
        let shutdowns = Arc::new(AtomicU32::new(0));
        manager.register_factory("dyn", mock_factory(3, true, shutdowns.clone()));

        let record = manager.add("dyn").unwrap();
        manager.load(&record).unwrap();
        manager.start(&record, "test").await.unwrap();
        assert_eq!(record.added_devices(), 3);

        manager.shutdown(&record, "test over", true, false).await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(manager.registry().by_plugin("dyn").is_empty());
        assert!(!record.is_started());
    }

    #[tokio::test]
    async fn test_registration_list_persists() {
        let dir = TempDir::new().unwrap();
        {
            let storage = StorageManager::open(dir.path()).unwrap();
            let ctx = storage.context("matterbridge").unwrap();
            let manager = PluginManager::new(Mode::Bridge, Arc::new(EndpointRegistry::new()), ctx);
            manager.register_factory("keeper", mock_factory(1, false, Default::default()));
            manager.add("keeper").unwrap();
            manager.disable("keeper").unwrap();
        }

        let storage = StorageManager::open(dir.path()).unwrap();
        let ctx = storage.context("matterbridge").unwrap();
        let manager = PluginManager::new(Mode::Bridge, Arc::new(EndpointRegistry::new()), ctx);
        assert_eq!(manager.load_from_storage(), 1);
        let record = manager.get("keeper").unwrap();
        assert!(!record.is_enabled());
    }

    #[tokio::test]
    async fn test_add_requires_factory() {
        let (_dir, manager) = manager(Mode::Bridge);
        assert!(manager.add("phantom").is_err());
    }

    #[tokio::test]
    async fn test_remove_erases_record() {
        let (_dir, manager) = manager(Mode::Bridge);
        manager.register_factory("gone", mock_factory(1, false, Default::default()));
        let record = manager.add("gone").unwrap();
        manager.load(&record).unwrap();
        manager.start(&record, "test").await.unwrap();

        manager.remove("gone").await.unwrap();
        assert!(manager.get("gone").is_none());
        assert!(manager.registry().by_plugin("gone").is_empty());
    }
}
