//! Plugin model: the platform capability trait, plugin records and
//! manifests.
//!
//! A plugin is a loadable platform module. The bridge hands each platform a
//! [`PlatformContext`] at construction (explicit dependency, no global
//! lookup); the platform registers its devices through it during
//! `on_start`.

pub mod install;
pub mod manager;

pub use manager::PluginManager;

use crate::engine::{Aggregator, PairingCodes, ServerNode};
use crate::error::{BridgeError, Result};
use crate::registry::Device;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// What a plugin is, inferred from its registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlatformKind {
    /// Owns exactly one device; its server node wraps the device directly.
    #[serde(rename = "AccessoryPlatform")]
    Accessory,
    /// Owns an aggregator holding 0..N bridged devices.
    #[serde(rename = "DynamicPlatform")]
    Dynamic,
    /// Not yet resolved; becomes one of the two at first registration.
    #[serde(rename = "AnyPlatform")]
    Any,
    #[serde(rename = "unknown")]
    Unknown,
}

/// The capability set every platform implements.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Start the platform. Devices are expected to be registered before the
    /// returned future resolves.
    async fn on_start(&self, reason: Option<&str>) -> Result<()>;

    /// Configure the platform after its devices are attached.
    async fn on_configure(&self) -> Result<()>;

    /// Stop the platform and release its resources.
    async fn on_shutdown(&self, reason: Option<&str>) -> Result<()>;
}

/// Constructor for a platform: receives the context and the plugin config.
pub type PlatformFactory =
    Arc<dyn Fn(PlatformContext) -> Result<Arc<dyn Platform>> + Send + Sync>;

/// Core handle given to a platform at construction.
#[derive(Clone)]
pub struct PlatformContext {
    plugin: String,
    manager: Weak<PluginManager>,
    config: Value,
}

impl PlatformContext {
    pub(crate) fn new(plugin: &str, manager: Weak<PluginManager>, config: Value) -> Self {
        Self {
            plugin: plugin.to_string(),
            manager,
            config,
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    fn manager(&self) -> Result<Arc<PluginManager>> {
        self.manager
            .upgrade()
            .ok_or_else(|| BridgeError::plugin(&self.plugin, "plugin manager is gone"))
    }

    /// Register a device for this plugin.
    pub fn register_device(&self, device: Device) -> Result<Arc<Device>> {
        self.manager()?.register_device(&self.plugin, device)
    }

    /// Unregister a device of this plugin. Unknown keys are a no-op.
    pub fn unregister_device(&self, storage_key: &str) -> Result<()> {
        self.manager()?.unregister_device(&self.plugin, storage_key);
        Ok(())
    }
}

/// On-disk manifest of an installed plugin package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
}

impl PluginManifest {
    pub const FILE_NAME: &'static str = "plugin.json";

    /// Read and validate `plugin.json` from a package directory.
    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(Self::FILE_NAME);
        let text = fs::read_to_string(&path).map_err(|e| {
            BridgeError::NotFound(format!("{}: {e}", path.display()))
        })?;
        let manifest: PluginManifest = serde_json::from_str(&text)?;
        if manifest.name.is_empty() {
            return Err(BridgeError::plugin(
                dir.display().to_string(),
                "manifest has an empty name",
            ));
        }
        Ok(manifest)
    }
}

/// Persisted registration of a plugin (the `plugins` storage key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPlugin {
    pub name: String,
    pub path: PathBuf,
    pub version: String,
    pub enabled: bool,
}

/// One managed plugin and its lifecycle flags.
pub struct PluginRecord {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub path: PathBuf,
    kind: RwLock<PlatformKind>,
    enabled: AtomicBool,
    loaded: AtomicBool,
    started: AtomicBool,
    configured: AtomicBool,
    paired: AtomicBool,
    connected: AtomicBool,
    error: AtomicBool,
    registered_devices: AtomicU32,
    added_devices: AtomicU32,
    platform: RwLock<Option<Arc<dyn Platform>>>,
    config: RwLock<Value>,
    schema: RwLock<Value>,
    server_node: RwLock<Option<Arc<ServerNode>>>,
    aggregator: RwLock<Option<Arc<Aggregator>>>,
    pairing: RwLock<Option<PairingCodes>>,
}

impl PluginRecord {
    pub fn new(manifest: &PluginManifest, path: PathBuf) -> Self {
        Self {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            description: manifest.description.clone(),
            author: manifest.author.clone(),
            path,
            kind: RwLock::new(PlatformKind::Any),
            enabled: AtomicBool::new(true),
            loaded: AtomicBool::new(false),
            started: AtomicBool::new(false),
            configured: AtomicBool::new(false),
            paired: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            error: AtomicBool::new(false),
            registered_devices: AtomicU32::new(0),
            added_devices: AtomicU32::new(0),
            platform: RwLock::new(None),
            config: RwLock::new(Value::Object(Default::default())),
            schema: RwLock::new(Value::Object(Default::default())),
            server_node: RwLock::new(None),
            aggregator: RwLock::new(None),
            pairing: RwLock::new(None),
        }
    }

    pub fn kind(&self) -> PlatformKind {
        *self.kind.read()
    }

    pub fn set_kind(&self, kind: PlatformKind) {
        *self.kind.write() = kind;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::SeqCst)
    }

    pub fn is_paired(&self) -> bool {
        self.paired.load(Ordering::SeqCst)
    }

    pub fn set_paired(&self, paired: bool) {
        self.paired.store(paired, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn has_error(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    pub fn set_error(&self) {
        self.error.store(true, Ordering::SeqCst);
    }

    pub fn clear_error(&self) {
        self.error.store(false, Ordering::SeqCst);
    }

    pub fn registered_devices(&self) -> u32 {
        self.registered_devices.load(Ordering::SeqCst)
    }

    pub fn added_devices(&self) -> u32 {
        self.added_devices.load(Ordering::SeqCst)
    }

    pub(crate) fn count_registered(&self) -> u32 {
        self.added_devices.fetch_add(1, Ordering::SeqCst);
        self.registered_devices.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn count_removed(&self) {
        let _ = self
            .added_devices
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    pub(crate) fn reset_counters(&self) {
        self.registered_devices.store(0, Ordering::SeqCst);
        self.added_devices.store(0, Ordering::SeqCst);
    }

    pub(crate) fn clear_added(&self) {
        self.added_devices.store(0, Ordering::SeqCst);
    }

    pub(crate) fn set_loaded(&self, value: bool) {
        self.loaded.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_started(&self, value: bool) {
        self.started.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_configured(&self, value: bool) {
        self.configured.store(value, Ordering::SeqCst);
    }

    pub fn platform(&self) -> Option<Arc<dyn Platform>> {
        self.platform.read().clone()
    }

    pub(crate) fn set_platform(&self, platform: Option<Arc<dyn Platform>>) {
        *self.platform.write() = platform;
    }

    pub fn config(&self) -> Value {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: Value) {
        *self.config.write() = config;
    }

    pub fn schema(&self) -> Value {
        self.schema.read().clone()
    }

    pub fn set_schema(&self, schema: Value) {
        *self.schema.write() = schema;
    }

    /// Server node owned by this plugin (childbridge mode only).
    pub fn server_node(&self) -> Option<Arc<ServerNode>> {
        self.server_node.read().clone()
    }

    pub fn set_server_node(&self, node: Option<Arc<ServerNode>>) {
        *self.server_node.write() = node;
    }

    /// Aggregator owned by this plugin (childbridge `DynamicPlatform`).
    pub fn aggregator(&self) -> Option<Arc<Aggregator>> {
        self.aggregator.read().clone()
    }

    pub fn set_aggregator(&self, aggregator: Option<Arc<Aggregator>>) {
        *self.aggregator.write() = aggregator;
    }

    /// Latest pairing snapshot for the plugin's node.
    pub fn pairing(&self) -> Option<PairingCodes> {
        self.pairing.read().clone()
    }

    pub fn set_pairing(&self, codes: Option<PairingCodes>) {
        *self.pairing.write() = codes;
    }

    pub fn to_stored(&self) -> StoredPlugin {
        StoredPlugin {
            name: self.name.clone(),
            path: self.path.clone(),
            version: self.version.clone(),
            enabled: self.is_enabled(),
        }
    }

    pub fn summary(&self) -> PluginSummary {
        PluginSummary {
            name: self.name.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            author: self.author.clone(),
            kind: self.kind(),
            enabled: self.is_enabled(),
            loaded: self.is_loaded(),
            started: self.is_started(),
            configured: self.is_configured(),
            paired: self.is_paired(),
            connected: self.is_connected(),
            error: self.has_error(),
            registered_devices: self.registered_devices(),
            added_devices: self.added_devices(),
            qr_pairing_code: self.pairing().map(|c| c.qr),
            manual_pairing_code: self.pairing().map(|c| c.manual),
        }
    }
}

/// Wire shape of a plugin for the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSummary {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    #[serde(rename = "type")]
    pub kind: PlatformKind,
    pub enabled: bool,
    pub loaded: bool,
    pub started: bool,
    pub configured: bool,
    pub paired: bool,
    pub connected: bool,
    pub error: bool,
    pub registered_devices: u32,
    pub added_devices: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_pairing_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_pairing_code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&PlatformKind::Accessory).unwrap(),
            "\"AccessoryPlatform\""
        );
        assert_eq!(
            serde_json::to_string(&PlatformKind::Dynamic).unwrap(),
            "\"DynamicPlatform\""
        );
        assert_eq!(
            serde_json::to_string(&PlatformKind::Any).unwrap(),
            "\"AnyPlatform\""
        );
    }

    #[test]
    fn test_manifest_read_validates_name() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(
            dir.path().join(PluginManifest::FILE_NAME),
            r#"{"name":"","version":"1.0.0"}"#,
        )
        .unwrap();
        assert!(PluginManifest::read(dir.path()).is_err());

        fs::write(
            dir.path().join(PluginManifest::FILE_NAME),
            r#"{"name":"matterbridge-mock","version":"1.0.0","description":"Mock"}"#,
        )
        .unwrap();
        let manifest = PluginManifest::read(dir.path()).unwrap();
        assert_eq!(manifest.name, "matterbridge-mock");
    }

    #[test]
    fn test_record_counters() {
        let manifest = PluginManifest {
            name: "mock".into(),
            version: "1.0.0".into(),
            description: String::new(),
            author: String::new(),
        };
        let record = PluginRecord::new(&manifest, PathBuf::from("mock"));
        assert_eq!(record.count_registered(), 1);
        assert_eq!(record.count_registered(), 2);
        record.count_removed();
        record.count_removed();
        record.count_removed(); // saturates at zero
        assert_eq!(record.added_devices(), 0);
        assert_eq!(record.registered_devices(), 2);
    }
}
