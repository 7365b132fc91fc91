//! In-memory device registry.
//!
//! Plugins register [`Device`] records here; the bridge core attaches them
//! to the right aggregator or server node and writes the assigned endpoint
//! number back. Registration events go out on a broadcast channel consumed
//! by the bridge and the control plane.

use crate::engine::ServerNode;
use crate::error::{BridgeError, Result};
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

/// A Matter device type with its cluster revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceType {
    pub code: u32,
    pub revision: u16,
}

/// Where the device attaches when the bridge places it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    /// Under the aggregator of the owning context.
    #[default]
    Default,
    /// Directly under the shared server node, bypassing the aggregator.
    Matter,
    /// On a dedicated server node of its own.
    Server,
}

/// A semantic tag attached to an endpoint (switch position, button role).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticTag {
    pub namespace_id: u8,
    pub tag: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Serialized shape of a device record.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceDef {
    storage_key: String,
    name: String,
    plugin: Option<String>,
    device_types: Vec<DeviceType>,
    #[serde(default)]
    tags: Vec<SemanticTag>,
    #[serde(default)]
    composed: bool,
    #[serde(default)]
    mode: DeviceMode,
    #[serde(default)]
    parent_key: Option<String>,
    #[serde(default)]
    number: u64,
    #[serde(default)]
    attributes: HashMap<u32, HashMap<String, Value>>,
}

/// One bridged device.
///
/// The storage key is the stable identity used for endpoint-number
/// persistence; it must be unique across all plugins.
#[derive(Debug)]
pub struct Device {
    pub storage_key: String,
    pub name: String,
    pub device_types: Vec<DeviceType>,
    pub tags: Vec<SemanticTag>,
    pub composed: bool,
    pub mode: DeviceMode,
    pub parent_key: Option<String>,
    plugin: RwLock<Option<String>>,
    number: AtomicU64,
    attributes: RwLock<HashMap<u32, HashMap<String, Value>>>,
    node: RwLock<Option<Weak<ServerNode>>>,
}

impl Device {
    pub fn new(storage_key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            storage_key: storage_key.into(),
            name: name.into(),
            device_types: Vec::new(),
            tags: Vec::new(),
            composed: false,
            mode: DeviceMode::Default,
            parent_key: None,
            plugin: RwLock::new(None),
            number: AtomicU64::new(0),
            attributes: RwLock::new(HashMap::new()),
            node: RwLock::new(None),
        }
    }

    pub fn with_device_type(mut self, code: u32, revision: u16) -> Self {
        self.device_types.push(DeviceType { code, revision });
        self
    }

    pub fn with_tag(mut self, namespace_id: u8, tag: u8, label: Option<&str>) -> Self {
        self.tags.push(SemanticTag {
            namespace_id,
            tag,
            label: label.map(str::to_string),
        });
        self
    }

    pub fn with_mode(mut self, mode: DeviceMode) -> Self {
        self.mode = mode;
        self
    }

    /// Mark the device as a composed (bridged) endpoint with children.
    pub fn composed(mut self) -> Self {
        self.composed = true;
        self
    }

    pub fn with_parent(mut self, parent_key: impl Into<String>) -> Self {
        self.parent_key = Some(parent_key.into());
        self
    }

    pub fn with_attribute(self, cluster: u32, attribute: &str, value: Value) -> Self {
        self.attributes
            .write()
            .entry(cluster)
            .or_default()
            .insert(attribute.to_string(), value);
        self
    }

    pub fn plugin(&self) -> Option<String> {
        self.plugin.read().clone()
    }

    /// Assigned endpoint number; 0 until attached.
    pub fn number(&self) -> u64 {
        self.number.load(Ordering::SeqCst)
    }

    pub fn device_type_codes(&self) -> Vec<u32> {
        self.device_types.iter().map(|t| t.code).collect()
    }

    pub fn has_cluster(&self, cluster: u32) -> bool {
        self.attributes.read().contains_key(&cluster)
    }

    pub fn attribute(&self, cluster: u32, attribute: &str) -> Option<Value> {
        self.attributes
            .read()
            .get(&cluster)
            .and_then(|m| m.get(attribute))
            .cloned()
    }

    fn set_attribute(&self, cluster: u32, attribute: &str, value: Value) {
        self.attributes
            .write()
            .entry(cluster)
            .or_default()
            .insert(attribute.to_string(), value);
    }

    /// Called by the bridge when the device lands under a server node.
    pub fn attached(&self, node: &Arc<ServerNode>, number: u64) {
        *self.node.write() = Some(Arc::downgrade(node));
        self.number.store(number, Ordering::SeqCst);
    }

    pub fn detached(&self) {
        *self.node.write() = None;
        self.number.store(0, Ordering::SeqCst);
    }

    fn owning_node(&self) -> Option<Arc<ServerNode>> {
        self.node.read().as_ref().and_then(Weak::upgrade)
    }

    fn to_def(&self) -> DeviceDef {
        DeviceDef {
            storage_key: self.storage_key.clone(),
            name: self.name.clone(),
            plugin: self.plugin(),
            device_types: self.device_types.clone(),
            tags: self.tags.clone(),
            composed: self.composed,
            mode: self.mode,
            parent_key: self.parent_key.clone(),
            number: self.number(),
            attributes: self.attributes.read().clone(),
        }
    }

    fn from_def(def: DeviceDef) -> Self {
        Self {
            storage_key: def.storage_key,
            name: def.name,
            device_types: def.device_types,
            tags: def.tags,
            composed: def.composed,
            mode: def.mode,
            parent_key: def.parent_key,
            plugin: RwLock::new(def.plugin),
            number: AtomicU64::new(def.number),
            attributes: RwLock::new(def.attributes),
            node: RwLock::new(None),
        }
    }
}

impl Serialize for Device {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_def().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Device {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        DeviceDef::deserialize(deserializer).map(Device::from_def)
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.storage_key == other.storage_key
            && self.name == other.name
            && self.plugin() == other.plugin()
            && self.device_types == other.device_types
            && self.tags == other.tags
            && self.composed == other.composed
            && self.mode == other.mode
            && self.parent_key == other.parent_key
            && self.number() == other.number()
            && *self.attributes.read() == *other.attributes.read()
    }
}

/// Registration event broadcast to bridge and control plane.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    DeviceAdded(Arc<Device>),
    DeviceRemoved(Arc<Device>),
}

/// The device collection, keyed by storage key.
pub struct EndpointRegistry {
    devices: RwLock<BTreeMap<String, Arc<Device>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            devices: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register a device for a plugin. Validates the device-type list,
    /// rejects duplicate storage keys across all plugins and emits
    /// `DeviceAdded`.
    pub fn register(&self, plugin: &str, device: Device) -> Result<Arc<Device>> {
        if device.device_types.is_empty() {
            return Err(BridgeError::InvalidDevice {
                key: device.storage_key,
                reason: "empty device type list".to_string(),
            });
        }
        if let Some(parent_key) = &device.parent_key
            && !self.devices.read().contains_key(parent_key)
        {
            return Err(BridgeError::InvalidDevice {
                key: device.storage_key.clone(),
                reason: format!("parent {parent_key} is not registered"),
            });
        }

        *device.plugin.write() = Some(plugin.to_string());
        let device = Arc::new(device);

        {
            let mut devices = self.devices.write();
            if devices.contains_key(&device.storage_key) {
                return Err(BridgeError::DuplicateKey(device.storage_key.clone()));
            }
            devices.insert(device.storage_key.clone(), device.clone());
        }

        info!(
            "[Registry] {} registered device {} ({})",
            plugin, device.name, device.storage_key
        );
        let _ = self.events.send(RegistryEvent::DeviceAdded(device.clone()));
        Ok(device)
    }

    /// Remove a device. Unknown keys log a warning and succeed (idempotent
    /// remove).
    pub fn unregister(&self, plugin: &str, storage_key: &str) {
        let removed = {
            let mut devices = self.devices.write();
            match devices.get(storage_key) {
                Some(device) if device.plugin().as_deref() == Some(plugin) => {
                    devices.remove(storage_key)
                }
                Some(device) => {
                    warn!(
                        "[Registry] {plugin} tried to remove {} owned by {:?}",
                        storage_key,
                        device.plugin()
                    );
                    None
                }
                None => {
                    warn!("[Registry] {plugin} removed unknown device {storage_key}");
                    None
                }
            }
        };
        if let Some(device) = removed {
            device.detached();
            info!("[Registry] {plugin} removed device {storage_key}");
            let _ = self.events.send(RegistryEvent::DeviceRemoved(device));
        }
    }

    /// Remove every device owned by a plugin, emitting one event per
    /// device.
    pub fn remove_all(&self, plugin: &str) -> usize {
        let keys: Vec<String> = self
            .by_plugin(plugin)
            .iter()
            .map(|d| d.storage_key.clone())
            .collect();
        for key in &keys {
            self.unregister(plugin, key);
        }
        keys.len()
    }

    pub fn get(&self, storage_key: &str) -> Option<Arc<Device>> {
        self.devices.read().get(storage_key).cloned()
    }

    pub fn by_plugin(&self, plugin: &str) -> Vec<Arc<Device>> {
        self.devices
            .read()
            .values()
            .filter(|d| d.plugin().as_deref() == Some(plugin))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<Device>> {
        self.devices.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Write an attribute; the write serialises through the owning node so
    /// subscribed controllers observe it.
    pub fn set_attribute(
        &self,
        storage_key: &str,
        cluster: u32,
        attribute: &str,
        value: Value,
    ) -> Result<()> {
        let device = self
            .get(storage_key)
            .ok_or_else(|| BridgeError::NotFound(storage_key.to_string()))?;
        device.set_attribute(cluster, attribute, value);
        if let Some(node) = device.owning_node() {
            node.notify_attribute_change(storage_key, cluster, attribute);
        }
        Ok(())
    }

    pub fn get_attribute(&self, storage_key: &str, cluster: u32, attribute: &str) -> Option<Value> {
        self.get(storage_key)?.attribute(cluster, attribute)
    }

    pub fn has_cluster(&self, storage_key: &str, cluster: u32) -> bool {
        self.get(storage_key)
            .map(|d| d.has_cluster(cluster))
            .unwrap_or(false)
    }

    /// Fire a device event (switch press, button release) towards
    /// subscribed controllers.
    pub fn trigger_event(&self, storage_key: &str, event: &str, payload: Value) -> Result<()> {
        let device = self
            .get(storage_key)
            .ok_or_else(|| BridgeError::NotFound(storage_key.to_string()))?;
        debug!(
            "[Registry] {} event {event} payload {payload}",
            device.storage_key
        );
        if let Some(node) = device.owning_node() {
            node.notify_attribute_change(storage_key, 0x003b, event);
        }
        Ok(())
    }
}
