//! Server node, aggregator and bridged endpoint primitives.
//!
//! A [`ServerNode`] is one commissionable network presence: it owns the
//! transport socket, the mDNS service handle, the fabric and session tables
//! and the endpoint-number persistence for everything attached beneath it.
//! Endpoint numbers are assigned once per storage key, remembered across
//! restarts and flushed to the node's storage context before close.

use crate::engine::event::{EngineEvent, EventSender, FabricAction};
use crate::engine::pairing::{self, PairingCodes};
use crate::error::{BridgeError, Result};
use crate::storage::StorageContext;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Matter device type of an aggregator endpoint.
pub const AGGREGATOR_DEVICE_TYPE: u32 = 0x000e;

/// Root endpoint number. Bridged endpoints start at 1.
pub const ROOT_ENDPOINT: u64 = 0;

const KEY_NEXT_NUMBER: &str = "nextEndpointNumber";
const KEY_NUMBERS: &str = "endpointNumbers";
const KEY_FABRICS: &str = "fabrics";

/// Basic information advertised by a server node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicInformation {
    pub device_name: String,
    pub device_type: u32,
    pub vendor_id: u16,
    pub vendor_name: String,
    pub product_id: u16,
    pub product_name: String,
    pub node_label: String,
    pub product_label: String,
    pub serial_number: String,
    pub unique_id: String,
    pub software_version: u32,
    pub software_version_string: String,
    pub hardware_version: u32,
    pub hardware_version_string: String,
}

impl BasicInformation {
    /// Defaults for a bridge node with the given name.
    pub fn bridge(device_name: impl Into<String>) -> Self {
        let device_name = device_name.into();
        let unique_id: String = (0..16)
            .map(|_| format!("{:x}", rand::random::<u8>() & 0xf))
            .collect();
        Self {
            node_label: device_name.clone(),
            product_label: device_name.clone(),
            serial_number: format!("MB-{}", &unique_id[..8]),
            unique_id,
            device_name,
            device_type: AGGREGATOR_DEVICE_TYPE,
            vendor_id: 0xFFF1,
            vendor_name: "Matterbridge".to_string(),
            product_id: 0x8000,
            product_name: "Matterbridge Aggregator".to_string(),
            software_version: 1,
            software_version_string: env!("CARGO_PKG_VERSION").to_string(),
            hardware_version: 1,
            hardware_version_string: "1.0".to_string(),
        }
    }
}

/// A raw fabric entry as the engine exposes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fabric {
    pub index: u8,
    pub fabric_id: u64,
    pub node_id: u64,
    pub root_node_id: u64,
    pub root_vendor_id: u16,
    pub label: String,
}

/// A raw secure session entry as the engine exposes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub name: String,
    pub node_id: u64,
    pub peer_node_id: u64,
    pub secure: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub subscriptions: u32,
    pub fabric_index: Option<u8>,
}

/// One endpoint attached beneath a node or aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedEndpoint {
    pub key: String,
    pub number: u64,
    pub device_types: Vec<u32>,
}

/// Handle on the per-node mDNS service.
pub struct MdnsService {
    store_id: String,
    instance: String,
    advertising: AtomicBool,
    closed: AtomicBool,
}

impl MdnsService {
    fn new(store_id: &str) -> Self {
        let host = gethostname::gethostname().to_string_lossy().into_owned();
        Self {
            store_id: store_id.to_string(),
            instance: format!("{store_id}@{host}"),
            advertising: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn advertise(&self) {
        if !self.closed.load(Ordering::SeqCst) && !self.advertising.swap(true, Ordering::SeqCst) {
            debug!("[Engine] {} advertising as {}", self.store_id, self.instance);
        }
    }

    fn stop(&self) {
        if self.advertising.swap(false, Ordering::SeqCst) {
            debug!("[Engine] {} stopped advertising", self.store_id);
        }
    }

    fn close(&self) {
        self.stop();
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Closed {} MdnsService", self.store_id);
        }
    }
}

/// An aggregator endpoint presenting bridged devices as its children.
pub struct Aggregator {
    node: RwLock<Option<Weak<ServerNode>>>,
    number: AtomicU64,
    children: RwLock<Vec<AttachedEndpoint>>,
}

impl Aggregator {
    pub(super) fn new() -> Self {
        Self {
            node: RwLock::new(None),
            number: AtomicU64::new(ROOT_ENDPOINT),
            children: RwLock::new(Vec::new()),
        }
    }

    /// The aggregator's own endpoint number (0 until added to a node).
    pub fn number(&self) -> u64 {
        self.number.load(Ordering::SeqCst)
    }

    pub fn is_installed(&self) -> bool {
        self.node.read().is_some()
    }

    fn owning_node(&self) -> Result<Arc<ServerNode>> {
        self.node
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| BridgeError::NotReady("aggregator".to_string()))
    }

    /// Attach a bridged endpoint as a child. Fails `NotReady` until the
    /// aggregator itself has been added to a server node.
    pub fn attach(&self, key: &str, device_types: &[u32]) -> Result<u64> {
        let node = self.owning_node()?;
        let number = node.assign_number(key);
        self.children.write().push(AttachedEndpoint {
            key: key.to_string(),
            number,
            device_types: device_types.to_vec(),
        });
        debug!(
            "[Engine] {} attached endpoint {key} as number {number} under aggregator",
            node.store_id()
        );
        Ok(number)
    }

    /// Detach a child endpoint. Returns whether it was present.
    pub fn detach(&self, key: &str) -> bool {
        let mut children = self.children.write();
        let before = children.len();
        children.retain(|c| c.key != key);
        before != children.len()
    }

    pub fn children(&self) -> Vec<AttachedEndpoint> {
        self.children.read().clone()
    }
}

/// A commissionable Matter server node.
pub struct ServerNode {
    store_id: String,
    port: u16,
    passcode: u32,
    discriminator: u16,
    info: BasicInformation,
    storage: Arc<StorageContext>,
    events: EventSender,
    events_rx: Mutex<Option<mpsc::Receiver<EngineEvent>>>,
    socket: Mutex<Option<UdpSocket>>,
    ready: AtomicBool,
    online: AtomicBool,
    started: AtomicBool,
    mdns: MdnsService,
    fabrics: RwLock<BTreeMap<u8, Fabric>>,
    sessions: RwLock<BTreeMap<String, Session>>,
    endpoints: RwLock<Vec<AttachedEndpoint>>,
    aggregator: RwLock<Option<Arc<Aggregator>>>,
    next_number: AtomicU64,
    numbers: Mutex<HashMap<String, u64>>,
    numbers_dirty: AtomicBool,
    attribute_version: AtomicU64,
}

impl ServerNode {
    pub(super) fn create(
        store_id: &str,
        port: u16,
        passcode: u32,
        discriminator: u16,
        mut info: BasicInformation,
        storage: Arc<StorageContext>,
    ) -> Result<Arc<Self>> {
        // Unique id is stable per store: reuse the persisted one if present.
        if let Some(unique_id) = storage.get::<String>("uniqueId") {
            info.unique_id = unique_id;
        }

        let fabrics: Vec<Fabric> = storage.get_or(KEY_FABRICS, Vec::new());
        let numbers: HashMap<String, u64> = storage.get_or(KEY_NUMBERS, HashMap::new());
        let next_number: u64 = storage.get_or(KEY_NEXT_NUMBER, 1);

        let (events, rx) = EventSender::new(store_id);
        let node = Arc::new(Self {
            store_id: store_id.to_string(),
            port,
            passcode,
            discriminator,
            mdns: MdnsService::new(store_id),
            events,
            events_rx: Mutex::new(Some(rx)),
            socket: Mutex::new(None),
            ready: AtomicBool::new(true),
            online: AtomicBool::new(false),
            started: AtomicBool::new(false),
            fabrics: RwLock::new(fabrics.into_iter().map(|f| (f.index, f)).collect()),
            sessions: RwLock::new(BTreeMap::new()),
            endpoints: RwLock::new(Vec::new()),
            aggregator: RwLock::new(None),
            next_number: AtomicU64::new(next_number),
            numbers: Mutex::new(numbers),
            numbers_dirty: AtomicBool::new(false),
            attribute_version: AtomicU64::new(0),
            info,
            storage,
        });
        node.persist_basic_information()?;
        Ok(node)
    }

    fn persist_basic_information(&self) -> Result<()> {
        self.storage.set("storeId", &self.store_id)?;
        self.storage.set("deviceName", &self.info.device_name)?;
        self.storage.set("deviceType", &self.info.device_type)?;
        self.storage.set("vendorId", &self.info.vendor_id)?;
        self.storage.set("vendorName", &self.info.vendor_name)?;
        self.storage.set("productId", &self.info.product_id)?;
        self.storage.set("productName", &self.info.product_name)?;
        self.storage.set("nodeLabel", &self.info.node_label)?;
        self.storage.set("productLabel", &self.info.product_label)?;
        self.storage.set("serialNumber", &self.info.serial_number)?;
        self.storage.set("uniqueId", &self.info.unique_id)?;
        self.storage.set("softwareVersion", &self.info.software_version)?;
        self.storage
            .set("softwareVersionString", &self.info.software_version_string)?;
        self.storage.set("hardwareVersion", &self.info.hardware_version)?;
        self.storage
            .set("hardwareVersionString", &self.info.hardware_version_string)?;
        Ok(())
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn basic_information(&self) -> &BasicInformation {
        &self.info
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn is_commissioned(&self) -> bool {
        !self.fabrics.read().is_empty()
    }

    pub fn mdns(&self) -> &MdnsService {
        &self.mdns
    }

    /// Take the event receiver. The commissioning supervisor calls this once
    /// when it adopts the node.
    pub fn take_events(&self) -> Option<mpsc::Receiver<EngineEvent>> {
        self.events_rx.lock().take()
    }

    pub fn pairing_codes(&self) -> PairingCodes {
        pairing::pairing_codes(
            self.info.vendor_id,
            self.info.product_id,
            self.discriminator,
            self.passcode,
        )
    }

    /// Start the node: bind the transport socket and go online. Idempotent.
    /// Emits `Online`, then `Commissioned` when fabrics were restored.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let socket = UdpSocket::bind(("::", self.port))
            .or_else(|_| UdpSocket::bind(("0.0.0.0", self.port)))
            .map_err(|e| {
                self.started.store(false, Ordering::SeqCst);
                if e.kind() == std::io::ErrorKind::AddrInUse {
                    BridgeError::PortInUse(self.port)
                } else {
                    BridgeError::Engine(format!("{}: bind failed: {e}", self.store_id))
                }
            })?;
        *self.socket.lock() = Some(socket);

        self.online.store(true, Ordering::SeqCst);
        info!(
            "[Engine] {} online on port {} (commissioned: {})",
            self.store_id,
            self.port,
            self.is_commissioned()
        );
        self.events.post(EngineEvent::Online);
        if self.is_commissioned() {
            self.events.post(EngineEvent::Commissioned);
        }
        Ok(())
    }

    /// Re-arm mDNS advertising for a commissioning window.
    pub fn advertise(&self) {
        self.mdns.advertise();
    }

    pub fn stop_advertising(&self) {
        self.mdns.stop();
    }

    /// Add an aggregator directly under this node.
    pub fn add_aggregator(self: &Arc<Self>, aggregator: &Arc<Aggregator>) {
        let number = self.assign_number(&format!("{}.aggregator", self.store_id));
        aggregator.number.store(number, Ordering::SeqCst);
        *aggregator.node.write() = Some(Arc::downgrade(self));
        *self.aggregator.write() = Some(aggregator.clone());
        debug!("[Engine] {} aggregator installed as endpoint {number}", self.store_id);
    }

    pub fn aggregator(&self) -> Option<Arc<Aggregator>> {
        self.aggregator.read().clone()
    }

    /// Attach a bridged endpoint directly under the node (bypassing any
    /// aggregator).
    pub fn attach(&self, key: &str, device_types: &[u32]) -> Result<u64> {
        if !self.is_ready() {
            return Err(BridgeError::NotReady(self.store_id.clone()));
        }
        let number = self.assign_number(key);
        self.endpoints.write().push(AttachedEndpoint {
            key: key.to_string(),
            number,
            device_types: device_types.to_vec(),
        });
        debug!("[Engine] {} attached endpoint {key} as number {number}", self.store_id);
        Ok(number)
    }

    /// Detach a directly attached endpoint. Returns whether it was present.
    pub fn detach(&self, key: &str) -> bool {
        let mut endpoints = self.endpoints.write();
        let before = endpoints.len();
        endpoints.retain(|c| c.key != key);
        before != endpoints.len()
    }

    /// All endpoints under this node: direct children plus aggregator
    /// children.
    pub fn attached_endpoints(&self) -> Vec<AttachedEndpoint> {
        let mut all = self.endpoints.read().clone();
        if let Some(aggregator) = self.aggregator.read().as_ref() {
            all.extend(aggregator.children());
        }
        all
    }

    fn assign_number(&self, key: &str) -> u64 {
        let mut numbers = self.numbers.lock();
        if let Some(&number) = numbers.get(key) {
            return number;
        }
        let number = self.next_number.fetch_add(1, Ordering::SeqCst);
        numbers.insert(key.to_string(), number);
        self.numbers_dirty.store(true, Ordering::SeqCst);
        number
    }

    /// Persisted number for a storage key, if any.
    pub fn persisted_number(&self, key: &str) -> Option<u64> {
        self.numbers.lock().get(key).copied()
    }

    /// Flush endpoint-number persistence. Awaited by close; also called by
    /// the cleanup orchestrator before teardown.
    pub fn flush_endpoint_numbers(&self) -> Result<()> {
        if !self.numbers_dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let numbers = self.numbers.lock().clone();
        self.storage.set(KEY_NUMBERS, &numbers)?;
        self.storage
            .set(KEY_NEXT_NUMBER, &self.next_number.load(Ordering::SeqCst))?;
        debug!(
            "[Engine] {} persisted {} endpoint numbers",
            self.store_id,
            numbers.len()
        );
        Ok(())
    }

    /// Close the node: flush endpoint numbers, verify every attached
    /// endpoint has a persisted number, drop the socket, close mDNS.
    pub fn close(&self) -> Result<()> {
        self.flush_endpoint_numbers()?;

        for endpoint in self.attached_endpoints() {
            match self.persisted_number(&endpoint.key) {
                Some(n) if n > ROOT_ENDPOINT => {}
                other => {
                    return Err(BridgeError::Engine(format!(
                        "{}: endpoint {} has no persisted number ({other:?})",
                        self.store_id, endpoint.key
                    )));
                }
            }
        }

        *self.socket.lock() = None;
        self.started.store(false, Ordering::SeqCst);
        if self.online.swap(false, Ordering::SeqCst) {
            self.events.post(EngineEvent::Offline);
        }
        self.mdns.close();
        info!("[Engine] {} closed", self.store_id);
        Ok(())
    }

    /// Transport failure: the node drops offline and can be started again.
    pub fn fail_transport(&self, reason: &str) {
        warn!("[Engine] {} transport failed: {reason}", self.store_id);
        *self.socket.lock() = None;
        self.started.store(false, Ordering::SeqCst);
        self.mdns.stop();
        if self.online.swap(false, Ordering::SeqCst) {
            self.events.post(EngineEvent::Offline);
        }
    }

    // --- Fabric and session surface -------------------------------------
    //
    // Controllers drive these through the protocol; the control plane and
    // the tests drive them directly. Either way the tables here are the
    // source of truth that consumers re-read on every event.

    pub fn fabrics(&self) -> Vec<Fabric> {
        self.fabrics.read().values().cloned().collect()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.read().values().cloned().collect()
    }

    /// Add or update a fabric (a controller paired or relabelled).
    pub fn commission(&self, fabric: Fabric) -> Result<()> {
        let index = fabric.index;
        let (first, action) = {
            let mut fabrics = self.fabrics.write();
            let action = if fabrics.insert(index, fabric).is_some() {
                FabricAction::Updated
            } else {
                FabricAction::Added
            };
            (fabrics.len() == 1 && action == FabricAction::Added, action)
        };
        self.persist_fabrics()?;
        self.events.post(EngineEvent::FabricsChanged { index, action });
        if first {
            self.events.post(EngineEvent::Commissioned);
        }
        Ok(())
    }

    /// Remove a fabric by index. Removing the last fabric factory-resets
    /// the node and emits `Decommissioned`.
    pub fn remove_fabric(&self, index: u8) -> Result<()> {
        let emptied = {
            let mut fabrics = self.fabrics.write();
            if fabrics.remove(&index).is_none() {
                return Err(BridgeError::NotFound(format!(
                    "{}: fabric {index}",
                    self.store_id
                )));
            }
            fabrics.is_empty()
        };
        self.persist_fabrics()?;
        self.events.post(EngineEvent::FabricsChanged {
            index,
            action: FabricAction::Removed,
        });
        if emptied {
            self.sessions.write().clear();
            info!("[Engine] {} decommissioned (last fabric removed)", self.store_id);
            self.events.post(EngineEvent::Decommissioned);
        }
        Ok(())
    }

    fn persist_fabrics(&self) -> Result<()> {
        let fabrics: Vec<Fabric> = self.fabrics.read().values().cloned().collect();
        self.storage.set(KEY_FABRICS, &fabrics)
    }

    pub fn open_session(&self, name: &str, node_id: u64, peer_node_id: u64, fabric_index: Option<u8>) {
        let now = Utc::now();
        self.sessions.write().insert(
            name.to_string(),
            Session {
                name: name.to_string(),
                node_id,
                peer_node_id,
                secure: true,
                active: true,
                created_at: now,
                last_active: now,
                subscriptions: 0,
                fabric_index,
            },
        );
        self.events.post(EngineEvent::SessionOpened {
            name: name.to_string(),
        });
    }

    pub fn close_session(&self, name: &str) {
        if self.sessions.write().remove(name).is_some() {
            self.events.post(EngineEvent::SessionClosed {
                name: name.to_string(),
            });
        } else {
            warn!("[Engine] {} close of unknown session {name}", self.store_id);
        }
    }

    pub fn set_subscriptions(&self, name: &str, count: u32) {
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get_mut(name) {
            session.subscriptions = count;
            session.last_active = Utc::now();
            drop(sessions);
            self.events.post(EngineEvent::SessionSubscriptionsChanged {
                name: name.to_string(),
            });
        }
    }

    /// Record an attribute write on an endpoint; controllers holding
    /// subscriptions observe the bumped data version.
    pub fn notify_attribute_change(&self, key: &str, cluster: u32, attribute: &str) {
        let version = self.attribute_version.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            "[Engine] {} attribute {key}/{cluster:#06x}/{attribute} changed (v{version})",
            self.store_id
        );
    }
}
