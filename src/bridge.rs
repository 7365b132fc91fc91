//! Bridge core: the top-level coordinator.
//!
//! Owns the storage managers, the engine, the plugin manager, the
//! commissioning supervisor and the broadcast bus. Selects the operating
//! mode at startup, places devices on the right parent, isolates plugin
//! failures and fans events out to the control plane. One instance exists
//! per process; collaborators receive it as an `Arc`.

use crate::commissioning::{CommissioningSupervisor, MatterSnapshot};
use crate::config::{Mode, Settings, VirtualMode};
use crate::engine::{Aggregator, BasicInformation, MatterEngine, ServerNode};
use crate::error::{BridgeError, Result};
use crate::frontend::{BroadcastEvent, Changed, Severity};
use crate::monitor::ResourceMonitor;
use crate::plugin::install::{self, PackageTool};
use crate::plugin::{PlatformFactory, PluginManager, PluginRecord};
use crate::registry::{Device, DeviceMode, EndpointRegistry, RegistryEvent};
use crate::storage::{StorageContext, StorageManager};
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const KEY_PASSWORD: &str = "password";
const KEY_VIRTUAL_MODE: &str = "virtualMode";
const KEY_SHELLY_NET: &str = "shellynet";

/// Store id of the shared server node in bridge mode.
pub const BRIDGE_STORE_ID: &str = "Matterbridge";

pub struct Matterbridge {
    pub(crate) settings: RwLock<Settings>,
    pub(crate) storage: StorageManager,
    pub(crate) context: Arc<StorageContext>,
    pub(crate) engine: MatterEngine,
    pub(crate) registry: Arc<EndpointRegistry>,
    pub(crate) plugins: Arc<PluginManager>,
    pub(crate) supervisor: CommissioningSupervisor,
    pub(crate) broadcasts: broadcast::Sender<BroadcastEvent>,
    pub(crate) monitor: ResourceMonitor,
    pub(crate) shutdown: CancellationToken,
    pub(crate) destroyed: AtomicBool,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    server_node: RwLock<Option<Arc<ServerNode>>>,
    aggregator: RwLock<Option<Arc<Aggregator>>>,
    /// Nodes stood up for devices in `Server` mode.
    dedicated_nodes: RwLock<Vec<Arc<ServerNode>>>,
    started: AtomicBool,
}

impl Matterbridge {
    /// Open storage and the engine, restore persisted state and spawn the
    /// registry fan-out task. Plugins are not started yet; call
    /// [`startup`](Self::startup) once the platform factories are
    /// registered.
    pub fn initialize(mut settings: Settings) -> Result<Arc<Self>> {
        info!(
            "[Bridge] Initializing in {} mode (home {})",
            settings.mode,
            settings.home_dir.display()
        );

        let storage = StorageManager::open(settings.storage_dir())?;
        let context = storage.context("matterbridge")?;
        let engine = MatterEngine::open(settings.matter_storage_dir())?;

        if let Some(mode) = context.get::<String>(KEY_VIRTUAL_MODE) {
            settings.virtual_mode = VirtualMode::from_str(&mode).unwrap_or_default();
        }
        let snapshot_interval = settings.snapshot_interval;
        let memory_check = settings.memory_check;

        let (broadcasts, _) = broadcast::channel(128);
        let registry = Arc::new(EndpointRegistry::new());
        let plugins = PluginManager::new(settings.mode, registry.clone(), context.clone());
        plugins.load_from_storage();

        let bridge = Arc::new(Self {
            settings: RwLock::new(settings),
            storage,
            context,
            engine,
            registry,
            plugins,
            supervisor: CommissioningSupervisor::new(broadcasts.clone()),
            broadcasts,
            monitor: ResourceMonitor::start(snapshot_interval, memory_check),
            shutdown: CancellationToken::new(),
            destroyed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            server_node: RwLock::new(None),
            aggregator: RwLock::new(None),
            dedicated_nodes: RwLock::new(Vec::new()),
            started: AtomicBool::new(false),
        });

        bridge.spawn_registry_fanout();
        bridge.spawn_engine_watchdog();
        Ok(bridge)
    }

    /// Register a platform factory under a plugin name.
    pub fn register_platform(&self, name: &str, factory: PlatformFactory) {
        self.plugins.register_factory(name, factory);
    }

    pub fn mode(&self) -> Mode {
        self.settings.read().mode
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.plugins
    }

    pub fn supervisor(&self) -> &CommissioningSupervisor {
        &self.supervisor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.broadcasts.subscribe()
    }

    pub fn broadcast(&self, event: BroadcastEvent) {
        let _ = self.broadcasts.send(event);
    }

    /// The shared server node (bridge mode).
    pub fn server_node(&self) -> Option<Arc<ServerNode>> {
        self.server_node.read().clone()
    }

    pub fn aggregator(&self) -> Option<Arc<Aggregator>> {
        self.aggregator.read().clone()
    }

    /// Every server node the bridge currently owns, shared and per-plugin.
    pub fn server_nodes(&self) -> Vec<Arc<ServerNode>> {
        let mut nodes = Vec::new();
        if let Some(node) = self.server_node.read().clone() {
            nodes.push(node);
        }
        for record in self.plugins.plugins() {
            if let Some(node) = record.server_node() {
                nodes.push(node);
            }
        }
        nodes.extend(self.dedicated_nodes.read().iter().cloned());
        nodes
    }

    /// Run the mode-specific startup sequence.
    pub async fn startup(self: &Arc<Self>) -> Result<()> {
        match self.mode() {
            Mode::Bridge | Mode::Test => self.start_bridge().await,
            Mode::Childbridge => self.start_childbridge().await,
            Mode::Controller => {
                info!("[Bridge] Controller mode: no aggregation, no plugins started");
                self.started.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    /// Bridge mode: one server node, one aggregator, all plugins beneath.
    async fn start_bridge(self: &Arc<Self>) -> Result<()> {
        let (port, passcode, discriminator, pause) = {
            let settings = self.settings.read();
            (
                settings.matter_port,
                settings.passcode,
                settings.discriminator,
                settings.pause_matter_interval(),
            )
        };

        let node = self.create_and_start_node(BRIDGE_STORE_ID, port, passcode, discriminator)?;
        let aggregator = self.engine.create_aggregator();
        node.add_aggregator(&aggregator);
        self.supervisor.adopt(&node)?;

        *self.server_node.write() = Some(node.clone());
        *self.aggregator.write() = Some(aggregator);

        for record in self.plugins.enabled_plugins() {
            if let Err(e) = self.bring_up_plugin(&record, "Matterbridge is starting").await {
                // One plugin must not take the bridge down
                error!("[Bridge] Plugin {} failed to start: {e}", record.name);
                self.broadcast(BroadcastEvent::snackbar(
                    Severity::Error,
                    format!("Plugin {} failed to start", record.name),
                ));
            }
        }

        tokio::time::sleep(pause).await;
        for record in self.plugins.enabled_plugins() {
            if record.is_started()
                && let Err(e) = self.plugins.configure(&record).await
            {
                error!("[Bridge] Plugin {} failed to configure: {e}", record.name);
            }
        }

        self.started.store(true, Ordering::SeqCst);
        info!("[Bridge] Matterbridge bridge started");
        self.broadcast(BroadcastEvent::refresh(Changed::Plugins));
        Ok(())
    }

    /// Childbridge mode: one server node per enabled plugin.
    async fn start_childbridge(self: &Arc<Self>) -> Result<()> {
        let (base_port, passcode, discriminator, start_interval, pause) = {
            let settings = self.settings.read();
            (
                settings.matter_port,
                settings.passcode,
                settings.discriminator,
                settings.start_matter_interval(),
                settings.pause_matter_interval(),
            )
        };

        for (index, record) in self.plugins.enabled_plugins().into_iter().enumerate() {
            let port = if base_port == 0 {
                0
            } else {
                base_port + index as u16
            };
            // Discriminators must differ per commissionable node
            let discriminator = discriminator.wrapping_add(index as u16) & 0x0FFF;

            if let Err(e) = self
                .bring_up_child_node(&record, port, passcode, discriminator)
                .await
            {
                error!("[Bridge] Plugin {} failed to start: {e}", record.name);
                self.broadcast(BroadcastEvent::snackbar(
                    Severity::Error,
                    format!("Plugin {} failed to start", record.name),
                ));
            }
            tokio::time::sleep(start_interval).await;
        }

        tokio::time::sleep(pause).await;
        for record in self.plugins.enabled_plugins() {
            if record.is_started()
                && let Err(e) = self.plugins.configure(&record).await
            {
                error!("[Bridge] Plugin {} failed to configure: {e}", record.name);
            }
        }

        self.started.store(true, Ordering::SeqCst);
        info!("[Bridge] Matterbridge childbridge started");
        self.broadcast(BroadcastEvent::refresh(Changed::Plugins));
        Ok(())
    }

    async fn bring_up_child_node(
        self: &Arc<Self>,
        record: &Arc<PluginRecord>,
        port: u16,
        passcode: u32,
        discriminator: u16,
    ) -> Result<()> {
        self.plugins.load(record)?;
        self.plugins.start(record, "Matterbridge is starting").await?;

        let node = self.create_and_start_node(&record.name, port, passcode, discriminator)?;
        if record.kind() == crate::plugin::PlatformKind::Dynamic {
            let aggregator = self.engine.create_aggregator();
            node.add_aggregator(&aggregator);
            record.set_aggregator(Some(aggregator));
        }
        self.supervisor.adopt(&node)?;
        record.set_server_node(Some(node.clone()));
        record.set_pairing(Some(node.pairing_codes()));

        for device in self.registry.by_plugin(&record.name) {
            if let Err(e) = self.place_device(&device) {
                error!("[Bridge] Failed to place {}: {e}", device.storage_key);
            }
        }
        Ok(())
    }

    /// Load + start one plugin and place its devices (bridge mode).
    async fn bring_up_plugin(
        self: &Arc<Self>,
        record: &Arc<PluginRecord>,
        reason: &str,
    ) -> Result<()> {
        self.plugins.load(record)?;
        self.plugins.start(record, reason).await?;
        for device in self.registry.by_plugin(&record.name) {
            if let Err(e) = self.place_device(&device) {
                error!("[Bridge] Failed to place {}: {e}", device.storage_key);
            }
        }
        Ok(())
    }

    /// Create a node and start it, retrying once on a used port.
    fn create_and_start_node(
        &self,
        store_id: &str,
        port: u16,
        passcode: u32,
        discriminator: u16,
    ) -> Result<Arc<ServerNode>> {
        let node = self.engine.create_server_node(
            store_id,
            port,
            passcode,
            discriminator,
            BasicInformation::bridge(store_id),
        )?;
        match node.start() {
            Ok(()) => Ok(node),
            Err(BridgeError::PortInUse(used)) => {
                let retry_port = used + 1;
                warn!("[Bridge] Port {used} in use, retrying {store_id} on {retry_port}");
                let node = self.engine.create_server_node(
                    store_id,
                    retry_port,
                    passcode,
                    discriminator,
                    BasicInformation::bridge(store_id),
                )?;
                node.start()?;
                Ok(node)
            }
            Err(e) => Err(e),
        }
    }

    /// Attach a device per the placement rules of the current mode.
    fn place_device(self: &Arc<Self>, device: &Arc<Device>) -> Result<()> {
        if device.number() != 0 {
            return Ok(());
        }
        // Children ride on their composed parent's endpoint
        if device.parent_key.is_some() {
            return Ok(());
        }

        let codes = device.device_type_codes();
        match self.mode() {
            Mode::Bridge | Mode::Test | Mode::Controller => match device.mode {
                DeviceMode::Default => {
                    let aggregator = self
                        .aggregator
                        .read()
                        .clone()
                        .ok_or_else(|| BridgeError::NotReady(BRIDGE_STORE_ID.to_string()))?;
                    let node = self
                        .server_node
                        .read()
                        .clone()
                        .ok_or_else(|| BridgeError::NotReady(BRIDGE_STORE_ID.to_string()))?;
                    let number = aggregator.attach(&device.storage_key, &codes)?;
                    device.attached(&node, number);
                }
                DeviceMode::Matter => {
                    let node = self
                        .server_node
                        .read()
                        .clone()
                        .ok_or_else(|| BridgeError::NotReady(BRIDGE_STORE_ID.to_string()))?;
                    let number = node.attach(&device.storage_key, &codes)?;
                    device.attached(&node, number);
                }
                DeviceMode::Server => self.place_on_dedicated_node(device, &codes)?,
            },
            Mode::Childbridge => {
                let plugin = device
                    .plugin()
                    .ok_or_else(|| BridgeError::NotFound(device.storage_key.clone()))?;
                let record = self
                    .plugins
                    .get(&plugin)
                    .ok_or_else(|| BridgeError::NotFound(plugin.clone()))?;
                let node = record
                    .server_node()
                    .ok_or_else(|| BridgeError::NotReady(plugin.clone()))?;
                let number = match record.aggregator() {
                    Some(aggregator) => aggregator.attach(&device.storage_key, &codes)?,
                    None => node.attach(&device.storage_key, &codes)?,
                };
                device.attached(&node, number);
            }
        }
        Ok(())
    }

    /// `Server` mode devices stand up a node of their own.
    fn place_on_dedicated_node(self: &Arc<Self>, device: &Arc<Device>, codes: &[u32]) -> Result<()> {
        let (passcode, discriminator) = {
            let settings = self.settings.read();
            (settings.passcode, settings.discriminator)
        };
        let store_id = device.storage_key.replace(':', "-");
        let node = self.create_and_start_node(&store_id, 0, passcode, discriminator)?;
        self.supervisor.adopt(&node)?;
        let number = node.attach(&device.storage_key, codes)?;
        device.attached(&node, number);
        self.dedicated_nodes.write().push(node);
        Ok(())
    }

    fn detach_device(&self, device: &Arc<Device>) {
        match self.mode() {
            Mode::Childbridge => {
                if let Some(record) = device.plugin().and_then(|p| self.plugins.get(&p)) {
                    if let Some(aggregator) = record.aggregator() {
                        aggregator.detach(&device.storage_key);
                    }
                    if let Some(node) = record.server_node() {
                        node.detach(&device.storage_key);
                    }
                }
            }
            _ => {
                if let Some(aggregator) = self.aggregator.read().as_ref() {
                    aggregator.detach(&device.storage_key);
                }
                if let Some(node) = self.server_node.read().as_ref() {
                    node.detach(&device.storage_key);
                }
            }
        }
    }

    /// Fan registry events out: place late registrations, publish device
    /// refreshes.
    fn spawn_registry_fanout(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut events = self.registry.subscribe();
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => {
                        let Some(bridge) = weak.upgrade() else { break };
                        match event {
                            Ok(RegistryEvent::DeviceAdded(device)) => {
                                if bridge.is_started()
                                    && let Err(e) = bridge.place_device(&device)
                                {
                                    error!(
                                        "[Bridge] Failed to place {}: {e}",
                                        device.storage_key
                                    );
                                }
                                bridge.broadcast(BroadcastEvent::refresh(Changed::Devices));
                            }
                            Ok(RegistryEvent::DeviceRemoved(device)) => {
                                bridge.detach_device(&device);
                                bridge.broadcast(BroadcastEvent::refresh(Changed::Devices));
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!("[Bridge] Registry fan-out lagged by {missed}");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    /// Watch commissioning snapshots: keep plugin paired/connected flags
    /// current and restart nodes that fell offline, with exponential
    /// backoff (base 1 s, cap 60 s, reset on success).
    fn spawn_engine_watchdog(self: &Arc<Self>) {
        const BACKOFF_BASE: std::time::Duration = std::time::Duration::from_secs(1);
        const BACKOFF_CAP: std::time::Duration = std::time::Duration::from_secs(60);

        let weak = Arc::downgrade(self);
        let mut events = self.subscribe();
        let shutdown = self.shutdown.clone();
        let restarting: Arc<Mutex<std::collections::HashSet<String>>> =
            Arc::new(Mutex::new(std::collections::HashSet::new()));

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                let snapshot = match event {
                    Ok(BroadcastEvent::RefreshRequired {
                        matter: Some(snapshot),
                        ..
                    }) => snapshot,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(bridge) = weak.upgrade() else { break };

                if let Some(record) = bridge.plugins.get(&snapshot.id) {
                    record.set_paired(snapshot.commissioned);
                    record.set_connected(
                        snapshot.session_informations.iter().any(|s| s.active),
                    );
                }

                let offline =
                    snapshot.window_state == crate::commissioning::WindowState::Offline;
                if !offline || bridge.destroyed.load(Ordering::SeqCst) {
                    continue;
                }
                if !restarting.lock().insert(snapshot.id.clone()) {
                    continue;
                }

                let store_id = snapshot.id.clone();
                let weak = Arc::downgrade(&bridge);
                let shutdown = bridge.shutdown.clone();
                let restarting = restarting.clone();
                let restart = tokio::spawn(async move {
                    let mut delay = BACKOFF_BASE;
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        let Some(bridge) = weak.upgrade() else { break };
                        if bridge.destroyed.load(Ordering::SeqCst) {
                            break;
                        }
                        let node = bridge
                            .server_nodes()
                            .into_iter()
                            .find(|n| n.store_id() == store_id);
                        let Some(node) = node else { break };
                        match node.start() {
                            Ok(()) => {
                                info!("[Bridge] Restarted server node {store_id}");
                                break;
                            }
                            Err(e) => {
                                warn!(
                                    "[Bridge] Restart of {store_id} failed ({e}), \
                                     next attempt in {:?}",
                                    delay.min(BACKOFF_CAP)
                                );
                                delay = (delay * 2).min(BACKOFF_CAP);
                            }
                        }
                    }
                    restarting.lock().remove(&store_id);
                });
                bridge.tasks.lock().push(restart);
            }
        });
        self.tasks.lock().push(task);
    }

    // --- Control plane surface ------------------------------------------

    pub fn settings_snapshot(&self) -> Value {
        let settings = self.settings.read().clone();
        json!({
            "mode": settings.mode,
            "profile": settings.profile,
            "matterPort": settings.matter_port,
            "discriminator": settings.discriminator,
            "frontendPort": settings.frontend_port,
            "virtualMode": settings.virtual_mode.to_string(),
            "version": env!("CARGO_PKG_VERSION"),
            "restartRequired": false,
            "passwordSet": self.context.get::<String>(KEY_PASSWORD).is_some(),
            "resources": self.monitor.latest(),
            "peaks": self.monitor.peaks(),
        })
    }

    pub fn plugins_snapshot(&self) -> Value {
        let summaries: Vec<_> = self
            .plugins
            .plugins()
            .iter()
            .map(|record| record.summary())
            .collect();
        json!(summaries)
    }

    pub fn devices_snapshot(&self) -> Value {
        let devices: Vec<Value> = self
            .registry
            .all()
            .iter()
            .map(|device| {
                json!({
                    "pluginName": device.plugin(),
                    "name": device.name,
                    "storageKey": device.storage_key,
                    "number": device.number(),
                    "deviceTypes": device.device_types,
                    "mode": device.mode,
                })
            })
            .collect();
        json!(devices)
    }

    pub fn matter_snapshots(&self) -> Vec<MatterSnapshot> {
        self.supervisor.snapshots()
    }

    pub fn password_hash(&self) -> Option<String> {
        self.context.get::<String>(KEY_PASSWORD)
    }

    /// Apply a `/api/config` change. Returns the broadcast the caller emits
    /// after the response, if any.
    pub fn set_config(&self, name: &str, value: &Value) -> Result<Option<BroadcastEvent>> {
        let text = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
        match name {
            "setpassword" => {
                if text.is_empty() {
                    self.context.remove(KEY_PASSWORD)?;
                } else {
                    self.context
                        .set(KEY_PASSWORD, &crate::frontend::session::hash_password(&text))?;
                }
                Ok(Some(BroadcastEvent::refresh(Changed::Settings)))
            }
            "setvirtualmode" => {
                let mode = VirtualMode::from_str(&text).map_err(|_| {
                    BridgeError::UnknownMethod(format!("virtual mode {text}"))
                })?;
                self.settings.write().virtual_mode = mode;
                self.context.set(KEY_VIRTUAL_MODE, &text)?;
                Ok(Some(BroadcastEvent::refresh(Changed::Settings)))
            }
            "setlogger" => {
                let level = serde_json::from_value::<crate::config::LogLevel>(json!(text))?;
                self.settings.write().logger_level = level;
                log::set_max_level(level.to_filter());
                Ok(Some(BroadcastEvent::refresh(Changed::Settings)))
            }
            "setmatterlogger" => {
                let level = serde_json::from_value::<crate::config::LogLevel>(json!(text))?;
                self.settings.write().matter_logger_level = level;
                Ok(Some(BroadcastEvent::refresh(Changed::Settings)))
            }
            "setmatterport" => {
                let port = text.parse::<u16>().map_err(|e| {
                    BridgeError::UnknownMethod(format!("port {text}: {e}"))
                })?;
                self.settings.write().matter_port = port;
                self.context.set("matterPort", &port)?;
                Ok(Some(BroadcastEvent::RestartRequired))
            }
            "setmatterpasscode" => {
                let passcode = text.parse::<u32>().map_err(|e| {
                    BridgeError::UnknownMethod(format!("passcode {text}: {e}"))
                })?;
                self.settings.write().passcode = passcode;
                self.context.set("passcode", &passcode)?;
                Ok(Some(BroadcastEvent::RestartRequired))
            }
            "setmatterdiscriminator" => {
                let discriminator = text.parse::<u16>().map_err(|e| {
                    BridgeError::UnknownMethod(format!("discriminator {text}: {e}"))
                })?;
                self.settings.write().discriminator = discriminator;
                self.context.set("discriminator", &discriminator)?;
                Ok(Some(BroadcastEvent::RestartRequired))
            }
            "setmdnsinterface" => {
                self.settings.write().mdns_interface =
                    (!text.is_empty()).then(|| text.clone());
                self.context.set("mdnsInterface", &text)?;
                Ok(Some(BroadcastEvent::RestartRequired))
            }
            "setipv4address" | "setipv6address" => {
                self.context.set(name.trim_start_matches("set"), &text)?;
                Ok(Some(BroadcastEvent::RestartRequired))
            }
            other => Err(BridgeError::UnknownMethod(format!("config {other}"))),
        }
    }

    /// Persist the network configuration a Shelly board posted.
    pub fn set_shelly_net_config(&self, params: &Value) -> Result<Option<BroadcastEvent>> {
        self.context.set(KEY_SHELLY_NET, params)?;
        Ok(Some(BroadcastEvent::refresh(Changed::Settings)))
    }

    /// Install a package, streaming tool output as progress broadcasts.
    pub async fn install(&self, package: &str) -> Result<()> {
        let tool = PackageTool::default();
        let broadcasts = self.broadcasts.clone();
        let operation = format!("install {package}");
        tool.install(package, move |line| {
            let _ = broadcasts.send(BroadcastEvent::Progress {
                operation: operation.clone(),
                line,
            });
        })
        .await?;
        self.broadcast(BroadcastEvent::snackbar(
            Severity::Info,
            format!("Installed {package}"),
        ));
        Ok(())
    }

    pub async fn uninstall(&self, package: &str) -> Result<()> {
        let tool = PackageTool::default();
        let broadcasts = self.broadcasts.clone();
        let operation = format!("uninstall {package}");
        tool.uninstall(package, move |line| {
            let _ = broadcasts.send(BroadcastEvent::Progress {
                operation: operation.clone(),
                line,
            });
        })
        .await?;
        self.broadcast(BroadcastEvent::snackbar(
            Severity::Info,
            format!("Uninstalled {package}"),
        ));
        Ok(())
    }

    /// Handle an uploaded package: extract, validate, install.
    pub async fn upload_package(&self, filename: &str, payload: &[u8]) -> Result<String> {
        let staging = self.settings.read().home_dir.join("uploads");
        std::fs::create_dir_all(&staging)?;
        let archive = staging.join(filename);
        std::fs::write(&archive, payload)?;

        let (package_dir, manifest) = install::extract_package(&archive, &staging).await?;
        info!(
            "[Bridge] Uploaded package {} {} extracted",
            manifest.name, manifest.version
        );
        self.install(&package_dir.display().to_string()).await?;
        Ok(manifest.name)
    }

    /// Request a process restart through the supervisor.
    pub fn restart(&self) {
        info!("[Bridge] Restart requested");
        self.broadcast(BroadcastEvent::RestartRequired);
    }

    /// Tear the instance down; see the cleanup orchestrator for ordering.
    pub async fn destroy(self: &Arc<Self>) {
        crate::cleanup::destroy(self).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Result as BridgeResult;
    use crate::plugin::{Platform, PlatformContext, PlatformKind};
    use async_trait::async_trait;
    use clap::Parser;
    use serde_json::json;
    use tempfile::TempDir;

    pub(crate) fn test_settings(dir: &TempDir, extra: &[&str]) -> Settings {
        let mut argv = vec![
            "matterbridge".to_string(),
            "--homedir".to_string(),
            dir.path().display().to_string(),
            "--port".to_string(),
            "0".to_string(),
            "--frontend".to_string(),
            "0".to_string(),
        ];
        argv.extend(extra.iter().map(|s| s.to_string()));
        Settings::from_cli(&crate::config::Cli::parse_from(argv))
    }

    struct SensorPlatform {
        ctx: PlatformContext,
        devices: u32,
        composed: bool,
        mode: DeviceMode,
    }

    #[async_trait]
    impl Platform for SensorPlatform {
        async fn on_start(&self, _reason: Option<&str>) -> BridgeResult<()> {
            for i in 0..self.devices {
                let mut device = Device::new(
                    format!("{}:sensor{i}", self.ctx.plugin()),
                    format!("Sensor {i}"),
                )
                .with_device_type(0x0302, 2)
                .with_mode(self.mode)
                .with_attribute(0x0402, "measuredValue", json!(2000));
                if self.composed {
                    device = device.composed();
                }
                self.ctx.register_device(device)?;
            }
            Ok(())
        }

        async fn on_configure(&self) -> BridgeResult<()> {
            Ok(())
        }

        async fn on_shutdown(&self, _reason: Option<&str>) -> BridgeResult<()> {
            Ok(())
        }
    }

    pub(crate) fn sensor_factory(
        devices: u32,
        composed: bool,
        mode: DeviceMode,
    ) -> PlatformFactory {
        Arc::new(move |ctx| {
            Ok(Arc::new(SensorPlatform {
                ctx,
                devices,
                composed,
                mode,
            }) as Arc<dyn Platform>)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_bridge_boot_without_plugins() {
        let dir = TempDir::new().unwrap();
        let bridge = Matterbridge::initialize(test_settings(&dir, &["--bridge"])).unwrap();
        let mut rx = bridge.subscribe();

        bridge.startup().await.unwrap();

        let node = bridge.server_node().unwrap();
        assert_eq!(node.store_id(), BRIDGE_STORE_ID);
        assert!(node.is_online());
        assert!(!node.is_commissioned());

        // Commissioning broadcast with pairing codes arrives promptly
        let snapshot = loop {
            match rx.recv().await.unwrap() {
                BroadcastEvent::RefreshRequired {
                    changed: Changed::Matter,
                    matter: Some(snapshot),
                } => break snapshot,
                _ => continue,
            }
        };
        assert_eq!(snapshot.id, BRIDGE_STORE_ID);
        assert!(snapshot.advertising);
        assert!(snapshot.qr_pairing_code.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bridge_mode_places_devices_under_aggregator() {
        let dir = TempDir::new().unwrap();
        let bridge = Matterbridge::initialize(test_settings(&dir, &["--bridge"])).unwrap();
        bridge.register_platform("mock3", sensor_factory(3, true, DeviceMode::Default));
        bridge.plugins().add("mock3").unwrap();

        bridge.startup().await.unwrap();

        let aggregator = bridge.aggregator().unwrap();
        assert_eq!(aggregator.children().len(), 3);
        for device in bridge.registry().all() {
            assert!(device.number() > 0);
        }
        let record = bridge.plugins().get("mock3").unwrap();
        assert_eq!(record.registered_devices(), 3);
        assert_eq!(record.kind(), PlatformKind::Dynamic);
        assert!(record.is_configured());
    }

    #[tokio::test(start_paused = true)]
    async fn test_matter_mode_bypasses_aggregator() {
        let dir = TempDir::new().unwrap();
        let bridge = Matterbridge::initialize(test_settings(&dir, &["--bridge"])).unwrap();
        bridge.register_platform("direct", sensor_factory(1, false, DeviceMode::Matter));
        bridge.plugins().add("direct").unwrap();

        bridge.startup().await.unwrap();

        assert!(bridge.aggregator().unwrap().children().is_empty());
        let node = bridge.server_node().unwrap();
        assert_eq!(node.attached_endpoints().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_childbridge_accessory_owns_node_without_aggregator() {
        let dir = TempDir::new().unwrap();
        let bridge = Matterbridge::initialize(test_settings(&dir, &["--childbridge"])).unwrap();
        bridge.register_platform(
            "matterbridge-mock4",
            sensor_factory(1, false, DeviceMode::Default),
        );
        bridge.plugins().add("matterbridge-mock4").unwrap();

        bridge.startup().await.unwrap();

        let record = bridge.plugins().get("matterbridge-mock4").unwrap();
        assert_eq!(record.kind(), PlatformKind::Accessory);
        let node = record.server_node().unwrap();
        assert_eq!(node.store_id(), "matterbridge-mock4");
        assert!(record.aggregator().is_none());
        assert_eq!(node.attached_endpoints().len(), 1);
        assert_eq!(record.registered_devices(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_childbridge_dynamic_owns_aggregator() {
        let dir = TempDir::new().unwrap();
        let bridge = Matterbridge::initialize(test_settings(&dir, &["--childbridge"])).unwrap();
        bridge.register_platform("dyn", sensor_factory(3, true, DeviceMode::Default));
        bridge.plugins().add("dyn").unwrap();

        bridge.startup().await.unwrap();

        let record = bridge.plugins().get("dyn").unwrap();
        let aggregator = record.aggregator().unwrap();
        assert_eq!(aggregator.children().len(), 3);
        assert_eq!(record.registered_devices(), 3);

        // Removing everything emits one event per device and leaves the
        // added counter at zero
        let mut events = bridge.registry().subscribe();
        let keys: Vec<String> = bridge
            .registry()
            .by_plugin("dyn")
            .iter()
            .map(|d| d.storage_key.clone())
            .collect();
        for key in keys {
            bridge.plugins().unregister_device("dyn", &key);
        }
        let mut removals = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, RegistryEvent::DeviceRemoved(_)) {
                removals += 1;
            }
        }
        assert_eq!(removals, 3);
        assert_eq!(record.added_devices(), 0);
        assert_eq!(record.registered_devices(), 3);

        tokio::task::yield_now().await;
        assert!(record.aggregator().unwrap().children().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_plugin_failure_is_isolated() {
        let dir = TempDir::new().unwrap();
        let bridge = Matterbridge::initialize(test_settings(&dir, &["--bridge"])).unwrap();
        bridge.register_platform("bad", Arc::new(|_ctx| {
            Err(BridgeError::plugin("bad", "factory exploded"))
        }));
        bridge.register_platform("good", sensor_factory(1, false, DeviceMode::Default));
        bridge.plugins().add("bad").unwrap();
        bridge.plugins().add("good").unwrap();

        bridge.startup().await.unwrap();

        assert!(bridge.plugins().get("bad").unwrap().has_error());
        let good = bridge.plugins().get("good").unwrap();
        assert!(good.is_started());
        assert_eq!(bridge.registry().by_plugin("good").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_registration_is_placed() {
        let dir = TempDir::new().unwrap();
        let bridge = Matterbridge::initialize(test_settings(&dir, &["--bridge"])).unwrap();
        bridge.register_platform("lazy", sensor_factory(0, false, DeviceMode::Default));
        bridge.plugins().add("lazy").unwrap();
        bridge.startup().await.unwrap();

        let device = bridge
            .plugins()
            .register_device(
                "lazy",
                Device::new("lazy:late", "Late").with_device_type(0x0302, 2),
            )
            .unwrap();
        // The registry fan-out task attaches it
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(device.number() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_node_restarts_with_backoff() {
        let dir = TempDir::new().unwrap();
        let bridge = Matterbridge::initialize(test_settings(&dir, &["--bridge"])).unwrap();
        let mut rx = bridge.subscribe();
        bridge.startup().await.unwrap();
        let node = bridge.server_node().unwrap();

        node.fail_transport("interface lost");

        // The offline snapshot goes out, then the watchdog brings the node
        // back and the window reopens
        let mut saw_offline = false;
        loop {
            if let BroadcastEvent::RefreshRequired {
                matter: Some(snapshot),
                ..
            } = rx.recv().await.unwrap()
            {
                if snapshot.window_state == crate::commissioning::WindowState::Offline {
                    saw_offline = true;
                }
                if saw_offline && snapshot.online {
                    break;
                }
            }
        }
        assert!(node.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_config_virtual_mode() {
        let dir = TempDir::new().unwrap();
        let bridge = Matterbridge::initialize(test_settings(&dir, &["--bridge"])).unwrap();
        let event = bridge
            .set_config("setvirtualmode", &json!("light"))
            .unwrap();
        assert!(matches!(
            event,
            Some(BroadcastEvent::RefreshRequired {
                changed: Changed::Settings,
                ..
            })
        ));
        assert_eq!(bridge.settings.read().virtual_mode, VirtualMode::Light);

        assert!(bridge.set_config("setwarpdrive", &json!(9)).is_err());
    }
}
