//! Commissioning supervision.
//!
//! One consumer task per adopted server node processes the engine's event
//! queue serially, maintains the commissioning window and keeps sanitised
//! fabric/session tables. Tables are always rebuilt from the engine's
//! current state, never diffed incrementally. Every change publishes a
//! `refresh_required{changed:"matter"}` broadcast.

use crate::engine::{self, EngineEvent, PairingCodes, ServerNode};
use crate::error::{BridgeError, Result};
use crate::frontend::{BroadcastEvent, Changed};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

/// How long a server node advertises for commissioning.
pub const ADVERTISE_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Commissioning window state of one server node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum WindowState {
    UncommissionedIdle,
    Advertising,
    CommissionedIdle,
    AdvertisingAfterCommissioned,
    Offline,
}

/// Sanitised fabric entry (engine bigints become strings on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FabricRecord {
    pub fabric_index: u8,
    pub fabric_id: String,
    pub node_id: String,
    pub root_node_id: String,
    pub root_vendor_id: u16,
    pub root_vendor_name: String,
    pub label: String,
}

/// Sanitised session entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub name: String,
    pub node_id: String,
    pub peer_node_id: String,
    pub secure: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub subscriptions: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fabric_index: Option<u8>,
}

/// Wire snapshot of one server node's commissioning state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatterSnapshot {
    pub id: String,
    pub online: bool,
    pub commissioned: bool,
    pub advertising: bool,
    pub window_state: WindowState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_pairing_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_pairing_code: Option<String>,
    pub fabric_informations: Vec<FabricRecord>,
    pub session_informations: Vec<SessionRecord>,
}

fn sanitize_fabric(fabric: &engine::Fabric) -> FabricRecord {
    FabricRecord {
        fabric_index: fabric.index,
        fabric_id: fabric.fabric_id.to_string(),
        node_id: fabric.node_id.to_string(),
        root_node_id: fabric.root_node_id.to_string(),
        root_vendor_id: fabric.root_vendor_id,
        root_vendor_name: vendor_name(fabric.root_vendor_id).to_string(),
        label: fabric.label.clone(),
    }
}

fn sanitize_session(session: &engine::Session) -> SessionRecord {
    SessionRecord {
        name: session.name.clone(),
        node_id: session.node_id.to_string(),
        peer_node_id: session.peer_node_id.to_string(),
        secure: session.secure,
        active: session.active,
        created_at: session.created_at,
        last_active: session.last_active,
        subscriptions: session.subscriptions,
        fabric_index: session.fabric_index,
    }
}

/// Controller ecosystems seen in the wild, by root vendor id.
fn vendor_name(vendor_id: u16) -> &'static str {
    match vendor_id {
        4937 => "AppleHome",
        4996 => "AppleKeychain",
        4362 => "SmartThings",
        4939 => "HomeAssistant",
        24582 => "GoogleHome",
        4631 => "Alexa",
        0xFFF1 => "MatterTest",
        _ => "unknown",
    }
}

enum NodeCommand {
    Advertise,
    StopAdvertising,
    Shutdown,
}

struct NodeState {
    window: WindowState,
    expires_at: Option<Instant>,
    codes: Option<PairingCodes>,
    fabrics: Vec<FabricRecord>,
    sessions: Vec<SessionRecord>,
}

struct NodeHandle {
    node: Arc<ServerNode>,
    state: Arc<Mutex<NodeState>>,
    commands: mpsc::Sender<NodeCommand>,
    task: JoinHandle<()>,
}

/// Owns the commissioning windows and fabric/session tables of every
/// adopted server node.
pub struct CommissioningSupervisor {
    nodes: RwLock<HashMap<String, NodeHandle>>,
    broadcasts: broadcast::Sender<BroadcastEvent>,
}

impl CommissioningSupervisor {
    pub fn new(broadcasts: broadcast::Sender<BroadcastEvent>) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            broadcasts,
        }
    }

    /// Adopt a server node: take its event queue and spawn the consumer
    /// task. Call once per node, before or after `start`.
    pub fn adopt(&self, node: &Arc<ServerNode>) -> Result<()> {
        let store_id = node.store_id().to_string();
        let events = node
            .take_events()
            .ok_or_else(|| BridgeError::Engine(format!("{store_id} already adopted")))?;
        let (commands, commands_rx) = mpsc::channel(8);

        let state = Arc::new(Mutex::new(NodeState {
            window: if node.is_commissioned() {
                WindowState::CommissionedIdle
            } else {
                WindowState::UncommissionedIdle
            },
            expires_at: None,
            codes: None,
            fabrics: node.fabrics().iter().map(sanitize_fabric).collect(),
            sessions: node.sessions().iter().map(sanitize_session).collect(),
        }));

        let task = tokio::spawn(run_node(
            node.clone(),
            state.clone(),
            events,
            commands_rx,
            self.broadcasts.clone(),
        ));

        self.nodes.write().insert(
            store_id.clone(),
            NodeHandle {
                node: node.clone(),
                state,
                commands,
                task,
            },
        );
        debug!("[Commission] Adopted server node {store_id}");
        Ok(())
    }

    /// Stop supervising a node (plugin shutdown or bridge teardown). Other
    /// nodes are untouched.
    pub fn release(&self, store_id: &str) {
        if let Some(handle) = self.nodes.write().remove(store_id) {
            // A full command queue means the task is already wedged; abort
            // covers both cases.
            if handle.commands.try_send(NodeCommand::Shutdown).is_err() {
                handle.task.abort();
            }
            debug!("[Commission] Released server node {store_id}");
        }
    }

    pub fn release_all(&self) {
        let store_ids: Vec<String> = self.nodes.read().keys().cloned().collect();
        for store_id in store_ids {
            self.release(&store_id);
        }
    }

    /// Open (or slide) the advertising window of a node.
    pub async fn advertise(&self, store_id: &str) -> Result<()> {
        self.command(store_id, NodeCommand::Advertise).await
    }

    /// Close the advertising window. A no-op when not advertising.
    pub async fn stop_advertising(&self, store_id: &str) -> Result<()> {
        self.command(store_id, NodeCommand::StopAdvertising).await
    }

    async fn command(&self, store_id: &str, command: NodeCommand) -> Result<()> {
        let sender = self
            .nodes
            .read()
            .get(store_id)
            .map(|h| h.commands.clone())
            .ok_or_else(|| BridgeError::NotFound(store_id.to_string()))?;
        sender
            .send(command)
            .await
            .map_err(|_| BridgeError::NotFound(store_id.to_string()))
    }

    /// Remove a fabric through the engine; the resulting event rebuilds the
    /// tables and publishes the refresh.
    pub fn remove_fabric(&self, store_id: &str, index: u8) -> Result<()> {
        let node = self
            .nodes
            .read()
            .get(store_id)
            .map(|h| h.node.clone())
            .ok_or_else(|| BridgeError::NotFound(store_id.to_string()))?;
        node.remove_fabric(index)
    }

    pub fn snapshot(&self, store_id: &str) -> Option<MatterSnapshot> {
        let nodes = self.nodes.read();
        let handle = nodes.get(store_id)?;
        Some(snapshot_of(&handle.node, &handle.state.lock()))
    }

    pub fn snapshots(&self) -> Vec<MatterSnapshot> {
        let nodes = self.nodes.read();
        let mut all: Vec<MatterSnapshot> = nodes
            .values()
            .map(|handle| snapshot_of(&handle.node, &handle.state.lock()))
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn store_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn snapshot_of(node: &Arc<ServerNode>, state: &NodeState) -> MatterSnapshot {
    MatterSnapshot {
        id: node.store_id().to_string(),
        online: node.is_online(),
        commissioned: node.is_commissioned(),
        advertising: matches!(
            state.window,
            WindowState::Advertising | WindowState::AdvertisingAfterCommissioned
        ),
        window_state: state.window,
        qr_pairing_code: state.codes.as_ref().map(|c| c.qr.clone()),
        manual_pairing_code: state.codes.as_ref().map(|c| c.manual.clone()),
        fabric_informations: state.fabrics.clone(),
        session_informations: state.sessions.clone(),
    }
}

async fn run_node(
    node: Arc<ServerNode>,
    state: Arc<Mutex<NodeState>>,
    mut events: mpsc::Receiver<EngineEvent>,
    mut commands: mpsc::Receiver<NodeCommand>,
    broadcasts: broadcast::Sender<BroadcastEvent>,
) {
    loop {
        let deadline = state.lock().expires_at;
        let window_timer = async {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            event = events.recv() => match event {
                Some(event) => handle_event(&node, &state, &broadcasts, event),
                None => break,
            },
            command = commands.recv() => match command {
                Some(NodeCommand::Advertise) => open_window(&node, &state, &broadcasts),
                Some(NodeCommand::StopAdvertising) => {
                    let advertising = {
                        let state = state.lock();
                        matches!(
                            state.window,
                            WindowState::Advertising | WindowState::AdvertisingAfterCommissioned
                        )
                    };
                    // Idempotent: stopping an idle node changes nothing
                    if advertising {
                        close_window(&node, &state, &broadcasts);
                    }
                }
                Some(NodeCommand::Shutdown) | None => break,
            },
            _ = window_timer => {
                info!(
                    "[Commission] {} advertising window expired",
                    node.store_id()
                );
                close_window(&node, &state, &broadcasts);
            }
        }
    }
    debug!("[Commission] {} supervision ended", node.store_id());
}

fn handle_event(
    node: &Arc<ServerNode>,
    state: &Arc<Mutex<NodeState>>,
    broadcasts: &broadcast::Sender<BroadcastEvent>,
    event: EngineEvent,
) {
    debug!("[Commission] {} event {event:?}", node.store_id());
    match event {
        EngineEvent::Online => {
            if node.is_commissioned() {
                let mut guard = state.lock();
                guard.window = WindowState::CommissionedIdle;
                rebuild(node, &mut guard);
                drop(guard);
                publish(node, state, broadcasts);
            } else {
                let expired = {
                    let guard = state.lock();
                    guard.window == WindowState::Advertising
                        && guard.expires_at.is_some_and(|at| at <= Instant::now())
                };
                if expired {
                    // Late fire: the window lapsed while the node was
                    // coming up. No fresh codes.
                    close_window(node, state, broadcasts);
                } else {
                    open_window(node, state, broadcasts);
                }
            }
        }
        EngineEvent::Offline => {
            let mut guard = state.lock();
            guard.window = WindowState::Offline;
            guard.codes = None;
            guard.expires_at = None;
            drop(guard);
            node.stop_advertising();
            publish(node, state, broadcasts);
        }
        EngineEvent::Commissioned => {
            info!("[Commission] {} commissioned", node.store_id());
            node.stop_advertising();
            let mut guard = state.lock();
            guard.window = WindowState::CommissionedIdle;
            guard.codes = None;
            guard.expires_at = None;
            rebuild(node, &mut guard);
            drop(guard);
            publish(node, state, broadcasts);
        }
        EngineEvent::Decommissioned => {
            info!("[Commission] {} decommissioned", node.store_id());
            let mut guard = state.lock();
            guard.window = WindowState::UncommissionedIdle;
            guard.codes = None;
            guard.expires_at = None;
            guard.fabrics.clear();
            guard.sessions.clear();
            drop(guard);
            publish(node, state, broadcasts);
        }
        EngineEvent::FabricsChanged { index, action } => {
            debug!(
                "[Commission] {} fabric {index} {action:?}",
                node.store_id()
            );
            let mut guard = state.lock();
            rebuild(node, &mut guard);
            drop(guard);
            publish(node, state, broadcasts);
        }
        EngineEvent::SessionOpened { .. }
        | EngineEvent::SessionClosed { .. }
        | EngineEvent::SessionSubscriptionsChanged { .. } => {
            let mut guard = state.lock();
            rebuild(node, &mut guard);
            drop(guard);
            publish(node, state, broadcasts);
        }
    }
}

/// Open the advertising window, sliding the timer when one is active.
fn open_window(
    node: &Arc<ServerNode>,
    state: &Arc<Mutex<NodeState>>,
    broadcasts: &broadcast::Sender<BroadcastEvent>,
) {
    let codes = node.pairing_codes();
    node.advertise();
    {
        let mut guard = state.lock();
        if guard.expires_at.is_some() {
            debug!("[Commission] {} sliding advertising window", node.store_id());
        }
        guard.window = if node.is_commissioned() {
            WindowState::AdvertisingAfterCommissioned
        } else {
            WindowState::Advertising
        };
        guard.expires_at = Some(Instant::now() + ADVERTISE_WINDOW);
        guard.codes = Some(codes);
        rebuild(node, &mut guard);
    }
    info!(
        "[Commission] {} advertising for {} s",
        node.store_id(),
        ADVERTISE_WINDOW.as_secs()
    );
    publish(node, state, broadcasts);
}

/// Close the window: clear codes, stop mDNS, settle into the idle state.
fn close_window(
    node: &Arc<ServerNode>,
    state: &Arc<Mutex<NodeState>>,
    broadcasts: &broadcast::Sender<BroadcastEvent>,
) {
    node.stop_advertising();
    {
        let mut guard = state.lock();
        guard.codes = None;
        guard.expires_at = None;
        guard.window = if node.is_commissioned() {
            WindowState::CommissionedIdle
        } else {
            WindowState::UncommissionedIdle
        };
        rebuild(node, &mut guard);
    }
    publish(node, state, broadcasts);
}

/// Rebuild the sanitised tables from the engine's current state.
fn rebuild(node: &Arc<ServerNode>, state: &mut NodeState) {
    state.fabrics = node.fabrics().iter().map(sanitize_fabric).collect();
    state.sessions = node.sessions().iter().map(sanitize_session).collect();
}

fn publish(
    node: &Arc<ServerNode>,
    state: &Arc<Mutex<NodeState>>,
    broadcasts: &broadcast::Sender<BroadcastEvent>,
) {
    let snapshot = snapshot_of(node, &state.lock());
    if broadcasts
        .send(BroadcastEvent::RefreshRequired {
            changed: Changed::Matter,
            matter: Some(snapshot),
        })
        .is_err()
    {
        warn!("[Commission] No control-plane listeners for {}", node.store_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BasicInformation, Fabric, MatterEngine};
    use tempfile::TempDir;
    use tokio::time::{Duration, advance};

    fn test_node(dir: &TempDir, store_id: &str) -> (MatterEngine, Arc<ServerNode>) {
        let engine = MatterEngine::open(dir.path()).unwrap();
        let node = engine
            .create_server_node(store_id, 0, 20242025, 3840, BasicInformation::bridge(store_id))
            .unwrap();
        (engine, node)
    }

    fn fabric(index: u8) -> Fabric {
        Fabric {
            index,
            fabric_id: 0xAB00 + index as u64,
            node_id: 100 + index as u64,
            root_node_id: 1,
            root_vendor_id: 4937,
            label: "Home".into(),
        }
    }

    async fn next_matter_refresh(
        rx: &mut broadcast::Receiver<BroadcastEvent>,
    ) -> MatterSnapshot {
        loop {
            match rx.recv().await.unwrap() {
                BroadcastEvent::RefreshRequired {
                    changed: Changed::Matter,
                    matter: Some(snapshot),
                } => return snapshot,
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_uncommissioned_starts_advertising() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = broadcast::channel(64);
        let (_engine, node) = test_node(&dir, "Matterbridge");
        let supervisor = CommissioningSupervisor::new(tx);
        supervisor.adopt(&node).unwrap();

        node.start().unwrap();

        let snapshot = next_matter_refresh(&mut rx).await;
        assert_eq!(snapshot.id, "Matterbridge");
        assert!(snapshot.online);
        assert!(!snapshot.commissioned);
        assert!(snapshot.advertising);
        assert!(snapshot.qr_pairing_code.is_some());
        assert!(snapshot.manual_pairing_code.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expires_after_fifteen_minutes() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = broadcast::channel(64);
        let (_engine, node) = test_node(&dir, "Matterbridge");
        let supervisor = CommissioningSupervisor::new(tx);
        supervisor.adopt(&node).unwrap();
        node.start().unwrap();
        let first = next_matter_refresh(&mut rx).await;
        assert_eq!(first.window_state, WindowState::Advertising);

        advance(ADVERTISE_WINDOW + Duration::from_secs(1)).await;

        let expired = next_matter_refresh(&mut rx).await;
        assert_eq!(expired.window_state, WindowState::UncommissionedIdle);
        assert!(expired.qr_pairing_code.is_none());
        assert!(expired.manual_pairing_code.is_none());

        // Exactly one transition: nothing further arrives
        advance(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_readvertise_slides_the_window() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = broadcast::channel(64);
        let (_engine, node) = test_node(&dir, "Matterbridge");
        let supervisor = CommissioningSupervisor::new(tx);
        supervisor.adopt(&node).unwrap();
        node.start().unwrap();
        next_matter_refresh(&mut rx).await;

        // Ten minutes in, re-advertise: the timer restarts
        advance(Duration::from_secs(600)).await;
        supervisor.advertise("Matterbridge").await.unwrap();
        let slid = next_matter_refresh(&mut rx).await;
        assert_eq!(slid.window_state, WindowState::Advertising);

        // The original deadline passes without a transition
        advance(Duration::from_secs(330)).await;
        assert!(rx.try_recv().is_err());

        // The slid deadline fires
        advance(ADVERTISE_WINDOW).await;
        let expired = next_matter_refresh(&mut rx).await;
        assert_eq!(expired.window_state, WindowState::UncommissionedIdle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commissioning_closes_the_window() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = broadcast::channel(64);
        let (_engine, node) = test_node(&dir, "Matterbridge");
        let supervisor = CommissioningSupervisor::new(tx);
        supervisor.adopt(&node).unwrap();
        node.start().unwrap();
        next_matter_refresh(&mut rx).await;

        node.commission(fabric(1)).unwrap();

        // FabricsChanged rebuild, then the Commissioned settle
        let mut snapshot = next_matter_refresh(&mut rx).await;
        while snapshot.window_state != WindowState::CommissionedIdle {
            snapshot = next_matter_refresh(&mut rx).await;
        }
        assert!(snapshot.commissioned);
        assert_eq!(snapshot.fabric_informations.len(), 1);
        assert_eq!(snapshot.fabric_informations[0].root_vendor_name, "AppleHome");
        assert_eq!(snapshot.fabric_informations[0].fabric_id, "43777");
        assert!(snapshot.qr_pairing_code.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fabric_removal_rebuilds_tables() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = broadcast::channel(64);
        let (_engine, node) = test_node(&dir, "Matterbridge");
        node.commission(fabric(1)).unwrap();
        node.commission(fabric(2)).unwrap();

        let supervisor = CommissioningSupervisor::new(tx);
        supervisor.adopt(&node).unwrap();
        node.start().unwrap();
        // Two commissions queued before adoption (3 events), then the boot
        // pair: drain all five refreshes before acting.
        for _ in 0..5 {
            next_matter_refresh(&mut rx).await;
        }

        supervisor.remove_fabric("Matterbridge", 1).unwrap();
        let snapshot = next_matter_refresh(&mut rx).await;
        assert_eq!(snapshot.fabric_informations.len(), 1);
        assert!(
            !snapshot
                .fabric_informations
                .iter()
                .any(|f| f.fabric_index == 1)
        );
        // A single broadcast per removal
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_events_refresh() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = broadcast::channel(64);
        let (_engine, node) = test_node(&dir, "Matterbridge");
        node.commission(fabric(1)).unwrap();
        let supervisor = CommissioningSupervisor::new(tx);
        supervisor.adopt(&node).unwrap();
        node.start().unwrap();
        // Pre-adoption commission (2 events) plus the boot pair
        for _ in 0..4 {
            next_matter_refresh(&mut rx).await;
        }

        node.open_session("secure/64351/1", 101, 9, Some(1));
        let snapshot = next_matter_refresh(&mut rx).await;
        assert_eq!(snapshot.session_informations.len(), 1);
        assert_eq!(snapshot.session_informations[0].node_id, "101");

        node.set_subscriptions("secure/64351/1", 3);
        let snapshot = next_matter_refresh(&mut rx).await;
        assert_eq!(snapshot.session_informations[0].subscriptions, 3);

        node.close_session("secure/64351/1");
        let snapshot = next_matter_refresh(&mut rx).await;
        assert!(snapshot.session_informations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_advertising_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = broadcast::channel(64);
        let (_engine, node) = test_node(&dir, "Matterbridge");
        let supervisor = CommissioningSupervisor::new(tx);
        supervisor.adopt(&node).unwrap();
        node.start().unwrap();
        next_matter_refresh(&mut rx).await;

        supervisor.stop_advertising("Matterbridge").await.unwrap();
        let stopped = next_matter_refresh(&mut rx).await;
        assert_eq!(stopped.window_state, WindowState::UncommissionedIdle);

        // Second stop: no state change, no broadcast
        supervisor.stop_advertising("Matterbridge").await.unwrap();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_is_isolated_per_node() {
        let dir1 = TempDir::new().unwrap();
        let dir2 = TempDir::new().unwrap();
        let (tx, mut rx) = broadcast::channel(64);
        let (_e1, node1) = test_node(&dir1, "matterbridge-mock1");
        let (_e2, node2) = test_node(&dir2, "matterbridge-mock2");
        let supervisor = CommissioningSupervisor::new(tx);
        supervisor.adopt(&node1).unwrap();
        supervisor.adopt(&node2).unwrap();
        node1.start().unwrap();
        node2.start().unwrap();
        next_matter_refresh(&mut rx).await;
        next_matter_refresh(&mut rx).await;

        supervisor.release("matterbridge-mock1");
        assert!(supervisor.snapshot("matterbridge-mock1").is_none());

        // The second node's window still expires on schedule
        advance(ADVERTISE_WINDOW + Duration::from_secs(1)).await;
        let expired = next_matter_refresh(&mut rx).await;
        assert_eq!(expired.id, "matterbridge-mock2");
        assert_eq!(expired.window_state, WindowState::UncommissionedIdle);
    }
}
