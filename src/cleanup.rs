//! Deterministic teardown.
//!
//! Ordering: stop accepting control-plane requests, shut plugins down in
//! reverse start order, flush and close every server node (verifying the
//! endpoint-number invariant), close the engine storage service, close the
//! node-level storage, release mDNS, join the background tasks. A second
//! destroy is a no-op.

use crate::bridge::Matterbridge;
use crate::error::BridgeError;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::timeout;

/// How long one plugin may take to shut down before teardown moves on.
pub const PLUGIN_GRACE: Duration = Duration::from_secs(10);

/// How long background tasks get to drain after cancellation.
const TASK_GRACE: Duration = Duration::from_millis(250);

pub async fn destroy(bridge: &Arc<Matterbridge>) {
    if bridge.destroyed.swap(true, Ordering::SeqCst) {
        debug!("[Cleanup] Destroy already ran");
        return;
    }
    info!("Destroy instance...");

    // 1. No new control-plane requests; background loops wind down.
    bridge.shutdown.cancel();

    // 2. Plugins in reverse start order. A stuck plugin is escalated past,
    //    never waited on indefinitely.
    let records = bridge.plugins.plugins();
    for record in records.iter().rev() {
        if !(record.is_started() || record.is_loaded()) {
            continue;
        }
        let shutdown = bridge
            .plugins
            .shutdown(record, "Matterbridge is shutting down", true, true);
        if timeout(PLUGIN_GRACE, shutdown).await.is_err() {
            warn!(
                "[Cleanup] Plugin {} exceeded the {PLUGIN_GRACE:?} shutdown grace",
                record.name
            );
        }
    }

    // 3. Server nodes: flush endpoint numbers, verify, close. Each close
    //    releases the node's mDNS service.
    for node in bridge.server_nodes() {
        bridge.supervisor.release(node.store_id());
        if let Err(e) = node.flush_endpoint_numbers() {
            error!("[Cleanup] {}: endpoint number flush failed: {e}", node.store_id());
        }
        match node.close() {
            Ok(()) => debug!("[Cleanup] {} closed", node.store_id()),
            Err(e @ BridgeError::Engine(_)) => {
                // Endpoint-number invariant violated; report loudly but
                // keep tearing down.
                error!("[Cleanup] {e}");
            }
            Err(e) => error!("[Cleanup] {}: close failed: {e}", node.store_id()),
        }
    }
    bridge.supervisor.release_all();

    // 4. Storage: engine service first, then the node-level contexts. The
    //    settings context gets a backup copy on the way out.
    if let Err(e) = bridge.engine.close() {
        error!("[Cleanup] Engine storage close failed: {e}");
    }
    bridge.storage.backup("matterbridge");
    if let Err(e) = bridge.storage.close() {
        error!("[Cleanup] Storage close failed: {e}");
    }

    // 5. Monitor and remaining tasks.
    bridge.monitor.stop();
    let tasks: Vec<_> = bridge.tasks.lock().drain(..).collect();
    for mut task in tasks {
        if timeout(TASK_GRACE, &mut task).await.is_err() {
            task.abort();
            let _ = task.await;
        }
    }

    info!("Cleanup completed. Shutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tests::{sensor_factory, test_settings};
    use crate::registry::DeviceMode;
    use tempfile::TempDir;

    #[tokio::test(start_paused = true)]
    async fn test_destroy_closes_every_node() {
        let dir = TempDir::new().unwrap();
        let bridge =
            Matterbridge::initialize(test_settings(&dir, &["--childbridge"])).unwrap();
        for name in ["mock1", "mock2", "mock3", "mock4"] {
            bridge.register_platform(name, sensor_factory(1, false, DeviceMode::Default));
            bridge.plugins().add(name).unwrap();
        }
        bridge.startup().await.unwrap();

        let nodes = bridge.server_nodes();
        assert_eq!(nodes.len(), 4);

        bridge.destroy().await;

        for node in &nodes {
            assert!(!node.is_online());
            assert!(node.mdns().is_closed());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_persists_endpoint_numbers() {
        let dir = TempDir::new().unwrap();
        let bridge = Matterbridge::initialize(test_settings(&dir, &["--bridge"])).unwrap();
        bridge.register_platform("mock", sensor_factory(3, true, DeviceMode::Default));
        bridge.plugins().add("mock").unwrap();
        bridge.startup().await.unwrap();

        let node = bridge.server_node().unwrap();
        let keys: Vec<String> = node
            .attached_endpoints()
            .iter()
            .map(|e| e.key.clone())
            .collect();
        assert_eq!(keys.len(), 3);

        bridge.destroy().await;

        for key in keys {
            assert!(node.persisted_number(&key).is_some_and(|n| n > 0));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let bridge = Matterbridge::initialize(test_settings(&dir, &["--bridge"])).unwrap();
        bridge.startup().await.unwrap();

        bridge.destroy().await;
        bridge.destroy().await;
        assert!(bridge.shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_shuts_plugins_down() {
        let dir = TempDir::new().unwrap();
        let bridge = Matterbridge::initialize(test_settings(&dir, &["--bridge"])).unwrap();
        bridge.register_platform("mock", sensor_factory(2, true, DeviceMode::Default));
        bridge.plugins().add("mock").unwrap();
        bridge.startup().await.unwrap();

        bridge.destroy().await;

        let record = bridge.plugins().get("mock").unwrap();
        assert!(!record.is_started());
        assert!(bridge.registry().by_plugin("mock").is_empty());
    }
}
