//! Matter engine adapter.
//!
//! The protocol transport (mDNS, CASE/PASE, cluster codecs) lives behind
//! this seam. The rest of the bridge programs against server node,
//! aggregator and endpoint primitives with a lifecycle (`is_ready`,
//! `is_online`, `is_commissioned`), a typed fabric/session event stream and
//! pairing-code derivation.

pub mod event;
pub mod node;
pub mod pairing;

pub use event::{EngineEvent, EventSender, FabricAction};
pub use node::{
    AGGREGATOR_DEVICE_TYPE, Aggregator, AttachedEndpoint, BasicInformation, Fabric, MdnsService,
    ROOT_ENDPOINT, ServerNode, Session,
};
pub use pairing::PairingCodes;

use crate::error::Result;
use crate::storage::StorageManager;
use log::info;
use std::path::Path;
use std::sync::Arc;

/// Engine storage service plus node/aggregator factory.
///
/// One sub-context per server node (`Matterbridge` or the plugin name)
/// holds the node's basic information, fabric table and endpoint numbers.
pub struct MatterEngine {
    storage: StorageManager,
}

impl MatterEngine {
    /// Open the engine storage service rooted at the matter storage
    /// directory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let storage = StorageManager::open(root.as_ref())?;
        info!("[Engine] Storage service open at {}", root.as_ref().display());
        Ok(Self { storage })
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    /// Create (but do not start) a server node backed by the context named
    /// after its store id.
    pub fn create_server_node(
        &self,
        store_id: &str,
        port: u16,
        passcode: u32,
        discriminator: u16,
        info: BasicInformation,
    ) -> Result<Arc<ServerNode>> {
        let ctx = self.storage.context(store_id)?;
        let node = ServerNode::create(store_id, port, passcode, discriminator, info, ctx)?;
        info!("[Engine] Created server node {store_id} (port {port})");
        Ok(node)
    }

    pub fn create_aggregator(&self) -> Arc<Aggregator> {
        Arc::new(Aggregator::new())
    }

    /// Close the storage service. Server nodes must be closed first.
    pub fn close(&self) -> Result<()> {
        self.storage.close()?;
        info!("[Engine] Storage service closed");
        Ok(())
    }
}
