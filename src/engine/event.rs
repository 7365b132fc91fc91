//! Typed lifecycle events emitted by the Matter engine.
//!
//! The engine raises callbacks from its own tasks; they are translated into
//! [`EngineEvent`] values and posted onto a bounded per-node queue so the
//! caller never blocks. The commissioning supervisor owns the consumer loop.

use log::warn;
use tokio::sync::mpsc;

/// Depth of the per-node event queue.
pub const EVENT_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FabricAction {
    Added,
    Removed,
    Updated,
}

/// One lifecycle, fabric or session event on a server node.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The node is listening and advertised.
    Online,
    /// The node went offline (closed or transport failure).
    Offline,
    /// At least one fabric is present (set at boot or after pairing).
    Commissioned,
    /// The last fabric was removed; the node factory-reset.
    Decommissioned,
    /// The fabric table changed.
    FabricsChanged { index: u8, action: FabricAction },
    /// A secure session opened.
    SessionOpened { name: String },
    /// A secure session closed.
    SessionClosed { name: String },
    /// The subscription count of a session changed.
    SessionSubscriptionsChanged { name: String },
}

/// Posting side of a node's event queue.
///
/// `post` never blocks: on overflow the event is dropped with a warning.
/// Consumers rebuild their tables from engine state on every event, so the
/// next event recovers anything a dropped one carried.
#[derive(Clone)]
pub struct EventSender {
    store_id: String,
    tx: mpsc::Sender<EngineEvent>,
}

impl EventSender {
    pub fn new(store_id: impl Into<String>) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        (
            Self {
                store_id: store_id.into(),
                tx,
            },
            rx,
        )
    }

    pub fn post(&self, event: EngineEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("[Engine] {} event queue full, dropping {:?}", self.store_id, e);
        }
    }
}
