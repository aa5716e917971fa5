use tokio::sync::broadcast;
use uuid::Uuid;

use lattice_shared::types::NodeId;

#[derive(Debug, Clone)]
pub enum TransferEvent {
    TransferAdded { id: Uuid, name: String },
    TransferRemoved { id: Uuid, name: String },
    PeerAdded { id: Uuid, node: NodeId },
    PeerRemoved { id: Uuid, node: NodeId },
    TransferError { id: Uuid, message: String },
    HashingStarted { path: String },
    HashingFinished { path: String },
}

/// Broadcast channel for transfer notifications. Subscribers that lag or
/// drop their receiver never affect the publisher.
#[derive(Clone)]
pub struct TransferEvents {
    tx: broadcast::Sender<TransferEvent>,
}

impl TransferEvents {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: TransferEvent) {
        // A send error just means nobody is listening right now.
        let _ = self.tx.send(event);
    }
}

impl Default for TransferEvents {
    fn default() -> Self {
        Self::new()
    }
}
