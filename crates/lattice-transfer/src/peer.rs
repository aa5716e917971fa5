use std::sync::{Arc, Weak};

use lattice_shared::types::NodeId;

use crate::messenger::TransferMessenger;

/// A remote node participating in one transfer.
///
/// Holds the node by ID and the mesh by weak reference; a peer must never
/// keep its network alive.
#[derive(Clone)]
pub struct TransferPeer {
    node: NodeId,
    network_id: String,
    messenger: Weak<dyn TransferMessenger>,
}

impl TransferPeer {
    pub fn new(node: NodeId, messenger: &Arc<dyn TransferMessenger>) -> Self {
        Self {
            node,
            network_id: messenger.network_id(),
            messenger: Arc::downgrade(messenger),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    pub fn messenger(&self) -> Option<Arc<dyn TransferMessenger>> {
        self.messenger.upgrade()
    }
}
