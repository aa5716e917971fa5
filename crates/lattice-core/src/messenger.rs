//! The routing engine's side of the transfer-coordinator contract.

use std::sync::{Arc, Weak};

use tracing::{debug, error, warn};

use lattice_shared::constants::CONNECTION_TYPE_TRANSFER;
use lattice_shared::error::{LatticeError, RoutingError};
use lattice_shared::protocol::{MeshError, MessageType, RequestFileInfo, SharedFileListing};
use lattice_shared::types::NodeId;
use lattice_transfer::{FileTransferManager, TransferMessenger};

use crate::network::Network;
use crate::transport_manager::TransportManager;

/// Weak handles all the way down: a transfer peer must never keep a
/// network or its transports alive.
pub struct MeshMessenger {
    network: Weak<Network>,
    transports: Weak<TransportManager>,
    transfers: Weak<FileTransferManager>,
}

impl MeshMessenger {
    pub fn new(
        network: Weak<Network>,
        transports: Weak<TransportManager>,
        transfers: Weak<FileTransferManager>,
    ) -> Self {
        Self {
            network,
            transports,
            transfers,
        }
    }

    fn network(&self) -> Option<Arc<Network>> {
        self.network.upgrade()
    }
}

fn routing_error(e: LatticeError, message_type: MessageType, to: &NodeId) -> RoutingError {
    match e {
        LatticeError::Routing(e) => e,
        _ => RoutingError::DeliveryFailed {
            message_type,
            to: *to,
        },
    }
}

impl TransferMessenger for MeshMessenger {
    fn network_id(&self) -> String {
        self.network()
            .map(|n| n.id().to_string())
            .unwrap_or_default()
    }

    fn local_node(&self) -> NodeId {
        self.network()
            .map(|n| n.local_node_id())
            .unwrap_or(NodeId::BROADCAST)
    }

    fn send_file_request(
        &self,
        to: &NodeId,
        request: RequestFileInfo,
    ) -> Result<(), RoutingError> {
        let network = self
            .network()
            .ok_or(RoutingError::UnknownNode(*to))?;
        network
            .send_file_request(to, request)
            .map_err(|e| routing_error(e, MessageType::RequestFile, to))
    }

    fn send_file_details(
        &self,
        to: &NodeId,
        details: SharedFileListing,
    ) -> Result<(), RoutingError> {
        let network = self
            .network()
            .ok_or(RoutingError::UnknownNode(*to))?;
        network
            .send_file_details(to, details)
            .map_err(|e| routing_error(e, MessageType::FileDetails, to))
    }

    fn send_transfer_error(&self, to: &NodeId, error: MeshError) -> Result<(), RoutingError> {
        let network = self
            .network()
            .ok_or(RoutingError::UnknownNode(*to))?;
        network
            .send_non_critical_error(to, error)
            .map_err(|e| routing_error(e, MessageType::NonCriticalError, to))
    }

    /// Dial a peer's advertised destinations for a transfer data channel.
    /// Returns whether a dial was started; the actual connection runs in
    /// the background and binds to the engine session when it lands.
    fn dial_transfer_peer(&self, node: &NodeId, info_hash: &str) -> bool {
        let (network, transports, transfers) = match (
            self.network(),
            self.transports.upgrade(),
            self.transfers.upgrade(),
        ) {
            (Some(n), Some(t), Some(f)) => (n, t, f),
            _ => return false,
        };

        let destinations: Vec<_> = match network.get_node(node) {
            Some(peer) => peer
                .destinations()
                .into_iter()
                .filter(|d| d.can_connect())
                .collect(),
            None => return false,
        };
        if destinations.is_empty() {
            debug!(node = %node.short(), "Transfer peer has no connectable destinations");
            return false;
        }

        let node = *node;
        let info_hash = info_hash.to_string();
        tokio::spawn(async move {
            for dest in destinations {
                match transports
                    .connect_transport(&network, dest, CONNECTION_TYPE_TRANSFER)
                    .await
                {
                    Ok(transport) => {
                        if let Err(e) = transfers.handle_outgoing_transport(&info_hash, transport)
                        {
                            error!(
                                node = %node.short(),
                                error = %e,
                                "Could not bind transfer transport"
                            );
                        }
                        return;
                    }
                    Err(e) => {
                        warn!(node = %node.short(), dest = %dest, error = %e, "Transfer dial failed");
                    }
                }
            }
            error!(node = %node.short(), "Could not reach transfer peer on any destination");
        });

        true
    }
}
