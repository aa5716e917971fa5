//! How the coordinator talks back to the mesh.
//!
//! The routing engine implements this trait; the transfer crate only ever
//! sees it as a trait object, which keeps the dependency pointing one way.

use lattice_shared::error::RoutingError;
use lattice_shared::protocol::{MeshError, RequestFileInfo, SharedFileListing};
use lattice_shared::types::NodeId;

pub trait TransferMessenger: Send + Sync {
    /// Identifier of the network this messenger routes on.
    fn network_id(&self) -> String;

    fn local_node(&self) -> NodeId;

    /// Ask a remote node for a file (download side).
    fn send_file_request(&self, to: &NodeId, request: RequestFileInfo)
        -> Result<(), RoutingError>;

    /// Push piece metadata to a downloader (upload side).
    fn send_file_details(&self, to: &NodeId, details: SharedFileListing)
        -> Result<(), RoutingError>;

    fn send_transfer_error(&self, to: &NodeId, error: MeshError) -> Result<(), RoutingError>;

    /// Open a transfer data channel to a peer. Fire-and-forget: connection
    /// failures surface through transport-error events, and the transfer is
    /// canceled when no peer ever becomes reachable.
    fn dial_transfer_peer(&self, node: &NodeId, info_hash: &str) -> bool;
}
