//! Cross-component notifications.
//!
//! Everything the core wants the application to see goes through one
//! broadcast bus. Slow or crashing subscribers can never stall the
//! publisher or each other; a lagging receiver just loses old events.

use tokio::sync::broadcast;

use lattice_shared::protocol::{
    KeyInfo, MemoInfo, MeshError, SearchResultInfo, SharedDirectoryInfo, SharedFileListing,
};
use lattice_shared::types::NodeId;

#[derive(Debug, Clone)]
pub enum NetworkEvent {
    UserOnline {
        network_id: String,
        node: NodeId,
        nickname: String,
    },
    UserOffline {
        network_id: String,
        node: NodeId,
        nickname: String,
    },
    NodeInfoUpdated {
        network_id: String,
        node: NodeId,
        old_nickname: String,
        nickname: String,
    },
    ConnectingTo {
        network_id: String,
        address: String,
    },
    IncomingConnection {
        network_id: String,
        address: String,
    },
    ConnectionReady {
        network_id: String,
        node: NodeId,
    },
    /// An inferred remote edge appeared.
    ConnectionUp {
        network_id: String,
        source: NodeId,
        dest: NodeId,
    },
    /// An inferred remote edge went away.
    ConnectionDown {
        network_id: String,
        source: NodeId,
        dest: NodeId,
    },
    JoinedChat {
        network_id: String,
        room_id: String,
        room_name: String,
        node: NodeId,
    },
    LeftChat {
        network_id: String,
        room_id: String,
        room_name: String,
        node: NodeId,
    },
    ChatMessage {
        network_id: String,
        room_id: String,
        from: NodeId,
        text: String,
    },
    ChatInvite {
        network_id: String,
        from: NodeId,
        room_id: String,
        room_name: String,
        message: String,
        password: Option<String>,
    },
    PrivateMessage {
        network_id: String,
        from: NodeId,
        text: String,
    },
    MemoAdded {
        network_id: String,
        memo: MemoInfo,
    },
    MemoUpdated {
        network_id: String,
        memo: MemoInfo,
    },
    MemoDeleted {
        network_id: String,
        memo: MemoInfo,
    },
    /// A remote node sent us its public key; trusting it is the
    /// application's call.
    ReceivedKey {
        network_id: String,
        from: NodeId,
        key: KeyInfo,
    },
    ReceivedDirListing {
        network_id: String,
        from: NodeId,
        listing: SharedDirectoryInfo,
    },
    ReceivedFileDetails {
        network_id: String,
        from: NodeId,
        details: SharedFileListing,
    },
    ReceivedSearchResult {
        network_id: String,
        from: NodeId,
        result: SearchResultInfo,
    },
    ReceivedAvatar {
        network_id: String,
        from: NodeId,
        data: Vec<u8>,
    },
    ReceivedNonCriticalError {
        network_id: String,
        from: NodeId,
        error: MeshError,
    },
    ReceivedCriticalError {
        network_id: String,
        from: NodeId,
        error: MeshError,
    },
    CleanupFinished {
        network_id: String,
    },
    TransportError {
        message: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NetworkEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(512);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: NetworkEvent) {
        // Nobody listening is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
