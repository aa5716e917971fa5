//! Mock engine and messenger used by the coordinator tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use lattice_net::TcpTransport;
use lattice_shared::error::{RoutingError, TransferError};
use lattice_shared::protocol::{MeshError, RequestFileInfo, SharedFileListing};
use lattice_shared::types::NodeId;

use crate::messenger::TransferMessenger;
use crate::provider::{
    EngineState, PieceExchangeProvider, PieceManifest, PieceSession, SessionSnapshot,
};

pub fn node(seed: &[u8]) -> NodeId {
    NodeId::from_key_material(seed)
}

pub struct MockSession {
    pub state: Mutex<EngineState>,
    pub progress: Mutex<f64>,
    pub open_connections: Mutex<usize>,
    pub peer_progress: Mutex<HashMap<NodeId, f64>>,
    pub stop_calls: Mutex<usize>,
}

impl MockSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EngineState::Stopped),
            progress: Mutex::new(0.0),
            open_connections: Mutex::new(1),
            peer_progress: Mutex::new(HashMap::new()),
            stop_calls: Mutex::new(0),
        })
    }

    pub fn set_progress(&self, progress: f64) {
        *self.progress.lock().unwrap() = progress;
    }
}

impl PieceSession for MockSession {
    fn start(&self) -> Result<(), TransferError> {
        let mut state = self.state.lock().unwrap();
        *state = if *self.progress.lock().unwrap() >= 100.0 {
            EngineState::Seeding
        } else {
            EngineState::Downloading
        };
        Ok(())
    }

    fn stop(&self) {
        *self.state.lock().unwrap() = EngineState::Stopped;
        *self.stop_calls.lock().unwrap() += 1;
    }

    fn pause(&self) -> Result<(), TransferError> {
        *self.state.lock().unwrap() = EngineState::Paused;
        Ok(())
    }

    fn resume(&self) -> Result<(), TransferError> {
        *self.state.lock().unwrap() = EngineState::Downloading;
        Ok(())
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: *self.state.lock().unwrap(),
            progress: *self.progress.lock().unwrap(),
            download_speed: 0,
            upload_speed: 0,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            open_connections: *self.open_connections.lock().unwrap(),
        }
    }

    fn set_speed_limits(&self, _upload: u32, _download: u32) {}

    fn peer_progress(&self, node: &NodeId) -> Option<f64> {
        self.peer_progress.lock().unwrap().get(node).copied()
    }

    fn handle_transport(&self, _transport: TcpTransport) -> Result<(), TransferError> {
        Ok(())
    }
}

pub struct MockProvider {
    pub sessions: Mutex<Vec<Arc<MockSession>>>,
    pub released: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        })
    }

    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        self.sessions.lock().unwrap().last().cloned()
    }
}

impl PieceExchangeProvider for MockProvider {
    fn create_session(
        &self,
        _manifest: &PieceManifest,
    ) -> Result<Arc<dyn PieceSession>, TransferError> {
        let session = MockSession::new();
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }

    fn handle_incoming(&self, _transport: TcpTransport) {}

    fn release(&self, info_hash: &str) {
        self.released.lock().unwrap().push(info_hash.to_string());
    }
}

pub struct MockMessenger {
    pub local: NodeId,
    pub file_requests: Mutex<Vec<(NodeId, RequestFileInfo)>>,
    pub details_sent: Mutex<Vec<(NodeId, SharedFileListing)>>,
    pub errors_sent: Mutex<Vec<(NodeId, MeshError)>>,
    pub dials: Mutex<Vec<(NodeId, String)>>,
    pub dial_succeeds: AtomicBool,
}

impl MockMessenger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            local: node(b"local"),
            file_requests: Mutex::new(Vec::new()),
            details_sent: Mutex::new(Vec::new()),
            errors_sent: Mutex::new(Vec::new()),
            dials: Mutex::new(Vec::new()),
            dial_succeeds: AtomicBool::new(true),
        })
    }
}

impl TransferMessenger for MockMessenger {
    fn network_id(&self) -> String {
        "test-network".to_string()
    }

    fn local_node(&self) -> NodeId {
        self.local
    }

    fn send_file_request(
        &self,
        to: &NodeId,
        request: RequestFileInfo,
    ) -> Result<(), RoutingError> {
        self.file_requests.lock().unwrap().push((*to, request));
        Ok(())
    }

    fn send_file_details(
        &self,
        to: &NodeId,
        details: SharedFileListing,
    ) -> Result<(), RoutingError> {
        self.details_sent.lock().unwrap().push((*to, details));
        Ok(())
    }

    fn send_transfer_error(&self, to: &NodeId, error: MeshError) -> Result<(), RoutingError> {
        self.errors_sent.lock().unwrap().push((*to, error));
        Ok(())
    }

    fn dial_transfer_peer(&self, node: &NodeId, info_hash: &str) -> bool {
        self.dials
            .lock()
            .unwrap()
            .push((*node, info_hash.to_string()));
        self.dial_succeeds.load(Ordering::SeqCst)
    }
}

pub fn upload_manifest(path: &str) -> PieceManifest {
    PieceManifest {
        info_hash: Some("deadbeef".to_string()),
        name: "shared.bin".to_string(),
        full_path: path.to_string(),
        size: 1024,
        piece_length: 256,
        pieces: vec!["p1".to_string(), "p2".to_string()],
        local_path: Some(std::path::PathBuf::from("/tmp/shared.bin")),
    }
}

pub fn download_manifest(path: &str) -> PieceManifest {
    PieceManifest {
        info_hash: None,
        name: "wanted.bin".to_string(),
        full_path: path.to_string(),
        size: 0,
        piece_length: 0,
        pieces: Vec::new(),
        local_path: None,
    }
}

pub fn details_listing(path: &str) -> SharedFileListing {
    SharedFileListing {
        name: "wanted.bin".to_string(),
        full_path: path.to_string(),
        size: 2048,
        info_hash: Some("cafebabe".to_string()),
        piece_length: 256,
        pieces: vec!["p1".to_string(), "p2".to_string()],
    }
}
