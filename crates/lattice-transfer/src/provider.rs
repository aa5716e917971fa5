//! Contract with the piece-exchange engine.
//!
//! The coordinator never looks inside the engine: it creates a session per
//! transfer, starts and stops it, hands it transport connections, and pulls
//! point-in-time snapshots for status, speed and progress. The engine's
//! swarm logic, choking, and block scheduling are its own business.

use std::path::PathBuf;
use std::sync::Arc;

use lattice_net::TcpTransport;
use lattice_shared::error::TransferError;
use lattice_shared::protocol::SharedFileListing;
use lattice_shared::types::NodeId;

/// Default piece size used when hashing local files (256 KiB).
pub const DEFAULT_PIECE_LENGTH: u32 = 256 * 1024;

/// Everything the engine needs to know about the file being exchanged.
///
/// `local_path` is set when the local side holds the file on disk (the
/// upload side). `pieces` stays empty on the download side until the
/// remote's `FileDetails` arrive.
#[derive(Debug, Clone)]
pub struct PieceManifest {
    pub info_hash: Option<String>,
    pub name: String,
    pub full_path: String,
    pub size: u64,
    pub piece_length: u32,
    pub pieces: Vec<String>,
    pub local_path: Option<PathBuf>,
}

impl PieceManifest {
    /// Build a download-side manifest from a remote file listing.
    pub fn from_listing(listing: &SharedFileListing) -> Self {
        Self {
            info_hash: listing.info_hash.clone(),
            name: listing.name.clone(),
            full_path: listing.full_path.clone(),
            size: listing.size,
            piece_length: listing.piece_length,
            pieces: listing.pieces.clone(),
            local_path: None,
        }
    }

    pub fn has_pieces(&self) -> bool {
        !self.pieces.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Hashing,
    Downloading,
    Seeding,
    Paused,
}

/// Point-in-time engine figures. Never cached by the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct SessionSnapshot {
    pub state: EngineState,
    /// 0.0 ..= 100.0
    pub progress: f64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub open_connections: usize,
}

pub trait PieceSession: Send + Sync {
    fn start(&self) -> Result<(), TransferError>;
    fn stop(&self);
    fn pause(&self) -> Result<(), TransferError>;
    fn resume(&self) -> Result<(), TransferError>;
    fn snapshot(&self) -> SessionSnapshot;
    fn set_speed_limits(&self, upload: u32, download: u32);
    /// Progress of a specific remote peer, if the engine knows it.
    fn peer_progress(&self, node: &NodeId) -> Option<f64>;
    /// Bind an outgoing transfer transport to this session.
    fn handle_transport(&self, transport: TcpTransport) -> Result<(), TransferError>;
}

pub trait PieceExchangeProvider: Send + Sync {
    fn create_session(&self, manifest: &PieceManifest)
        -> Result<Arc<dyn PieceSession>, TransferError>;
    /// Route an incoming transfer transport to whichever session it
    /// belongs to (the engine's own handshake identifies it).
    fn handle_incoming(&self, transport: TcpTransport);
    /// Drop all engine state for a finished or removed transfer.
    fn release(&self, info_hash: &str);
}
