//! A single file transfer and its lifecycle.
//!
//! Status is derived on demand from coordinator flags plus the engine
//! snapshot rather than stored: `Queued` until started, `Hashing` /
//! `WaitingForInfo` before the session exists, then the engine state
//! decides. Direction is likewise derived: whoever holds the complete
//! piece set reports `Upload`, even while laggard peers still fetch.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};
use uuid::Uuid;

use lattice_shared::error::TransferError;
use lattice_shared::protocol::{MeshError, RequestFileInfo, SharedFileListing};
use lattice_shared::types::NodeId;

use crate::events::{TransferEvent, TransferEvents};
use crate::hasher::ShareHasher;
use crate::peer::TransferPeer;
use crate::provider::{EngineState, PieceExchangeProvider, PieceManifest, PieceSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Queued,
    Hashing,
    WaitingForInfo,
    Connecting,
    Transferring,
    NoPeers,
    Paused,
    Completed,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

pub struct FileTransfer {
    id: Uuid,
    manifest: Mutex<PieceManifest>,
    session: Mutex<Option<Arc<dyn PieceSession>>>,
    peers: Mutex<Vec<TransferPeer>>,
    start_called: AtomicBool,
    canceled: AtomicBool,
    status_detail: Mutex<Option<String>>,
    upload_limit: AtomicU32,
    download_limit: AtomicU32,
    provider: Arc<dyn PieceExchangeProvider>,
    hasher: Arc<ShareHasher>,
    events: TransferEvents,
}

impl std::fmt::Debug for FileTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTransfer").field("id", &self.id).finish()
    }
}

impl FileTransfer {
    pub fn new(
        manifest: PieceManifest,
        provider: Arc<dyn PieceExchangeProvider>,
        hasher: Arc<ShareHasher>,
        events: TransferEvents,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            manifest: Mutex::new(manifest),
            session: Mutex::new(None),
            peers: Mutex::new(Vec::new()),
            start_called: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            status_detail: Mutex::new(None),
            upload_limit: AtomicU32::new(0),
            download_limit: AtomicU32::new(0),
            provider,
            hasher,
            events,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> String {
        self.manifest.lock().unwrap().name.clone()
    }

    pub fn full_path(&self) -> String {
        self.manifest.lock().unwrap().full_path.clone()
    }

    pub fn info_hash(&self) -> Option<String> {
        self.manifest.lock().unwrap().info_hash.clone()
    }

    pub fn status_detail(&self) -> Option<String> {
        self.status_detail.lock().unwrap().clone()
    }

    pub fn peers(&self) -> Vec<TransferPeer> {
        self.peers.lock().unwrap().clone()
    }

    fn session(&self) -> Option<Arc<dyn PieceSession>> {
        self.session.lock().unwrap().clone()
    }

    /// The live engine session, for binding transfer transports.
    pub fn session_handle(&self) -> Option<Arc<dyn PieceSession>> {
        self.session()
    }

    /// Upload when we hold the file, or once we hold every piece.
    pub fn direction(&self) -> TransferDirection {
        if self.manifest.lock().unwrap().local_path.is_some() {
            return TransferDirection::Upload;
        }
        match self.session() {
            Some(session) if session.snapshot().progress >= 100.0 => TransferDirection::Upload,
            _ => TransferDirection::Download,
        }
    }

    pub fn status(&self) -> TransferStatus {
        if !self.start_called.load(Ordering::SeqCst) {
            return TransferStatus::Queued;
        }
        if self.canceled.load(Ordering::SeqCst) {
            return TransferStatus::Canceled;
        }

        let session = match self.session() {
            Some(session) => session,
            None => {
                // Session not built yet: uploads are hashing, downloads are
                // waiting for the remote's piece metadata.
                let manifest = self.manifest.lock().unwrap();
                return if manifest.local_path.is_some() && !manifest.has_pieces() {
                    TransferStatus::Hashing
                } else {
                    TransferStatus::WaitingForInfo
                };
            }
        };

        let snapshot = session.snapshot();
        match snapshot.state {
            EngineState::Paused => TransferStatus::Paused,
            EngineState::Hashing => TransferStatus::Hashing,
            EngineState::Stopped => {
                if snapshot.progress >= 100.0 {
                    TransferStatus::Completed
                } else {
                    TransferStatus::Canceled
                }
            }
            EngineState::Downloading | EngineState::Seeding => {
                if self.peers.lock().unwrap().is_empty() {
                    TransferStatus::NoPeers
                } else if snapshot.open_connections == 0 {
                    TransferStatus::Connecting
                } else {
                    TransferStatus::Transferring
                }
            }
        }
    }

    pub fn progress(&self) -> f64 {
        let session = match self.session() {
            Some(session) => session,
            None => return 0.0,
        };

        if self.direction() == TransferDirection::Upload {
            // An uploader's progress is how far its peers have gotten.
            let peers = self.peers.lock().unwrap();
            let known: Vec<f64> = peers
                .iter()
                .filter_map(|p| session.peer_progress(p.node()))
                .collect();
            if known.is_empty() {
                return 0.0;
            }
            return known.iter().sum::<f64>() / known.len() as f64;
        }

        session.snapshot().progress
    }

    pub fn download_speed(&self) -> u64 {
        self.session().map(|s| s.snapshot().download_speed).unwrap_or(0)
    }

    pub fn upload_speed(&self) -> u64 {
        self.session().map(|s| s.snapshot().upload_speed).unwrap_or(0)
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.session().map(|s| s.snapshot().bytes_downloaded).unwrap_or(0)
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.session().map(|s| s.snapshot().bytes_uploaded).unwrap_or(0)
    }

    pub fn set_speed_limits(&self, upload: u32, download: u32) {
        self.upload_limit.store(upload, Ordering::SeqCst);
        self.download_limit.store(download, Ordering::SeqCst);
        if let Some(session) = self.session() {
            session.set_speed_limits(upload, download);
        }
    }

    /// Begin (or restart) the transfer.
    ///
    /// Upload side: hash the file first if pieces are missing. Download
    /// side: ask every peer for the file; piece metadata arrives as a
    /// `FileDetails` message and completes the setup.
    pub fn start(self: &Arc<Self>) {
        self.canceled.store(false, Ordering::SeqCst);
        self.start_called.store(true, Ordering::SeqCst);

        let (is_upload, has_pieces, local_path, piece_length) = {
            let manifest = self.manifest.lock().unwrap();
            (
                manifest.local_path.is_some(),
                manifest.has_pieces(),
                manifest.local_path.clone(),
                manifest.piece_length,
            )
        };

        if is_upload {
            if has_pieces {
                self.details_received();
                return;
            }

            let transfer = Arc::clone(self);
            let path = match local_path {
                Some(path) => path,
                None => return,
            };
            tokio::spawn(async move {
                match transfer.hasher.hash_file(&path, piece_length).await {
                    Ok(hashed) => {
                        {
                            let mut manifest = transfer.manifest.lock().unwrap();
                            manifest.info_hash = Some(hashed.info_hash);
                            manifest.pieces = hashed.pieces;
                            manifest.size = hashed.size;
                        }
                        transfer.details_received();
                    }
                    Err(e) => {
                        error!(transfer = %transfer.id, error = %e, "Hashing failed");
                        transfer.fail(e.to_string());
                    }
                }
            });
            return;
        }

        // Download: tell the other side we want this file. They respond
        // with FileDetails, which calls details_received().
        let request = RequestFileInfo {
            full_path: self.full_path(),
            transfer_id: self.id,
        };
        for peer in self.peers() {
            if let Some(messenger) = peer.messenger() {
                if let Err(e) = messenger.send_file_request(peer.node(), request.clone()) {
                    warn!(
                        transfer = %self.id,
                        peer = %peer.node().short(),
                        error = %e,
                        "Failed to request file from peer"
                    );
                }
            }
        }

        if has_pieces {
            self.details_received();
        }
    }

    /// Piece metadata is available: build and start the engine session.
    pub fn details_received(self: &Arc<Self>) {
        if self.canceled.load(Ordering::SeqCst) {
            return;
        }

        // Restarting an existing session just resumes it.
        if let Some(session) = self.session() {
            if let Err(e) = session.start() {
                error!(transfer = %self.id, error = %e, "Failed to restart session");
            }
            return;
        }

        let manifest = self.manifest.lock().unwrap().clone();
        if !manifest.has_pieces() {
            error!(transfer = %self.id, "details_received with no pieces");
            return;
        }
        if manifest.info_hash.is_none() {
            error!(transfer = %self.id, "details_received with no info hash");
            return;
        }

        let session = match self.provider.create_session(&manifest) {
            Ok(session) => session,
            Err(e) => {
                error!(transfer = %self.id, error = %e, "Engine refused the session");
                self.fail(e.to_string());
                return;
            }
        };

        session.set_speed_limits(
            self.upload_limit.load(Ordering::SeqCst),
            self.download_limit.load(Ordering::SeqCst),
        );

        if let Err(e) = session.start() {
            error!(transfer = %self.id, error = %e, "Failed to start session");
            self.fail(e.to_string());
            return;
        }

        *self.session.lock().unwrap() = Some(session);
        debug!(transfer = %self.id, file = %manifest.name, "Piece exchange started");

        if manifest.local_path.is_some() {
            // Upload: ship the details to everyone already waiting.
            let listing = self.to_listing();
            for peer in self.peers() {
                self.send_details_to(&peer, &listing);
            }
        } else {
            // Download: only the requesting end dials, so the two sides
            // don't end up with redundant connections in each direction.
            self.connect_to_peers();
        }
    }

    fn connect_to_peers(&self) {
        let info_hash = match self.info_hash() {
            Some(hash) => hash,
            None => return,
        };

        let mut dialed_any = false;
        for peer in self.peers() {
            if let Some(messenger) = peer.messenger() {
                if messenger.dial_transfer_peer(peer.node(), &info_hash) {
                    dialed_any = true;
                }
            }
        }

        if !dialed_any {
            warn!(transfer = %self.id, "Unable to connect to any peers");
            self.fail("Unable to connect to any peers".to_string());
        }
    }

    /// Add a participating node. The same node can never join a transfer
    /// twice, regardless of network.
    pub fn add_peer(self: &Arc<Self>, peer: TransferPeer) -> Result<(), TransferError> {
        {
            let mut peers = self.peers.lock().unwrap();
            if peers.iter().any(|p| p.node() == peer.node()) {
                return Err(TransferError::DuplicatePeer(*peer.node()));
            }
            peers.push(peer.clone());
        }

        self.events.publish(TransferEvent::PeerAdded {
            id: self.id,
            node: *peer.node(),
        });

        if self.session().is_some() {
            let manifest = self.manifest.lock().unwrap().clone();
            if manifest.local_path.is_some() && manifest.has_pieces() {
                let listing = self.to_listing();
                self.send_details_to(&peer, &listing);
            }
        }

        Ok(())
    }

    /// Drop a peer. A transfer with no peers left is canceled if it is
    /// incomplete, or stopped cleanly if everything already arrived.
    pub fn remove_peer(self: &Arc<Self>, node: &NodeId) {
        let removed = {
            let mut peers = self.peers.lock().unwrap();
            let before = peers.len();
            peers.retain(|p| p.node() != node);
            before != peers.len()
        };
        if !removed {
            warn!(transfer = %self.id, node = %node.short(), "Unknown transfer peer removed");
            return;
        }

        self.events.publish(TransferEvent::PeerRemoved {
            id: self.id,
            node: *node,
        });

        if self.peers.lock().unwrap().is_empty() {
            let complete = self
                .session()
                .map(|s| s.snapshot().progress >= 100.0)
                .unwrap_or(false);
            if complete {
                if let Some(session) = self.session() {
                    session.stop();
                }
            } else {
                warn!(transfer = %self.id, "No more peers - canceling transfer");
                self.cancel();
            }
        }
    }

    /// A peer reported a transfer-level failure.
    pub fn error_received(self: &Arc<Self>, node: &NodeId, error: MeshError) {
        error!(
            transfer = %self.id,
            node = %node.short(),
            error = %error,
            "Received file transfer error"
        );
        self.fail(error.to_string());
    }

    /// Remote piece metadata arrived (download side).
    pub fn file_details_received(self: &Arc<Self>, listing: &SharedFileListing) {
        {
            let mut manifest = self.manifest.lock().unwrap();
            if manifest.local_path.is_some() {
                // We are the uploader; nothing to learn from remote details.
                return;
            }
            manifest.info_hash = listing.info_hash.clone();
            manifest.piece_length = listing.piece_length;
            manifest.pieces = listing.pieces.clone();
            manifest.size = listing.size;
        }
        self.details_received();
    }

    /// Cooperative cancellation: stops the engine session and flags the
    /// transfer; in-flight snapshots observe it on their next query.
    pub fn cancel(&self) {
        if let Some(session) = self.session() {
            session.stop();
        }
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn pause(&self) -> Result<(), TransferError> {
        match self.session() {
            Some(session) => session.pause(),
            None => Err(TransferError::NotStarted),
        }
    }

    pub fn resume(&self) -> Result<(), TransferError> {
        match self.session() {
            Some(session) => session.resume(),
            None => Err(TransferError::NotStarted),
        }
    }

    /// The listing other nodes need to download this file.
    pub fn to_listing(&self) -> SharedFileListing {
        let manifest = self.manifest.lock().unwrap();
        SharedFileListing {
            name: manifest.name.clone(),
            full_path: manifest.full_path.clone(),
            size: manifest.size,
            info_hash: manifest.info_hash.clone(),
            piece_length: manifest.piece_length,
            pieces: manifest.pieces.clone(),
        }
    }

    fn send_details_to(&self, peer: &TransferPeer, listing: &SharedFileListing) {
        if let Some(messenger) = peer.messenger() {
            if let Err(e) = messenger.send_file_details(peer.node(), listing.clone()) {
                warn!(
                    transfer = %self.id,
                    peer = %peer.node().short(),
                    error = %e,
                    "Failed to send file details"
                );
            }
        }
    }

    fn fail(&self, detail: String) {
        *self.status_detail.lock().unwrap() = Some(detail.clone());
        self.cancel();
        self.events.publish(TransferEvent::TransferError {
            id: self.id,
            message: detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::messenger::TransferMessenger;
    use crate::testkit::*;

    fn build(
        manifest: PieceManifest,
    ) -> (Arc<FileTransfer>, Arc<crate::testkit::MockProvider>) {
        let provider = MockProvider::new();
        let events = TransferEvents::new();
        let hasher = Arc::new(ShareHasher::new(events.clone()));
        let transfer = FileTransfer::new(manifest, provider.clone(), hasher, events);
        (transfer, provider)
    }

    #[tokio::test]
    async fn test_queued_until_started() {
        let (transfer, _provider) = build(upload_manifest("/share/a"));
        assert_eq!(transfer.status(), TransferStatus::Queued);
    }

    #[tokio::test]
    async fn test_upload_with_pieces_starts_and_sends_details() {
        let (transfer, provider) = build(upload_manifest("/share/a"));
        let mock = MockMessenger::new();
        let messenger: Arc<dyn TransferMessenger> = mock.clone();

        transfer
            .add_peer(TransferPeer::new(node(b"peer"), &messenger))
            .unwrap();
        transfer.start();

        assert!(provider.last_session().is_some());
        assert_eq!(transfer.status(), TransferStatus::Transferring);

        let sent = mock.details_sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.info_hash.as_deref(), Some("deadbeef"));
    }

    #[tokio::test]
    async fn test_duplicate_peer_rejected() {
        let (transfer, _provider) = build(upload_manifest("/share/a"));
        let messenger: Arc<dyn TransferMessenger> = MockMessenger::new();

        let peer = node(b"peer");
        transfer
            .add_peer(TransferPeer::new(peer, &messenger))
            .unwrap();
        let err = transfer
            .add_peer(TransferPeer::new(peer, &messenger))
            .unwrap_err();

        assert!(matches!(err, TransferError::DuplicatePeer(n) if n == peer));
        assert_eq!(transfer.peers().len(), 1);
    }

    #[tokio::test]
    async fn test_download_requests_file_and_waits_for_info() {
        let (transfer, provider) = build(download_manifest("/remote/b"));
        let mock = MockMessenger::new();
        let messenger: Arc<dyn TransferMessenger> = mock.clone();

        transfer
            .add_peer(TransferPeer::new(node(b"seed"), &messenger))
            .unwrap();
        transfer.start();

        assert!(provider.last_session().is_none());
        assert_eq!(transfer.status(), TransferStatus::WaitingForInfo);

        let requests = mock.file_requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1.full_path, "/remote/b");
        assert_eq!(requests[0].1.transfer_id, transfer.id());
    }

    #[tokio::test]
    async fn test_file_details_start_download_and_dial() {
        let (transfer, provider) = build(download_manifest("/remote/b"));
        let mock = MockMessenger::new();
        let messenger: Arc<dyn TransferMessenger> = mock.clone();

        transfer
            .add_peer(TransferPeer::new(node(b"seed"), &messenger))
            .unwrap();
        transfer.start();
        transfer.file_details_received(&details_listing("/remote/b"));

        assert!(provider.last_session().is_some());
        assert_eq!(transfer.info_hash().as_deref(), Some("cafebabe"));
        assert_eq!(mock.dials.lock().unwrap().len(), 1);
        assert_eq!(transfer.status(), TransferStatus::Transferring);
    }

    #[tokio::test]
    async fn test_download_with_no_dialable_peer_cancels() {
        let (transfer, _provider) = build(download_manifest("/remote/b"));
        let mock = MockMessenger::new();
        mock.dial_succeeds.store(false, Ordering::SeqCst);
        let messenger: Arc<dyn TransferMessenger> = mock.clone();

        transfer
            .add_peer(TransferPeer::new(node(b"seed"), &messenger))
            .unwrap();
        transfer.start();
        transfer.file_details_received(&details_listing("/remote/b"));

        assert_eq!(transfer.status(), TransferStatus::Canceled);
        assert!(transfer.status_detail().is_some());
    }

    #[tokio::test]
    async fn test_remove_last_peer_incomplete_cancels() {
        let (transfer, _provider) = build(upload_manifest("/share/a"));
        let messenger: Arc<dyn TransferMessenger> = MockMessenger::new();

        let peer = node(b"peer");
        transfer
            .add_peer(TransferPeer::new(peer, &messenger))
            .unwrap();
        transfer.start();

        transfer.remove_peer(&peer);
        assert_eq!(transfer.status(), TransferStatus::Canceled);
    }

    #[tokio::test]
    async fn test_remove_last_peer_complete_stops_cleanly() {
        let (transfer, provider) = build(upload_manifest("/share/a"));
        let messenger: Arc<dyn TransferMessenger> = MockMessenger::new();

        let peer = node(b"peer");
        transfer
            .add_peer(TransferPeer::new(peer, &messenger))
            .unwrap();
        transfer.start();

        let session = provider.last_session().unwrap();
        session.set_progress(100.0);
        transfer.remove_peer(&peer);

        assert!(*session.stop_calls.lock().unwrap() >= 1);
        assert_eq!(transfer.status(), TransferStatus::Completed);
    }

    #[tokio::test]
    async fn test_direction_flips_once_download_completes() {
        let (transfer, provider) = build(download_manifest("/remote/b"));
        let messenger: Arc<dyn TransferMessenger> = MockMessenger::new();

        transfer
            .add_peer(TransferPeer::new(node(b"seed"), &messenger))
            .unwrap();
        transfer.start();
        transfer.file_details_received(&details_listing("/remote/b"));
        assert_eq!(transfer.direction(), TransferDirection::Download);

        provider.last_session().unwrap().set_progress(100.0);
        assert_eq!(transfer.direction(), TransferDirection::Upload);
    }

    #[tokio::test]
    async fn test_pause_resume_require_session() {
        let (transfer, provider) = build(upload_manifest("/share/a"));
        assert!(matches!(transfer.pause(), Err(TransferError::NotStarted)));
        assert!(matches!(transfer.resume(), Err(TransferError::NotStarted)));

        let messenger: Arc<dyn TransferMessenger> = MockMessenger::new();
        transfer
            .add_peer(TransferPeer::new(node(b"peer"), &messenger))
            .unwrap();
        transfer.start();

        transfer.pause().unwrap();
        assert_eq!(transfer.status(), TransferStatus::Paused);
        transfer.resume().unwrap();
        assert_eq!(transfer.status(), TransferStatus::Transferring);
        let _ = provider;
    }

    #[tokio::test]
    async fn test_peer_error_cancels_transfer() {
        let (transfer, _provider) = build(upload_manifest("/share/a"));
        let messenger: Arc<dyn TransferMessenger> = MockMessenger::new();

        let peer = node(b"peer");
        transfer
            .add_peer(TransferPeer::new(peer, &messenger))
            .unwrap();
        transfer.start();

        transfer.error_received(&peer, MeshError::Transfer("disk full".to_string()));
        assert_eq!(transfer.status(), TransferStatus::Canceled);
        assert_eq!(transfer.status_detail().unwrap(), "Transfer error: disk full");
    }
}
