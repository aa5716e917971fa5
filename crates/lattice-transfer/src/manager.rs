//! Keeps track of ongoing file transfers.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use uuid::Uuid;

use lattice_net::TcpTransport;
use lattice_shared::error::TransferError;
use lattice_shared::protocol::{MeshError, SharedFileListing};
use lattice_shared::types::NodeId;

use crate::events::{TransferEvent, TransferEvents};
use crate::hasher::ShareHasher;
use crate::messenger::TransferMessenger;
use crate::peer::TransferPeer;
use crate::provider::{PieceExchangeProvider, PieceManifest};
use crate::transfer::FileTransfer;

pub struct FileTransferManager {
    local_node: NodeId,
    download_dir: Option<PathBuf>,
    transfers: Mutex<Vec<Arc<FileTransfer>>>,
    provider: Arc<dyn PieceExchangeProvider>,
    hasher: Arc<ShareHasher>,
    events: TransferEvents,
}

impl FileTransferManager {
    pub fn new(
        local_node: NodeId,
        download_dir: Option<PathBuf>,
        provider: Arc<dyn PieceExchangeProvider>,
    ) -> Arc<Self> {
        let events = TransferEvents::new();
        Arc::new(Self {
            local_node,
            download_dir,
            transfers: Mutex::new(Vec::new()),
            provider,
            hasher: Arc::new(ShareHasher::new(events.clone())),
            events,
        })
    }

    pub fn events(&self) -> &TransferEvents {
        &self.events
    }

    pub fn hasher(&self) -> &Arc<ShareHasher> {
        &self.hasher
    }

    pub fn transfers(&self) -> Vec<Arc<FileTransfer>> {
        self.transfers.lock().unwrap().clone()
    }

    pub fn find(&self, id: Uuid) -> Option<Arc<FileTransfer>> {
        self.transfers
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id() == id)
            .cloned()
    }

    /// Find a transfer by file identity: the info hash when both sides
    /// know it, otherwise the shared path.
    pub fn find_by_file(
        &self,
        info_hash: Option<&str>,
        full_path: &str,
    ) -> Option<Arc<FileTransfer>> {
        self.transfers
            .lock()
            .unwrap()
            .iter()
            .find(|t| {
                if let (Some(hash), Some(theirs)) = (info_hash, t.info_hash()) {
                    return theirs == hash;
                }
                t.full_path() == full_path
            })
            .cloned()
    }

    /// Start a new transfer, or add a peer to the existing transfer for
    /// the same file.
    pub fn start_transfer(
        &self,
        messenger: &Arc<dyn TransferMessenger>,
        node: NodeId,
        manifest: PieceManifest,
    ) -> Result<Arc<FileTransfer>, TransferError> {
        if node == self.local_node {
            return Err(TransferError::SelfTransfer);
        }

        // Refuse downloads that would clobber an already-downloaded file
        // of the same name.
        if manifest.local_path.is_none() {
            if let Some(dir) = &self.download_dir {
                if dir.join(&manifest.name).exists() {
                    return Err(TransferError::FileExists(manifest.name.clone()));
                }
            }
        }

        let existing = self.find_by_file(manifest.info_hash.as_deref(), &manifest.full_path);
        let transfer = match existing {
            Some(transfer) => transfer,
            None => {
                let transfer = FileTransfer::new(
                    manifest,
                    Arc::clone(&self.provider),
                    Arc::clone(&self.hasher),
                    self.events.clone(),
                );
                self.transfers.lock().unwrap().push(Arc::clone(&transfer));
                info!(transfer = %transfer.id(), file = %transfer.name(), "Transfer added");
                self.events.publish(TransferEvent::TransferAdded {
                    id: transfer.id(),
                    name: transfer.name(),
                });
                transfer
            }
        };

        transfer.add_peer(TransferPeer::new(node, messenger))?;
        transfer.start();

        Ok(transfer)
    }

    /// Cancel a transfer and drop it (and its engine state).
    pub fn remove_transfer(&self, id: Uuid) -> Result<(), TransferError> {
        let transfer = self.find(id).ok_or(TransferError::UnknownTransfer)?;

        transfer.cancel();
        self.transfers.lock().unwrap().retain(|t| t.id() != id);
        if let Some(hash) = transfer.info_hash() {
            self.provider.release(&hash);
        }

        info!(transfer = %id, file = %transfer.name(), "Transfer removed");
        self.events.publish(TransferEvent::TransferRemoved {
            id,
            name: transfer.name(),
        });
        Ok(())
    }

    /// An incoming transport tagged as a transfer channel: the engine's
    /// own handshake identifies which session it belongs to.
    pub fn handle_incoming_transport(&self, transport: TcpTransport) {
        debug!(transport = %transport, "Incoming transfer transport");
        self.provider.handle_incoming(transport);
    }

    /// An outgoing transfer transport finished its handshake: bind it to
    /// the session it was dialed for.
    pub fn handle_outgoing_transport(
        &self,
        info_hash: &str,
        transport: TcpTransport,
    ) -> Result<(), TransferError> {
        let transfer = self
            .find_by_file(Some(info_hash), "")
            .ok_or(TransferError::UnknownTransfer)?;
        match transfer.session_handle() {
            Some(session) => session.handle_transport(transport),
            None => Err(TransferError::NotStarted),
        }
    }

    /// Remote piece metadata arrived for one of our transfers.
    pub fn on_file_details(&self, from: &NodeId, listing: &SharedFileListing) {
        match self.find_by_file(listing.info_hash.as_deref(), &listing.full_path) {
            Some(transfer) => transfer.file_details_received(listing),
            None => {
                debug!(
                    from = %from.short(),
                    file = %listing.full_path,
                    "Ignored file details for unknown transfer"
                );
            }
        }
    }

    /// A peer reported a transfer error: fail every transfer it takes
    /// part in.
    pub fn on_transfer_error(&self, from: &NodeId, error: &MeshError) {
        let involved: Vec<Arc<FileTransfer>> = self
            .transfers
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.peers().iter().any(|p| p.node() == from))
            .cloned()
            .collect();

        if involved.is_empty() {
            warn!(from = %from.short(), "Transfer error from a non-peer");
            return;
        }

        for transfer in involved {
            transfer.error_received(from, error.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::*;
    use crate::transfer::TransferStatus;

    fn manager() -> (Arc<FileTransferManager>, Arc<MockProvider>) {
        let provider = MockProvider::new();
        let manager = FileTransferManager::new(node(b"local"), None, provider.clone());
        (manager, provider)
    }

    #[tokio::test]
    async fn test_start_transfer_joins_existing_by_file() {
        let (manager, _provider) = manager();
        let messenger: Arc<dyn TransferMessenger> = MockMessenger::new();

        let first = manager
            .start_transfer(&messenger, node(b"a"), upload_manifest("/share/x"))
            .unwrap();
        let second = manager
            .start_transfer(&messenger, node(b"b"), upload_manifest("/share/x"))
            .unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(manager.transfers().len(), 1);
        assert_eq!(first.peers().len(), 2);
    }

    #[tokio::test]
    async fn test_self_transfer_rejected() {
        let (manager, _provider) = manager();
        let messenger: Arc<dyn TransferMessenger> = MockMessenger::new();

        let err = manager
            .start_transfer(&messenger, node(b"local"), upload_manifest("/share/x"))
            .unwrap_err();
        assert!(matches!(err, TransferError::SelfTransfer));
        assert!(manager.transfers().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_peer_across_start_calls() {
        let (manager, _provider) = manager();
        let messenger: Arc<dyn TransferMessenger> = MockMessenger::new();

        manager
            .start_transfer(&messenger, node(b"a"), upload_manifest("/share/x"))
            .unwrap();
        let err = manager
            .start_transfer(&messenger, node(b"a"), upload_manifest("/share/x"))
            .unwrap_err();

        assert!(matches!(err, TransferError::DuplicatePeer(_)));
        let transfer = manager.transfers()[0].clone();
        assert_eq!(transfer.peers().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_transfer_cancels_and_releases() {
        let (manager, provider) = manager();
        let messenger: Arc<dyn TransferMessenger> = MockMessenger::new();

        let transfer = manager
            .start_transfer(&messenger, node(b"a"), upload_manifest("/share/x"))
            .unwrap();
        manager.remove_transfer(transfer.id()).unwrap();

        assert!(manager.transfers().is_empty());
        assert_eq!(transfer.status(), TransferStatus::Canceled);
        assert_eq!(
            provider.released.lock().unwrap().as_slice(),
            &["deadbeef".to_string()]
        );
    }

    #[tokio::test]
    async fn test_remove_unknown_transfer_fails() {
        let (manager, _provider) = manager();
        assert!(matches!(
            manager.remove_transfer(uuid::Uuid::new_v4()),
            Err(TransferError::UnknownTransfer)
        ));
    }

    #[tokio::test]
    async fn test_download_refused_when_file_exists() {
        let provider = MockProvider::new();
        let dir = std::env::temp_dir().join(format!("lattice-dl-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("wanted.bin"), b"already here").unwrap();

        let manager = FileTransferManager::new(node(b"local"), Some(dir.clone()), provider);
        let messenger: Arc<dyn TransferMessenger> = MockMessenger::new();

        let err = manager
            .start_transfer(&messenger, node(b"a"), download_manifest("/remote/y"))
            .unwrap_err();
        assert!(matches!(err, TransferError::FileExists(_)));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_file_details_route_to_matching_transfer() {
        let (manager, provider) = manager();
        let messenger: Arc<dyn TransferMessenger> = MockMessenger::new();

        let transfer = manager
            .start_transfer(&messenger, node(b"seed"), download_manifest("/remote/b"))
            .unwrap();
        assert_eq!(transfer.status(), TransferStatus::WaitingForInfo);

        manager.on_file_details(&node(b"seed"), &details_listing("/remote/b"));
        assert!(provider.last_session().is_some());
        assert_eq!(transfer.info_hash().as_deref(), Some("cafebabe"));
    }

    #[tokio::test]
    async fn test_peer_error_fails_involved_transfers() {
        let (manager, _provider) = manager();
        let messenger: Arc<dyn TransferMessenger> = MockMessenger::new();

        let transfer = manager
            .start_transfer(&messenger, node(b"a"), upload_manifest("/share/x"))
            .unwrap();

        manager.on_transfer_error(&node(b"a"), &MeshError::Transfer("boom".to_string()));
        assert_eq!(transfer.status(), TransferStatus::Canceled);
    }
}
