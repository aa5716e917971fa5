//! A mesh participant as one network sees it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use lattice_net::Destination;
use lattice_shared::crypto::{self, SymmetricKey};
use lattice_shared::types::NodeId;

/// Per-node session-key state.
///
/// Each side of a trusted pair generates its own key and ships it sealed
/// to the other. We encrypt what we send with the key *we* generated
/// (`local_key`), and decrypt what they send with the key *they* sent us
/// (`remote_key`). `remote_has_key` flips when they acknowledge our key.
#[derive(Default)]
struct SessionState {
    local_key: Option<SymmetricKey>,
    remote_key: Option<SymmetricKey>,
    remote_has_key: bool,
}

pub struct Node {
    id: NodeId,
    nickname: RwLock<String>,
    verified: AtomicBool,
    remotely_untrusted: AtomicBool,
    avatar_size: AtomicU64,
    file_count: AtomicU64,
    byte_count: AtomicU64,
    destinations: RwLock<Vec<Destination>>,
    session: Mutex<SessionState>,
}

impl Node {
    pub fn new(id: NodeId, nickname: String) -> Self {
        Self {
            id,
            nickname: RwLock::new(nickname),
            verified: AtomicBool::new(false),
            // Assume the remote doesn't trust us until they talk to us.
            remotely_untrusted: AtomicBool::new(true),
            avatar_size: AtomicU64::new(0),
            file_count: AtomicU64::new(0),
            byte_count: AtomicU64::new(0),
            destinations: RwLock::new(Vec::new()),
            session: Mutex::new(SessionState::default()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn nickname(&self) -> String {
        self.nickname.read().unwrap().clone()
    }

    /// Returns the previous nickname.
    pub fn set_nickname(&self, nickname: &str) -> String {
        let mut guard = self.nickname.write().unwrap();
        std::mem::replace(&mut *guard, nickname.to_string())
    }

    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::SeqCst)
    }

    pub fn set_verified(&self, verified: bool) {
        self.verified.store(verified, Ordering::SeqCst);
    }

    pub fn is_remotely_untrusted(&self) -> bool {
        self.remotely_untrusted.load(Ordering::SeqCst)
    }

    pub fn set_remotely_untrusted(&self, untrusted: bool) {
        self.remotely_untrusted.store(untrusted, Ordering::SeqCst);
    }

    pub fn avatar_size(&self) -> u64 {
        self.avatar_size.load(Ordering::SeqCst)
    }

    pub fn set_avatar_size(&self, size: u64) {
        self.avatar_size.store(size, Ordering::SeqCst);
    }

    pub fn file_count(&self) -> u64 {
        self.file_count.load(Ordering::SeqCst)
    }

    pub fn byte_count(&self) -> u64 {
        self.byte_count.load(Ordering::SeqCst)
    }

    pub fn set_share_stats(&self, files: u64, bytes: u64) {
        self.file_count.store(files, Ordering::SeqCst);
        self.byte_count.store(bytes, Ordering::SeqCst);
    }

    pub fn destinations(&self) -> Vec<Destination> {
        self.destinations.read().unwrap().clone()
    }

    pub fn set_destinations(&self, destinations: Vec<Destination>) {
        *self.destinations.write().unwrap() = destinations;
    }

    // -- session-key state --

    pub fn local_has_key(&self) -> bool {
        self.session.lock().unwrap().local_key.is_some()
    }

    pub fn remote_has_key(&self) -> bool {
        self.session.lock().unwrap().remote_has_key
    }

    pub fn finished_key_exchange(&self) -> bool {
        let session = self.session.lock().unwrap();
        session.local_key.is_some() && session.remote_has_key && session.remote_key.is_some()
    }

    /// Generate our session key for this node. Idempotent: a second call
    /// returns the existing key.
    pub fn generate_session_key(&self) -> SymmetricKey {
        let mut session = self.session.lock().unwrap();
        *session
            .local_key
            .get_or_insert_with(crypto::generate_symmetric_key)
    }

    /// Record the key the remote node sent us.
    pub fn store_remote_key(&self, key: SymmetricKey) {
        self.session.lock().unwrap().remote_key = Some(key);
    }

    /// The remote acknowledged receiving our key.
    pub fn confirm_remote_has_key(&self) {
        self.session.lock().unwrap().remote_has_key = true;
    }

    /// Key we encrypt outgoing traffic to this node with.
    pub fn outgoing_key(&self) -> Option<SymmetricKey> {
        self.session.lock().unwrap().local_key
    }

    /// Key incoming traffic from this node decrypts with.
    pub fn incoming_key(&self) -> Option<SymmetricKey> {
        self.session.lock().unwrap().remote_key
    }

    /// Drop all session state, e.g. when trust is revoked.
    pub fn clear_session(&self) {
        *self.session.lock().unwrap() = SessionState::default();
    }
}
