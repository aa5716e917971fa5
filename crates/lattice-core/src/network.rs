//! Per-network state and the routing engine.
//!
//! One `Network` instance exists per joined mesh. It owns the node map,
//! trusted-node registry, chat rooms, memos, the connection collection and
//! the message de-duplication sets, and it drives the per-message dispatch
//! state machine. Collections take their own locks so UI reads and
//! connection-handler writes don't serialize on one global lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use lattice_shared::crypto;
use lattice_shared::error::{CryptoError, HandshakeError, LatticeError, RoutingError};
use lattice_shared::identity::Identity;
use lattice_shared::protocol::{
    ChatAction, ChatInviteInfo, ChatMessageContent, ConnectionEdge, ConnectionInfo, Content,
    KeyInfo, MemoInfo, Message, MeshError, MessageType, NetworkState, NodeInfo, RequestFileInfo,
    SearchRequestInfo, SharedFileListing,
};
use lattice_shared::types::{sha512_hex, MessageId, NodeId};
use lattice_transfer::{FileTransfer, FileTransferManager, PieceManifest, TransferMessenger};

use crate::builder::MessageBuilder;
use crate::chat::ChatRoom;
use crate::connection::{ConnectionState, LocalNodeConnection, NodeLink, RemoteNodeConnection};
use crate::events::{EventBus, NetworkEvent};
use crate::interfaces::{NetworkInfo, Settings, ShareIndex};
use crate::node::Node;
use crate::processor;
use crate::trust::TrustedNodeInfo;

/// Continuation invoked when the matching Ack arrives.
pub type AckHandler = Box<dyn FnOnce(DateTime<Utc>) + Send>;

pub struct Network {
    name: String,
    id: String,
    local: Arc<Node>,
    identity: Arc<Identity>,
    builder: MessageBuilder,
    nodes: RwLock<HashMap<NodeId, Arc<Node>>>,
    trusted: RwLock<HashMap<NodeId, TrustedNodeInfo>>,
    chat_rooms: RwLock<HashMap<String, Arc<ChatRoom>>>,
    memos: Mutex<HashMap<Uuid, MemoInfo>>,
    connections: Mutex<Vec<NodeLink>>,
    routed: Mutex<HashSet<MessageId>>,
    processed: Mutex<HashSet<MessageId>>,
    ack_handlers: Mutex<HashMap<MessageId, AckHandler>>,
    local_avatar: RwLock<Option<Vec<u8>>>,
    events: EventBus,
    settings: Arc<dyn Settings>,
    share_index: Arc<dyn ShareIndex>,
    transfers: OnceLock<Weak<FileTransferManager>>,
    transfer_messenger: OnceLock<Arc<dyn TransferMessenger>>,
}

impl Network {
    pub fn new(
        name: &str,
        identity: Arc<Identity>,
        settings: Arc<dyn Settings>,
        share_index: Arc<dyn ShareIndex>,
        events: EventBus,
    ) -> Arc<Self> {
        let local = Arc::new(Node::new(identity.node_id(), settings.nickname()));
        local.set_verified(true);
        local.set_remotely_untrusted(false);

        let network = Arc::new(Self {
            name: name.to_string(),
            id: sha512_hex(name),
            local: Arc::clone(&local),
            builder: MessageBuilder::new(identity.node_id(), Arc::clone(&identity)),
            identity,
            nodes: RwLock::new(HashMap::new()),
            trusted: RwLock::new(HashMap::new()),
            chat_rooms: RwLock::new(HashMap::new()),
            memos: Mutex::new(HashMap::new()),
            connections: Mutex::new(Vec::new()),
            routed: Mutex::new(HashSet::new()),
            processed: Mutex::new(HashSet::new()),
            ack_handlers: Mutex::new(HashMap::new()),
            local_avatar: RwLock::new(None),
            events,
            settings,
            share_index,
            transfers: OnceLock::new(),
            transfer_messenger: OnceLock::new(),
        });

        // The local node is always present in the node map.
        network
            .nodes
            .write()
            .unwrap()
            .insert(local.id(), local);

        network
    }

    /// Rebuild a network from its persisted snapshot.
    pub fn from_network_info(
        info: &NetworkInfo,
        identity: Arc<Identity>,
        settings: Arc<dyn Settings>,
        share_index: Arc<dyn ShareIndex>,
        events: EventBus,
    ) -> Arc<Self> {
        let network = Self::new(&info.name, identity, settings, share_index, events);

        for trusted in &info.trusted_nodes {
            if let Err(e) = network.add_trusted_node(trusted.clone()) {
                warn!(network = %network.name, error = %e, "Skipping persisted trusted node");
            }
        }

        for memo in &info.memos {
            let mut memo = memo.clone();
            // Persisted memos are ours again on rejoin.
            memo.author = network.local.id();
            network.memos.lock().unwrap().insert(memo.id, memo);
        }

        network
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    /// SHA-512 of the network name, 128 hex chars.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_node(&self) -> &Arc<Node> {
        &self.local
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local.id()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn settings(&self) -> &Arc<dyn Settings> {
        &self.settings
    }

    pub(crate) fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub(crate) fn share_index(&self) -> &Arc<dyn ShareIndex> {
        &self.share_index
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().unwrap().values().cloned().collect()
    }

    pub fn get_node(&self, id: &NodeId) -> Option<Arc<Node>> {
        self.nodes.read().unwrap().get(id).cloned()
    }

    pub fn trusted_nodes(&self) -> Vec<TrustedNodeInfo> {
        self.trusted.read().unwrap().values().cloned().collect()
    }

    pub fn get_trusted(&self, id: &NodeId) -> Option<TrustedNodeInfo> {
        self.trusted.read().unwrap().get(id).cloned()
    }

    pub fn is_trusted(&self, id: &NodeId) -> bool {
        self.trusted.read().unwrap().contains_key(id)
    }

    pub fn chat_rooms(&self) -> Vec<Arc<ChatRoom>> {
        self.chat_rooms.read().unwrap().values().cloned().collect()
    }

    pub fn get_chat_room(&self, id: &str) -> Option<Arc<ChatRoom>> {
        self.chat_rooms.read().unwrap().get(id).cloned()
    }

    pub fn memos(&self) -> Vec<MemoInfo> {
        self.memos.lock().unwrap().values().cloned().collect()
    }

    pub fn connections(&self) -> Vec<NodeLink> {
        self.connections.lock().unwrap().clone()
    }

    pub fn local_connections(&self) -> Vec<Arc<LocalNodeConnection>> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter_map(|l| match l {
                NodeLink::Local(c) => Some(Arc::clone(c)),
                NodeLink::Remote(_) => None,
            })
            .collect()
    }

    pub fn ready_local_connections(&self) -> Vec<Arc<LocalNodeConnection>> {
        self.local_connections()
            .into_iter()
            .filter(|c| c.is_ready())
            .collect()
    }

    pub fn count_total_shared_files(&self) -> u64 {
        self.nodes().iter().map(|n| n.file_count()).sum()
    }

    pub fn count_total_shared_bytes(&self) -> u64 {
        self.nodes().iter().map(|n| n.byte_count()).sum()
    }

    pub fn set_local_avatar(&self, data: Vec<u8>) {
        self.local.set_avatar_size(data.len() as u64);
        *self.local_avatar.write().unwrap() = Some(data);
    }

    pub fn local_avatar(&self) -> Option<Vec<u8>> {
        self.local_avatar.read().unwrap().clone()
    }

    // -----------------------------------------------------------------------
    // Trust
    // -----------------------------------------------------------------------

    /// Import a public key, making its owner a trusted node, and sync the
    /// change through settings.
    pub fn add_public_key(
        self: &Arc<Self>,
        key: KeyInfo,
    ) -> Result<(), LatticeError> {
        let info = TrustedNodeInfo::from_key_info(&key);
        self.add_trusted_node(info)?;
        self.settings.sync_network_info(self.to_network_info());
        Ok(())
    }

    pub fn add_trusted_node(self: &Arc<Self>, info: TrustedNodeInfo) -> Result<(), LatticeError> {
        let node_id = info.node_id();
        if node_id == self.local.id() {
            return Err(LatticeError::OwnKey);
        }

        self.trusted.write().unwrap().insert(node_id, info);

        if let Some(node) = self.get_node(&node_id) {
            node.set_verified(true);
            if !node.finished_key_exchange() {
                self.begin_key_exchange(&node);
            }
        }
        Ok(())
    }

    /// Replace the trusted-node set (settings sync). Nodes that lost
    /// trust get their sessions cleared and their connections dropped.
    pub fn update_trusted_nodes(self: &Arc<Self>, new_nodes: Vec<TrustedNodeInfo>) {
        let incoming: HashMap<NodeId, TrustedNodeInfo> =
            new_nodes.into_iter().map(|t| (t.node_id(), t)).collect();

        let removed: Vec<NodeId> = {
            let trusted = self.trusted.read().unwrap();
            trusted
                .keys()
                .filter(|id| !incoming.contains_key(id))
                .copied()
                .collect()
        };

        for id in &removed {
            self.trusted.write().unwrap().remove(id);
            if let Some(node) = self.get_node(id) {
                node.clear_session();
                node.set_verified(false);
            }
        }

        for conn in self.local_connections() {
            if let Some(remote) = conn.remote_node_id() {
                if removed.contains(&remote) {
                    info!(network = %self.name, node = %remote.short(), "Dropping connection to no-longer-trusted node");
                    conn.disconnect();
                    self.handle_connection_closed(&conn);
                }
            }
        }

        for (id, info) in incoming {
            if !self.is_trusted(&id) {
                let _ = self.add_trusted_node(info);
            }
        }
    }

    pub fn to_network_info(&self) -> NetworkInfo {
        NetworkInfo {
            name: self.name.clone(),
            trusted_nodes: self.trusted_nodes(),
            memos: self
                .memos()
                .into_iter()
                .filter(|m| m.author == self.local.id())
                .collect(),
        }
    }

    // -----------------------------------------------------------------------
    // Nodes and connections
    // -----------------------------------------------------------------------

    /// Get the node for `id`, creating an unverified placeholder if this
    /// is the first time we hear of it.
    fn provision_node(self: &Arc<Self>, id: NodeId, trusted: Option<&TrustedNodeInfo>) -> Arc<Node> {
        let (node, created) = {
            let mut nodes = self.nodes.write().unwrap();
            match nodes.get(&id) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let nickname = match trusted {
                        // A verified signature means this node really exists.
                        Some(t) => t.identifier.clone(),
                        // Unverifiable nodes are still added so relayed
                        // traffic like chat messages works; `verified`
                        // stays false so the UI can ignore them.
                        None => format!("[{}]", id.short()),
                    };
                    let node = Arc::new(Node::new(id, nickname));
                    if trusted.is_some() {
                        node.set_verified(true);
                    }
                    nodes.insert(id, Arc::clone(&node));
                    (node, true)
                }
            }
        };

        if created {
            info!(network = %self.name, node = %id.short(), nickname = %node.nickname(), "User online");
            self.events.publish(NetworkEvent::UserOnline {
                network_id: self.id.clone(),
                node: id,
                nickname: node.nickname(),
            });
            if trusted.is_some() {
                self.begin_key_exchange(&node);
            }
        }

        node
    }

    /// Register a transport-backed connection. At most one local
    /// connection may exist per remote node.
    pub fn add_local_connection(
        &self,
        connection: &Arc<LocalNodeConnection>,
    ) -> Result<(), HandshakeError> {
        if let Some(remote) = connection.remote_node_id() {
            self.check_not_connected(&remote, connection)?;
        }
        self.connections
            .lock()
            .unwrap()
            .push(NodeLink::Local(Arc::clone(connection)));

        let address = connection.remote_addr().to_string();
        if connection.incoming() {
            info!(network = %self.name, address = %address, "New incoming connection");
            self.events.publish(NetworkEvent::IncomingConnection {
                network_id: self.id.clone(),
                address,
            });
        } else {
            info!(network = %self.name, address = %address, "New outgoing connection");
            self.events.publish(NetworkEvent::ConnectingTo {
                network_id: self.id.clone(),
                address,
            });
        }
        Ok(())
    }

    fn check_not_connected(
        &self,
        remote: &NodeId,
        this_connection: &Arc<LocalNodeConnection>,
    ) -> Result<(), HandshakeError> {
        let duplicate = self.local_connections().iter().any(|c| {
            c.id() != this_connection.id()
                && c.state() != ConnectionState::Disconnected
                && c.remote_node_id() == Some(*remote)
        });
        if duplicate {
            return Err(HandshakeError::AlreadyConnected(*remote));
        }
        Ok(())
    }

    /// Bind a connection to its authenticated remote node, enforcing the
    /// one-connection-per-node invariant.
    pub fn bind_connection_remote(
        &self,
        connection: &Arc<LocalNodeConnection>,
        remote: NodeId,
    ) -> Result<(), HandshakeError> {
        self.check_not_connected(&remote, connection)?;
        connection.set_remote_node(remote);
        Ok(())
    }

    /// Record an inferred edge between two remote nodes.
    pub fn add_remote_connection(&self, edge: RemoteNodeConnection) {
        if self.find_connection(&edge.source, &edge.dest).is_some() {
            return;
        }
        self.connections
            .lock()
            .unwrap()
            .push(NodeLink::Remote(edge));

        info!(
            network = %self.name,
            source = %edge.source.short(),
            dest = %edge.dest.short(),
            "Added connection between remote nodes"
        );
        self.events.publish(NetworkEvent::ConnectionUp {
            network_id: self.id.clone(),
            source: edge.source,
            dest: edge.dest,
        });
    }

    pub fn find_connection(&self, first: &NodeId, second: &NodeId) -> Option<NodeLink> {
        let local = self.local.id();
        self.connections
            .lock()
            .unwrap()
            .iter()
            .find(|link| match link.endpoints(&local) {
                Some((a, b)) => (a == *first && b == *second) || (a == *second && b == *first),
                None => false,
            })
            .cloned()
    }

    fn remove_remote_connection(&self, source: &NodeId, dest: &NodeId) -> bool {
        let mut removed = false;
        self.connections.lock().unwrap().retain(|link| match link {
            NodeLink::Remote(rc) => {
                let matches = (rc.source == *source && rc.dest == *dest)
                    || (rc.source == *dest && rc.dest == *source);
                if matches {
                    removed = true;
                }
                !matches
            }
            NodeLink::Local(_) => true,
        });

        if removed {
            info!(
                network = %self.name,
                source = %source.short(),
                dest = %dest.short(),
                "Removed connection between remote nodes"
            );
            self.events.publish(NetworkEvent::ConnectionDown {
                network_id: self.id.clone(),
                source: *source,
                dest: *dest,
            });
        }
        removed
    }

    /// A local connection went away: unregister it, retract the edge on
    /// the mesh, and collect now-unreachable state. Idempotent.
    pub fn handle_connection_closed(self: &Arc<Self>, connection: &Arc<LocalNodeConnection>) {
        connection.disconnect();

        let was_present = {
            let mut connections = self.connections.lock().unwrap();
            let before = connections.len();
            connections.retain(|link| match link {
                NodeLink::Local(c) => c.id() != connection.id(),
                NodeLink::Remote(_) => true,
            });
            before != connections.len()
        };
        if !was_present {
            return;
        }

        if let Some(remote) = connection.remote_node_id() {
            let edge = ConnectionEdge {
                source_id: self.local.id(),
                dest_id: remote,
            };
            match self.make_message(NodeId::BROADCAST, Content::ConnectionDown(edge)) {
                Ok(message) => {
                    if let Err(e) = self.send_broadcast(message, None) {
                        debug!(network = %self.name, error = %e, "Nobody left to tell about the lost connection");
                    }
                }
                Err(e) => error!(network = %self.name, error = %e, "Failed to build ConnectionDown"),
            }
        }

        self.cleanup();
    }

    /// Disconnect every local connection (network shutdown/removal).
    pub fn disconnect_all(self: &Arc<Self>) {
        for conn in self.local_connections() {
            conn.disconnect();
            self.handle_connection_closed(&conn);
        }
    }

    // -----------------------------------------------------------------------
    // Message construction
    // -----------------------------------------------------------------------

    /// Generate a message ID no message on this network has used.
    pub fn create_message_id(&self) -> MessageId {
        loop {
            let id = MessageId::new();
            if !self.routed.lock().unwrap().contains(&id)
                && !self.processed.lock().unwrap().contains(&id)
            {
                return id;
            }
        }
    }

    /// Build an envelope for `content`, sealing it with the destination's
    /// session key when the type demands one.
    pub fn make_message(&self, to: NodeId, content: Content) -> Result<Message, LatticeError> {
        let ty = content.message_type();
        let key = if ty.requires_session() {
            let node = self
                .get_node(&to)
                .ok_or(RoutingError::UnknownNode(to))?;
            Some(node.outgoing_key().ok_or(RoutingError::KeyNotAvailable {
                node: to,
                message_type: ty,
            })?)
        } else {
            None
        };
        self.builder
            .build(self.create_message_id(), to, &content, key.as_ref())
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    /// Deliver a message to its destination: directly when a ready
    /// connection exists, by flooding otherwise. Exactly-once per message
    /// ID; duplicate calls are no-ops.
    pub fn send_routed_message(&self, message: Message) -> Result<(), RoutingError> {
        assert!(
            message.to != self.local.id(),
            "routed message addressed to the local node"
        );
        assert!(
            !message.to.is_broadcast(),
            "routed message addressed to the broadcast sentinel"
        );

        let node = self
            .get_node(&message.to)
            .ok_or(RoutingError::UnknownNode(message.to))?;

        if message.ty.requires_session() && !node.finished_key_exchange() {
            return Err(RoutingError::KeyNotAvailable {
                node: message.to,
                message_type: message.ty,
            });
        }

        // One atomic reservation covers both the direct path and the
        // broadcast fallback, so a concurrent duplicate can't slip
        // through between them.
        if !self.routed.lock().unwrap().insert(message.id) {
            return Ok(());
        }

        if message.ty.is_local_only() {
            // Local-only types go over a direct transport regardless of
            // its handshake state.
            for conn in self.local_connections() {
                if conn.remote_node_id() == Some(message.to)
                    && conn.state() != ConnectionState::Disconnected
                {
                    return conn.send_message(message);
                }
            }
            return Err(RoutingError::NoConnection(message.to));
        }

        for conn in self.ready_local_connections() {
            if conn.remote_node_id() == Some(message.to) {
                return conn.send_message(message);
            }
        }

        // No direct route: flood it and let the mesh re-route.
        self.flood(message, None)
    }

    /// Flood a message to every ready connection, minus the one it came
    /// from. Already-seen message IDs are dropped silently.
    pub fn send_broadcast(
        &self,
        message: Message,
        exclude: Option<NodeId>,
    ) -> Result<(), RoutingError> {
        if !self.routed.lock().unwrap().insert(message.id) {
            return Ok(());
        }
        self.flood(message, exclude)
    }

    fn flood(&self, message: Message, exclude: Option<NodeId>) -> Result<(), RoutingError> {
        let mut count = 0;
        for conn in self.ready_local_connections() {
            if let Some(excluded) = exclude {
                if conn.remote_node_id() == Some(excluded) {
                    continue;
                }
            }
            if conn.send_message(message.clone()).is_ok() {
                count += 1;
            }
        }

        if count == 0 && !message.to.is_broadcast() {
            return Err(RoutingError::DeliveryFailed {
                message_type: message.ty,
                to: message.to,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------------

    /// Process one inbound message. Errors never escape: anything
    /// unexpected is logged with its type and sender and the connection
    /// loop moves on.
    pub fn process_message(
        self: &Arc<Self>,
        connection: &Arc<LocalNodeConnection>,
        message: Message,
    ) {
        let ty = message.ty;
        let from = message.from;
        if let Err(e) = self.process_message_inner(connection, message) {
            error!(
                network = %self.name,
                message_type = ?ty,
                from = %from.short(),
                error = %e,
                "Error processing message"
            );
        }
    }

    fn process_message_inner(
        self: &Arc<Self>,
        connection: &Arc<LocalNodeConnection>,
        message: Message,
    ) -> Result<(), LatticeError> {
        // Dead connections deliver nothing.
        if connection.state() == ConnectionState::Disconnected || !self.has_connection(connection)
        {
            warn!(network = %self.name, "Ignored message from disconnected connection");
            return Ok(());
        }

        // Idempotent under redelivery.
        if !self.processed.lock().unwrap().insert(message.id) {
            return Ok(());
        }

        // Relay anything not addressed to us; pure relays stop here.
        if message.to.is_broadcast() || message.to != self.local.id() {
            let relay = message.clone();
            if let Err(e) = self.send_broadcast(relay, connection.remote_node_id()) {
                debug!(network = %self.name, error = %e, "Relay went nowhere");
            }
            if !message.to.is_broadcast() {
                return Ok(());
            }
        }

        // Our own messages come back through the flood; that's normal.
        // Directly addressed to us by ourselves is not.
        if message.from == self.local.id() {
            if message.to.is_broadcast() {
                return Ok(());
            }
            error!(network = %self.name, "Peer replayed one of our own messages at us");
            connection.disconnect();
            self.handle_connection_closed(connection);
            return Ok(());
        }

        let trusted = self.get_trusted(&message.from);

        // A trusted sender must prove it: bad or missing signatures drop
        // the message.
        if let Some(t) = &trusted {
            let valid = message
                .signature
                .as_deref()
                .map(|sig| t.verify(&message.body, sig).is_ok())
                .unwrap_or(false);
            if !valid {
                warn!(
                    network = %self.name,
                    from = %message.from.short(),
                    message_type = ?message.ty,
                    "Dropped message with invalid signature"
                );
                return Ok(());
            }
        }

        let message_from = self.provision_node(message.from, trusted.as_ref());

        // Trust gate: untrusted senders only get the insecure types.
        if trusted.is_none() && !message.ty.is_insecure() {
            let _ = self.send_non_critical_error(&message.from, MeshError::NotTrusted);
            return Ok(());
        }

        // Locality gate: local-only types must come from the directly
        // connected peer on this very connection.
        if message.ty.is_local_only() {
            let allowed = match connection.remote_node_id() {
                Some(remote) => remote == message.from,
                // An unbound connection may only be authenticating.
                None => matches!(message.ty, MessageType::Auth | MessageType::AuthReply),
            };
            if !allowed {
                let error = MeshError::LocalOnly(message.ty);
                if let Ok(reply) =
                    self.make_message(message.from, Content::CriticalError(error))
                {
                    let _ = connection.send_message(reply);
                }
                connection.disconnect();
                self.handle_connection_closed(connection);
                return Ok(());
            }
        }

        // If they addressed us directly, they evidently trust us.
        if !message.to.is_broadcast() {
            message_from.set_remotely_untrusted(false);
        }

        // Secure types decrypt with the key the sender gave us.
        let body = if message.ty.requires_session() {
            let key = message_from
                .incoming_key()
                .ok_or(LatticeError::Crypto(CryptoError::DecryptionFailed))?;
            crypto::decrypt(&key, &message.body)?
        } else {
            message.body.clone()
        };
        let content = Content::decode(message.ty, &body)?;

        // A critical error from our direct peer tears the connection down.
        if let Content::CriticalError(err) = &content {
            error!(
                network = %self.name,
                from = %message.from.short(),
                error = %err,
                "Received critical error"
            );
            self.events.publish(NetworkEvent::ReceivedCriticalError {
                network_id: self.id.clone(),
                from: message.from,
                error: err.clone(),
            });
            connection.disconnect();
            self.handle_connection_closed(connection);
            return Ok(());
        }

        processor::dispatch(self, connection, &message_from, content);

        if trusted.is_some() && message.ty.requires_ack() {
            let ack = self.make_message(message.from, Content::Ack(message.id))?;
            let _ = self.send_routed_message(ack);
        }

        Ok(())
    }

    fn has_connection(&self, connection: &Arc<LocalNodeConnection>) -> bool {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .any(|link| matches!(link, NodeLink::Local(c) if c.id() == connection.id()))
    }

    // -----------------------------------------------------------------------
    // Session keys
    // -----------------------------------------------------------------------

    /// Generate and deliver our session key to a trusted node. The
    /// matching Ack flips `remote_has_key`. Safe to call repeatedly: the
    /// key is generated once and re-sent until the peer acknowledges it.
    pub(crate) fn begin_key_exchange(self: &Arc<Self>, node: &Arc<Node>) {
        if node.remote_has_key() {
            return;
        }
        let trusted = match self.get_trusted(&node.id()) {
            Some(t) => t,
            None => return,
        };

        let key = node.generate_session_key();
        let sealed = match crypto::seal(&trusted.public.exchange_key, &key) {
            Ok(sealed) => sealed,
            Err(e) => {
                error!(network = %self.name, node = %node.id().short(), error = %e, "Failed to seal session key");
                return;
            }
        };

        let message = match self.make_message(node.id(), Content::NewSessionKey(sealed)) {
            Ok(message) => message,
            Err(e) => {
                error!(network = %self.name, error = %e, "Failed to build NewSessionKey");
                return;
            }
        };

        let weak = Arc::downgrade(self);
        let node_id = node.id();
        let message_id = message.id;
        self.register_ack_handler(
            message_id,
            Box::new(move |_received_at| {
                if let Some(network) = weak.upgrade() {
                    network.session_key_acknowledged(&node_id);
                }
            }),
        );

        debug!(network = %self.name, node = %node.id().short(), "Sending new session key");
        if let Err(e) = self.send_routed_message(message) {
            // No route yet; a later trigger (connection ready) re-sends.
            self.take_ack_handler(&message_id);
            debug!(network = %self.name, node = %node_id.short(), error = %e, "Session key not deliverable yet");
        }
    }

    fn session_key_acknowledged(self: &Arc<Self>, node_id: &NodeId) {
        let node = match self.get_node(node_id) {
            Some(node) => node,
            None => return,
        };
        if node.remote_has_key() {
            return;
        }
        node.confirm_remote_has_key();
        debug!(network = %self.name, node = %node_id.short(), "Peer received our session key");

        if node.finished_key_exchange() {
            info!(
                network = %self.name,
                node = %node.nickname(),
                "Secure communication channel established"
            );
            let _ = self.send_info_to_trusted_node(&node.id());
        }
    }

    pub(crate) fn register_ack_handler(&self, id: MessageId, handler: AckHandler) {
        self.ack_handlers.lock().unwrap().insert(id, handler);
    }

    pub(crate) fn take_ack_handler(&self, id: &MessageId) -> Option<AckHandler> {
        self.ack_handlers.lock().unwrap().remove(id)
    }

    // -----------------------------------------------------------------------
    // User operations
    // -----------------------------------------------------------------------

    pub fn send_private_message(
        &self,
        to: &NodeId,
        text: &str,
    ) -> Result<MessageId, LatticeError> {
        let message = self.make_message(*to, Content::PrivateMessage(text.to_string()))?;
        let id = message.id;
        self.send_routed_message(message)?;
        Ok(id)
    }

    /// Flood a search request across the network.
    pub fn file_search(&self, query: &str) -> Result<Uuid, LatticeError> {
        let id = Uuid::new_v4();
        let message = self.make_message(
            NodeId::BROADCAST,
            Content::SearchRequest(SearchRequestInfo {
                id,
                query: query.to_string(),
                page: 0,
            }),
        )?;
        self.send_broadcast(message, None)?;
        Ok(id)
    }

    pub fn request_public_key(&self, node: &NodeId) -> Result<(), LatticeError> {
        info!(network = %self.name, node = %node.short(), "Requesting public key");
        let message = self.make_message(*node, Content::RequestKey)?;
        self.send_routed_message(message)?;
        Ok(())
    }

    pub fn send_my_key(&self, to: &NodeId) -> Result<(), LatticeError> {
        let message = self.make_message(
            *to,
            Content::MyKey(KeyInfo {
                public: self.identity.public(),
                identifier: self.local.nickname(),
            }),
        )?;
        self.send_routed_message(message)?;
        Ok(())
    }

    pub fn send_pong(&self, to: &NodeId, timestamp: u64) -> Result<(), LatticeError> {
        let message = self.make_message(*to, Content::Pong(timestamp))?;
        self.send_routed_message(message)?;
        Ok(())
    }

    pub(crate) fn send_non_critical_error(
        &self,
        to: &NodeId,
        error: MeshError,
    ) -> Result<(), LatticeError> {
        let message = self.make_message(*to, Content::NonCriticalError(error))?;
        self.send_routed_message(message)?;
        Ok(())
    }

    /// Push our profile to one trusted node with a finished key exchange.
    pub fn send_info_to_trusted_node(&self, to: &NodeId) -> Result<(), LatticeError> {
        let info = self.local_node_info();
        let message = self.make_message(*to, Content::MyInfo(info))?;
        self.send_routed_message(message)?;
        Ok(())
    }

    pub fn send_info_to_trusted_nodes(&self) {
        for node in self.nodes() {
            if node.id() != self.local.id() && node.finished_key_exchange() {
                if let Err(e) = self.send_info_to_trusted_node(&node.id()) {
                    warn!(network = %self.name, node = %node.id().short(), error = %e, "Failed to send node info");
                }
            }
        }
    }

    pub(crate) fn local_node_info(&self) -> NodeInfo {
        NodeInfo {
            nickname: self.local.nickname(),
            destinations: self
                .local
                .destinations()
                .iter()
                .map(|d| d.to_info())
                .collect(),
            avatar_size: self.local.avatar_size(),
            file_count: self.share_index.file_count(),
            byte_count: self.share_index.byte_count(),
        }
    }

    /// Change our nickname and tell the mesh.
    pub fn set_nickname(&self, nickname: &str) -> Result<(), LatticeError> {
        self.local.set_nickname(nickname);
        let message = self.make_message(
            NodeId::BROADCAST,
            Content::Hello(lattice_shared::protocol::HelloInfo {
                nickname: nickname.to_string(),
            }),
        )?;
        let _ = self.send_broadcast(message, None);
        Ok(())
    }

    pub fn request_avatar(&self, node: &NodeId) -> Result<(), LatticeError> {
        let message = self.make_message(*node, Content::RequestAvatar)?;
        self.send_routed_message(message)?;
        Ok(())
    }

    pub fn send_avatar(&self, to: &NodeId) -> Result<(), LatticeError> {
        let data = self.local_avatar().ok_or(LatticeError::NoAvatar)?;
        let message = self.make_message(*to, Content::Avatar(data))?;
        self.send_routed_message(message)?;
        Ok(())
    }

    pub fn request_directory_listing(&self, node: &NodeId, path: &str) -> Result<(), LatticeError> {
        let message = self.make_message(*node, Content::RequestDirListing(path.to_string()))?;
        self.send_routed_message(message)?;
        Ok(())
    }

    pub fn request_file_details(&self, node: &NodeId, path: &str) -> Result<(), LatticeError> {
        let message = self.make_message(*node, Content::RequestFileDetails(path.to_string()))?;
        self.send_routed_message(message)?;
        Ok(())
    }

    pub(crate) fn send_file_details(
        &self,
        to: &NodeId,
        details: SharedFileListing,
    ) -> Result<(), LatticeError> {
        let message = self.make_message(*to, Content::FileDetails(details))?;
        self.send_routed_message(message)?;
        Ok(())
    }

    pub(crate) fn send_file_request(
        &self,
        to: &NodeId,
        request: RequestFileInfo,
    ) -> Result<(), LatticeError> {
        let message = self.make_message(*to, Content::RequestFile(request))?;
        self.send_routed_message(message)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Chat
    // -----------------------------------------------------------------------

    pub fn join_or_create_chat(
        self: &Arc<Self>,
        name: &str,
        password: Option<&str>,
    ) -> Result<Arc<ChatRoom>, LatticeError> {
        let room_id = ChatRoom::derive_id(name, password);
        let room = {
            let mut rooms = self.chat_rooms.write().unwrap();
            rooms
                .entry(room_id.clone())
                .or_insert_with(|| Arc::new(ChatRoom::new(room_id.clone(), name.to_string())))
                .clone()
        };

        if !room.test_password(password) {
            return Err(LatticeError::Chat(
                lattice_shared::error::ChatError::IncorrectPassword,
            ));
        }
        room.set_password(password.map(|p| p.to_string()));

        if room.contains(&self.local.id()) {
            return Err(LatticeError::Chat(
                lattice_shared::error::ChatError::AlreadyInRoom(name.to_string()),
            ));
        }

        room.add_member(self.local.id());
        let message = self.make_message(
            NodeId::BROADCAST,
            Content::JoinChat(ChatAction {
                room_id: room.id().to_string(),
                room_name: room.name().to_string(),
            }),
        )?;
        let _ = self.send_broadcast(message, None);

        self.raise_joined_chat(&room, self.local.id());
        Ok(room)
    }

    pub fn leave_chat(self: &Arc<Self>, room_id: &str) -> Result<(), LatticeError> {
        let room = self.get_chat_room(room_id).ok_or(LatticeError::Chat(
            lattice_shared::error::ChatError::NotInRoom(room_id.to_string()),
        ))?;
        if !room.contains(&self.local.id()) {
            return Err(LatticeError::Chat(
                lattice_shared::error::ChatError::NotInRoom(room.name().to_string()),
            ));
        }

        let message = self.make_message(
            NodeId::BROADCAST,
            Content::LeaveChat(ChatAction {
                room_id: room.id().to_string(),
                room_name: room.name().to_string(),
            }),
        )?;
        let _ = self.send_broadcast(message, None);

        room.remove_member(&self.local.id());
        self.raise_left_chat(&room, self.local.id());

        if room.member_count() == 0 {
            self.chat_rooms.write().unwrap().remove(room.id());
        }
        Ok(())
    }

    pub fn send_chat_message(&self, room_id: &str, text: &str) -> Result<(), LatticeError> {
        let room = self.get_chat_room(room_id).ok_or(LatticeError::Chat(
            lattice_shared::error::ChatError::NotInRoom(room_id.to_string()),
        ))?;
        if !room.contains(&self.local.id()) {
            return Err(LatticeError::Chat(
                lattice_shared::error::ChatError::NotInRoom(room.name().to_string()),
            ));
        }

        let content = if room.has_password() {
            ChatMessageContent {
                room_id: room.id().to_string(),
                text: room.encrypt_message(text)?,
                encrypted: true,
            }
        } else {
            ChatMessageContent {
                room_id: room.id().to_string(),
                text: text.as_bytes().to_vec(),
                encrypted: false,
            }
        };

        let message = self.make_message(NodeId::BROADCAST, Content::ChatroomMessage(content))?;
        let _ = self.send_broadcast(message, None);
        Ok(())
    }

    pub fn send_chat_invitation(
        &self,
        node: &NodeId,
        room_id: &str,
        text: &str,
        include_password: bool,
    ) -> Result<(), LatticeError> {
        let room = self.get_chat_room(room_id).ok_or(LatticeError::Chat(
            lattice_shared::error::ChatError::NotInRoom(room_id.to_string()),
        ))?;

        let message = self.make_message(
            *node,
            Content::ChatInvite(ChatInviteInfo {
                room_id: room.id().to_string(),
                room_name: room.name().to_string(),
                message: text.to_string(),
                password: if include_password { room.password() } else { None },
            }),
        )?;
        self.send_routed_message(message)?;
        Ok(())
    }

    pub(crate) fn get_or_create_chat_room(&self, room_id: &str, name: &str) -> Arc<ChatRoom> {
        let mut rooms = self.chat_rooms.write().unwrap();
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(ChatRoom::new(room_id.to_string(), name.to_string())))
            .clone()
    }

    pub(crate) fn drop_chat_room_if_empty(&self, room_id: &str) {
        let mut rooms = self.chat_rooms.write().unwrap();
        let empty = rooms
            .get(room_id)
            .map(|r| r.member_count() == 0)
            .unwrap_or(false);
        if empty {
            rooms.remove(room_id);
        }
    }

    pub(crate) fn raise_joined_chat(&self, room: &Arc<ChatRoom>, node: NodeId) {
        let nickname = self
            .get_node(&node)
            .map(|n| n.nickname())
            .unwrap_or_else(|| node.short());
        info!(network = %self.name, node = %nickname, room = %room.name(), "Joined chat room");
        self.events.publish(NetworkEvent::JoinedChat {
            network_id: self.id.clone(),
            room_id: room.id().to_string(),
            room_name: room.name().to_string(),
            node,
        });
    }

    pub(crate) fn raise_left_chat(&self, room: &Arc<ChatRoom>, node: NodeId) {
        let nickname = self
            .get_node(&node)
            .map(|n| n.nickname())
            .unwrap_or_else(|| node.short());
        info!(network = %self.name, node = %nickname, room = %room.name(), "Left chat room");
        self.events.publish(NetworkEvent::LeftChat {
            network_id: self.id.clone(),
            room_id: room.id().to_string(),
            room_name: room.name().to_string(),
            node,
        });
    }

    // -----------------------------------------------------------------------
    // Memos
    // -----------------------------------------------------------------------

    pub fn post_memo(&self, subject: &str, text: &str) -> Result<MemoInfo, LatticeError> {
        let memo = MemoInfo {
            id: Uuid::new_v4(),
            author: self.local.id(),
            subject: subject.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
        };

        self.add_or_update_memo(memo.clone());

        let message = self.make_message(NodeId::BROADCAST, Content::AddMemo(memo.clone()))?;
        let _ = self.send_broadcast(message, None);

        self.settings.sync_network_info_and_save(self.to_network_info());
        Ok(memo)
    }

    pub fn delete_memo(&self, id: Uuid) -> Result<(), LatticeError> {
        let memo = {
            let memos = self.memos.lock().unwrap();
            memos.get(&id).cloned()
        };
        let memo = memo.ok_or(LatticeError::UnknownMemo)?;
        if memo.author != self.local.id() {
            return Err(LatticeError::NotMemoAuthor);
        }

        self.remove_memo(&memo);
        let message = self.make_message(NodeId::BROADCAST, Content::DeleteMemo(id))?;
        let _ = self.send_broadcast(message, None);

        self.settings.sync_network_info_and_save(self.to_network_info());
        Ok(())
    }

    pub(crate) fn add_or_update_memo(&self, memo: MemoInfo) {
        let updated = {
            let mut memos = self.memos.lock().unwrap();
            memos.insert(memo.id, memo.clone()).is_some()
        };
        if updated {
            info!(network = %self.name, subject = %memo.subject, "Memo updated");
            self.events.publish(NetworkEvent::MemoUpdated {
                network_id: self.id.clone(),
                memo,
            });
        } else {
            info!(network = %self.name, subject = %memo.subject, "Memo added");
            self.events.publish(NetworkEvent::MemoAdded {
                network_id: self.id.clone(),
                memo,
            });
        }
    }

    pub(crate) fn remove_memo(&self, memo: &MemoInfo) {
        let removed = self.memos.lock().unwrap().remove(&memo.id).is_some();
        if removed {
            info!(network = %self.name, subject = %memo.subject, "Memo deleted");
            self.events.publish(NetworkEvent::MemoDeleted {
                network_id: self.id.clone(),
                memo: memo.clone(),
            });
        }
    }

    pub(crate) fn get_memo(&self, id: &Uuid) -> Option<MemoInfo> {
        self.memos.lock().unwrap().get(id).cloned()
    }

    // -----------------------------------------------------------------------
    // Network state gossip
    // -----------------------------------------------------------------------

    /// Snapshot of what we know, exchanged when a connection readies.
    pub fn network_state(&self) -> NetworkState {
        let local = self.local.id();
        let known_connections = self
            .connections()
            .iter()
            .filter(|l| l.is_active())
            .filter_map(|l| l.endpoints(&local))
            .map(|(a, b)| ConnectionInfo {
                source_id: a,
                source_nickname: self
                    .get_node(&a)
                    .map(|n| n.nickname())
                    .unwrap_or_default(),
                dest_id: b,
                dest_nickname: self
                    .get_node(&b)
                    .map(|n| n.nickname())
                    .unwrap_or_default(),
            })
            .collect();

        NetworkState {
            known_connections,
            known_chat_rooms: self.chat_rooms().iter().map(|r| r.to_info()).collect(),
            known_memos: self.memos(),
        }
    }

    /// Fold a peer's network-state snapshot into ours.
    pub fn append_network_state(self: &Arc<Self>, state: NetworkState) {
        for connection in state.known_connections {
            self.process_gossiped_connection(connection);
        }

        for room_info in state.known_chat_rooms {
            let room = self.get_or_create_chat_room(&room_info.id, &room_info.name);
            for user in room_info.users {
                if user == self.local.id() {
                    if !room.contains(&user) {
                        // Someone thinks we're in a room we never joined.
                        warn!(network = %self.name, room = %room_info.name, "Gossip places us in a room we are not in");
                    }
                    continue;
                }
                if self.get_node(&user).is_none() {
                    warn!(
                        network = %self.name,
                        node = %user.short(),
                        room = %room_info.name,
                        "Gossip references an unknown chat member"
                    );
                    continue;
                }
                if room.add_member(user) {
                    self.raise_joined_chat(&room, user);
                }
            }
        }

        for memo in state.known_memos {
            self.add_or_update_memo(memo);
        }
    }

    fn process_gossiped_connection(self: &Arc<Self>, info: ConnectionInfo) {
        let local = self.local.id();

        if info.source_id == info.dest_id {
            warn!(network = %self.name, "Gossiped connection has identical endpoints");
            return;
        }

        // Edges touching us are authoritative locally: if we don't hold
        // that connection, retract it.
        if info.source_id == local || info.dest_id == local {
            if self.find_connection(&info.source_id, &info.dest_id).is_none() {
                warn!(network = %self.name, "Gossiped connection to us does not exist; retracting");
                let edge = ConnectionEdge {
                    source_id: info.source_id,
                    dest_id: info.dest_id,
                };
                if let Ok(message) =
                    self.make_message(NodeId::BROADCAST, Content::ConnectionDown(edge))
                {
                    let _ = self.send_broadcast(message, None);
                }
            }
            return;
        }

        if self.find_connection(&info.source_id, &info.dest_id).is_some() {
            // Refresh nicknames, nothing else to learn.
            if let Some(node) = self.get_node(&info.source_id) {
                node.set_nickname(&info.source_nickname);
            }
            if let Some(node) = self.get_node(&info.dest_id) {
                node.set_nickname(&info.dest_nickname);
            }
            return;
        }

        for (id, nickname) in [
            (info.source_id, &info.source_nickname),
            (info.dest_id, &info.dest_nickname),
        ] {
            let trusted = self.get_trusted(&id);
            let node = self.provision_node(id, trusted.as_ref());
            if !nickname.is_empty() {
                node.set_nickname(nickname);
            }
        }

        self.add_remote_connection(RemoteNodeConnection {
            source: info.source_id,
            dest: info.dest_id,
        });
    }

    /// A `ConnectionDown` edge retraction arrived.
    pub(crate) fn process_connection_down(self: &Arc<Self>, edge: ConnectionEdge) {
        if edge.source_id == self.local.id() || edge.dest_id == self.local.id() {
            // We know our own connections better than gossip does.
            return;
        }
        if self.remove_remote_connection(&edge.source_id, &edge.dest_id) {
            self.cleanup();
        }
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    /// Remove every node no longer reachable from the local node, along
    /// with its chat memberships and memos. Loops until a pass removes
    /// nothing.
    pub fn cleanup(self: &Arc<Self>) {
        loop {
            let reachable = self.reachable_nodes();
            let stale: Vec<Arc<Node>> = self
                .nodes()
                .into_iter()
                .filter(|n| n.id() != self.local.id() && !reachable.contains(&n.id()))
                .collect();

            if stale.is_empty() {
                break;
            }
            for node in stale {
                self.delete_node(&node);
            }
        }

        self.events.publish(NetworkEvent::CleanupFinished {
            network_id: self.id.clone(),
        });
    }

    /// Breadth-first sweep over the connection adjacency, local and
    /// remote edges alike.
    fn reachable_nodes(&self) -> HashSet<NodeId> {
        let local = self.local.id();
        let mut adjacency: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for link in self.connections().iter().filter(|l| l.is_active()) {
            if let Some((a, b)) = link.endpoints(&local) {
                adjacency.entry(a).or_default().push(b);
                adjacency.entry(b).or_default().push(a);
            }
        }

        let mut reachable = HashSet::new();
        reachable.insert(local);
        let mut queue = VecDeque::from([local]);
        while let Some(current) = queue.pop_front() {
            if let Some(neighbors) = adjacency.get(&current) {
                for neighbor in neighbors {
                    if reachable.insert(*neighbor) {
                        queue.push_back(*neighbor);
                    }
                }
            }
        }
        reachable
    }

    fn delete_node(self: &Arc<Self>, node: &Arc<Node>) {
        let node_id = node.id();

        // Chat memberships go first.
        let rooms = self.chat_rooms();
        for room in &rooms {
            if room.remove_member(&node_id) {
                self.raise_left_chat(room, node_id);
            }
            self.drop_chat_room_if_empty(room.id());
        }

        // Any edges that still mention the node.
        let local = self.local.id();
        let removed_edges: Vec<(NodeId, NodeId)> = {
            let mut connections = self.connections.lock().unwrap();
            let mut removed = Vec::new();
            connections.retain(|link| {
                if link.involves(&local, &node_id) {
                    if let Some(endpoints) = link.endpoints(&local) {
                        removed.push(endpoints);
                    }
                    false
                } else {
                    true
                }
            });
            removed
        };
        for (a, b) in removed_edges {
            self.events.publish(NetworkEvent::ConnectionDown {
                network_id: self.id.clone(),
                source: a,
                dest: b,
            });
        }

        // Memos authored by the node.
        let stale_memos: Vec<MemoInfo> = self
            .memos()
            .into_iter()
            .filter(|m| m.author == node_id)
            .collect();
        for memo in stale_memos {
            self.remove_memo(&memo);
        }

        self.nodes.write().unwrap().remove(&node_id);
        info!(network = %self.name, node = %node.nickname(), "Node disconnected from the network");
        self.events.publish(NetworkEvent::UserOffline {
            network_id: self.id.clone(),
            node: node_id,
            nickname: node.nickname(),
        });
    }

    // -----------------------------------------------------------------------
    // File transfers
    // -----------------------------------------------------------------------

    pub(crate) fn set_transfer_wiring(
        &self,
        manager: Weak<FileTransferManager>,
        messenger: Arc<dyn TransferMessenger>,
    ) {
        let _ = self.transfers.set(manager);
        let _ = self.transfer_messenger.set(messenger);
    }

    pub(crate) fn transfer_manager(&self) -> Option<Arc<FileTransferManager>> {
        self.transfers.get().and_then(|w| w.upgrade())
    }

    pub(crate) fn transfer_messenger(&self) -> Option<Arc<dyn TransferMessenger>> {
        self.transfer_messenger.get().cloned()
    }

    /// Start downloading a remote file from `node`.
    pub fn download_file(
        &self,
        node: &NodeId,
        listing: &SharedFileListing,
    ) -> Result<Arc<FileTransfer>, LatticeError> {
        let manager = self
            .transfer_manager()
            .ok_or_else(|| LatticeError::Transfer(lattice_shared::error::TransferError::Engine(
                "no transfer manager attached".to_string(),
            )))?;
        let messenger = self
            .transfer_messenger()
            .ok_or_else(|| LatticeError::Transfer(lattice_shared::error::TransferError::Engine(
                "no transfer messenger attached".to_string(),
            )))?;

        let transfer = manager
            .start_transfer(&messenger, *node, PieceManifest::from_listing(listing))
            .map_err(LatticeError::Transfer)?;
        Ok(transfer)
    }
}
