//! Turns raw byte transports into node connections or transfer channels.
//!
//! Both directions run the same fixed handshake: an X25519 exchange that
//! installs the transport encryptor, then an 8-byte connection-type tag
//! and the 64-byte network-identifier digest. Anything unexpected
//! disconnects the transport and raises a transport-error event; retrying
//! is the caller's business.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use x25519_dalek::{EphemeralSecret, PublicKey};

use lattice_net::{Destination, TcpTransport, TransportEncryptor, TransportReader, TransportWriter};
use lattice_shared::constants::{
    CONNECTION_TYPE_LEN, CONNECTION_TYPE_NODE, CONNECTION_TYPE_TRANSFER, KEY_EXCHANGE_LEN,
    NETWORK_ID_LEN, PING_INTERVAL_SECS, PROTOCOL_VERSION,
};
use lattice_shared::error::HandshakeError;
use lattice_shared::protocol::{AuthInfo, Content, Message};
use lattice_shared::types::NodeId;
use lattice_transfer::FileTransferManager;

use crate::connection::{ConnectionState, LocalNodeConnection};
use crate::context::NetworkRegistry;
use crate::events::{EventBus, NetworkEvent};
use crate::network::Network;

pub struct TransportManager {
    networks: Arc<NetworkRegistry>,
    transfers: OnceLock<Weak<FileTransferManager>>,
    events: EventBus,
    active: Mutex<HashMap<Uuid, String>>,
}

impl TransportManager {
    pub fn new(networks: Arc<NetworkRegistry>, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            networks,
            transfers: OnceLock::new(),
            events,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_transfer_manager(&self, transfers: Weak<FileTransferManager>) {
        let _ = self.transfers.set(transfers);
    }

    pub fn transport_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    pub fn transports(&self) -> Vec<String> {
        self.active.lock().unwrap().values().cloned().collect()
    }

    fn register(&self, id: Uuid, description: String) {
        info!(transport = %description, "Transport added");
        self.active.lock().unwrap().insert(id, description);
    }

    fn unregister(&self, id: &Uuid) {
        if let Some(description) = self.active.lock().unwrap().remove(id) {
            info!(transport = %description, "Transport removed");
        }
    }

    fn raise_transport_error(&self, context: &str, error: &HandshakeError) {
        error!(transport = %context, error = %error, "Transport disconnected with error");
        self.events.publish(NetworkEvent::TransportError {
            message: format!("{context}: {error}"),
        });
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Run the responder handshake on an accepted transport and dispatch
    /// it to node-connection or file-transfer handling.
    pub async fn handle_incoming(self: &Arc<Self>, mut transport: TcpTransport) {
        let description = transport.to_string();
        match self.handshake_inbound(&mut transport).await {
            Ok((network, connection_type)) => {
                self.dispatch(network, connection_type, transport).await;
            }
            Err(e) => {
                transport.disconnect().await;
                self.raise_transport_error(&description, &e);
            }
        }
    }

    async fn handshake_inbound(
        &self,
        transport: &mut TcpTransport,
    ) -> Result<(Arc<Network>, u64), HandshakeError> {
        // Responder side of the key exchange: read theirs, send ours.
        let peer_bytes = transport.recv_exact(KEY_EXCHANGE_LEN).await?;
        let mut peer_public = [0u8; 32];
        peer_public.copy_from_slice(&peer_bytes);

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let our_public = PublicKey::from(&ephemeral);
        transport.send_raw(our_public.as_bytes()).await?;

        let shared = ephemeral.diffie_hellman(&PublicKey::from(peer_public));
        transport.install_encryptor(TransportEncryptor::from_shared_secret(shared.as_bytes()));

        // Connection metadata.
        let tag_bytes = transport.recv_exact(CONNECTION_TYPE_LEN).await?;
        let mut tag = [0u8; 8];
        tag.copy_from_slice(&tag_bytes);
        let connection_type = u64::from_be_bytes(tag);

        let id_bytes = transport.recv_exact(NETWORK_ID_LEN).await?;
        let network_id = hex::encode(id_bytes);

        let network = self
            .networks
            .get_by_id(&network_id)
            .ok_or(HandshakeError::UnknownNetwork(network_id))?;

        if connection_type != CONNECTION_TYPE_NODE && connection_type != CONNECTION_TYPE_TRANSFER {
            return Err(HandshakeError::UnknownConnectionType(connection_type));
        }

        Ok((network, connection_type))
    }

    async fn dispatch(self: &Arc<Self>, network: Arc<Network>, connection_type: u64, transport: TcpTransport) {
        let description = transport.to_string();
        match connection_type {
            CONNECTION_TYPE_NODE => {
                if let Err(e) = self.spawn_node_connection(&network, transport, None) {
                    self.raise_transport_error(&description, &e);
                }
            }
            CONNECTION_TYPE_TRANSFER => {
                match self.transfers.get().and_then(|w| w.upgrade()) {
                    Some(transfers) => transfers.handle_incoming_transport(transport),
                    None => {
                        warn!(transport = %description, "Transfer transport with no transfer manager");
                    }
                }
            }
            other => {
                // Unreachable: the handshake validated the tag.
                self.raise_transport_error(
                    &description,
                    &HandshakeError::UnknownConnectionType(other),
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Open a transport to `dest` and run the initiator handshake.
    pub async fn connect_transport(
        self: &Arc<Self>,
        network: &Arc<Network>,
        dest: Destination,
        connection_type: u64,
    ) -> Result<TcpTransport, HandshakeError> {
        let mut transport = TcpTransport::connect(&dest).await?;
        let description = transport.to_string();

        match self
            .handshake_outbound(&mut transport, network, connection_type)
            .await
        {
            Ok(()) => Ok(transport),
            Err(e) => {
                transport.disconnect().await;
                self.raise_transport_error(&description, &e);
                Err(e)
            }
        }
    }

    async fn handshake_outbound(
        &self,
        transport: &mut TcpTransport,
        network: &Arc<Network>,
        connection_type: u64,
    ) -> Result<(), HandshakeError> {
        // Initiator side of the key exchange: send ours, read theirs.
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let our_public = PublicKey::from(&ephemeral);
        transport.send_raw(our_public.as_bytes()).await?;

        let peer_bytes = transport.recv_exact(KEY_EXCHANGE_LEN).await?;
        let mut peer_public = [0u8; 32];
        peer_public.copy_from_slice(&peer_bytes);

        let shared = ephemeral.diffie_hellman(&PublicKey::from(peer_public));
        transport.install_encryptor(TransportEncryptor::from_shared_secret(shared.as_bytes()));

        transport.send_raw(&connection_type.to_be_bytes()).await?;

        let id_bytes = hex::decode(network.id())
            .map_err(|_| HandshakeError::UnknownNetwork(network.id().to_string()))?;
        transport.send_raw(&id_bytes).await?;

        Ok(())
    }

    /// Dial a known node and bring up a full node connection.
    pub async fn connect_to_node(
        self: &Arc<Self>,
        network: &Arc<Network>,
        dest: Destination,
        expected: NodeId,
    ) -> Result<Arc<LocalNodeConnection>, HandshakeError> {
        if expected == network.local_node_id() {
            return Err(HandshakeError::ConnectToSelf);
        }

        let transport = self
            .connect_transport(network, dest, CONNECTION_TYPE_NODE)
            .await?;
        self.spawn_node_connection(network, transport, Some(expected))
    }

    // -----------------------------------------------------------------------
    // Node-connection plumbing
    // -----------------------------------------------------------------------

    /// Wrap a handshaken transport in a `LocalNodeConnection`, register
    /// it, and start its reader/writer/keepalive loops.
    fn spawn_node_connection(
        self: &Arc<Self>,
        network: &Arc<Network>,
        transport: TcpTransport,
        expected: Option<NodeId>,
    ) -> Result<Arc<LocalNodeConnection>, HandshakeError> {
        let incoming = transport.incoming();
        let dest = transport.remote_destination();
        let description = transport.to_string();
        let (reader, writer) = transport.split();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(LocalNodeConnection::new(incoming, dest, outbound_tx));
        if let Some(node) = expected {
            connection.set_remote_node(node);
        }
        connection.set_state(ConnectionState::Connected);

        // Dropping reader/writer on failure closes the socket.
        network.add_local_connection(&connection)?;
        self.register(connection.id(), description);

        self.spawn_writer_loop(&connection, writer, outbound_rx);
        self.spawn_reader_loop(network, &connection, reader);
        self.spawn_ping_loop(network, &connection);

        if !incoming {
            if let Some(node) = expected {
                let auth = network.make_message(
                    node,
                    Content::Auth(AuthInfo {
                        protocol_version: PROTOCOL_VERSION,
                        nickname: network.local_node().nickname(),
                    }),
                );
                match auth {
                    Ok(message) => {
                        if let Err(e) = connection.send_message(message) {
                            warn!(error = %e, "Failed to queue auth");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to build auth"),
                }
            }
        }

        Ok(connection)
    }

    fn spawn_writer_loop(
        &self,
        connection: &Arc<LocalNodeConnection>,
        mut writer: TransportWriter,
        mut outbound: mpsc::UnboundedReceiver<Message>,
    ) {
        let connection = Arc::clone(connection);
        tokio::spawn(async move {
            let mut closed = connection.closed_signal();
            loop {
                tokio::select! {
                    maybe = outbound.recv() => {
                        let message = match maybe {
                            Some(message) => message,
                            None => break,
                        };
                        let bytes = match message.to_bytes() {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                error!(connection = %connection.describe(), error = %e, "Unencodable message dropped");
                                continue;
                            }
                        };
                        if let Err(e) = writer.send_frame(&bytes).await {
                            debug!(connection = %connection.describe(), error = %e, "Write failed");
                            connection.disconnect();
                            break;
                        }
                    }
                    _ = closed.changed() => {
                        if *closed.borrow() {
                            break;
                        }
                    }
                }
            }
            writer.shutdown().await;
        });
    }

    fn spawn_reader_loop(
        self: &Arc<Self>,
        network: &Arc<Network>,
        connection: &Arc<LocalNodeConnection>,
        mut reader: TransportReader,
    ) {
        let manager = Arc::clone(self);
        let network = Arc::clone(network);
        let connection = Arc::clone(connection);
        tokio::spawn(async move {
            let mut closed = connection.closed_signal();
            loop {
                tokio::select! {
                    frame = reader.recv_frame() => {
                        match frame {
                            Ok(bytes) => match Message::from_bytes(&bytes) {
                                Ok(message) => network.process_message(&connection, message),
                                Err(e) => {
                                    // A stream we can't parse anymore is a
                                    // stream we can't trust.
                                    warn!(connection = %connection.describe(), error = %e, "Undecodable frame");
                                    break;
                                }
                            },
                            Err(e) => {
                                debug!(connection = %connection.describe(), error = %e, "Read loop ended");
                                break;
                            }
                        }
                    }
                    _ = closed.changed() => {
                        if *closed.borrow() {
                            break;
                        }
                    }
                }
            }
            connection.disconnect();
            network.handle_connection_closed(&connection);
            manager.unregister(&connection.id());
        });
    }

    fn spawn_ping_loop(&self, network: &Arc<Network>, connection: &Arc<LocalNodeConnection>) {
        let network = Arc::clone(network);
        let connection = Arc::clone(connection);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
            // The first tick fires immediately; skip it so pings start one
            // interval after the handshake.
            interval.tick().await;

            let mut closed = connection.closed_signal();
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if connection.state() == ConnectionState::Disconnected {
                            break;
                        }
                        if !connection.is_ready() {
                            continue;
                        }
                        let remote = match connection.remote_node_id() {
                            Some(remote) => remote,
                            None => continue,
                        };
                        let timestamp = SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .unwrap_or_default()
                            .as_millis() as u64;
                        match network.make_message(remote, Content::Ping(timestamp)) {
                            Ok(message) => {
                                connection.record_ping_sent(timestamp);
                                if connection.send_message(message).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(connection = %connection.describe(), error = %e, "Skipping ping");
                            }
                        }
                    }
                    _ = closed.changed() => {
                        if *closed.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }
}
