//! End-to-end test over real TCP: two application contexts, the full
//! transport handshake (key exchange, connection-type tag, network-ID
//! digest), authentication, session keys, and a private message.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use lattice_core::context::MeshContext;
use lattice_core::events::NetworkEvent;
use lattice_core::interfaces::{InMemorySettings, InMemoryShareIndex, Settings, ShareIndex};
use lattice_core::network::Network;
use lattice_core::trust::TrustedNodeInfo;
use lattice_net::Destination;
use lattice_shared::error::TransferError;
use lattice_shared::identity::Identity;
use lattice_transfer::{PieceExchangeProvider, PieceManifest, PieceSession};

const NET_NAME: &str = "tcp-e2e-net";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The piece-exchange engine is out of scope here; transfers are not
/// exercised over this harness.
struct NullProvider;

impl PieceExchangeProvider for NullProvider {
    fn create_session(
        &self,
        _manifest: &PieceManifest,
    ) -> Result<Arc<dyn PieceSession>, TransferError> {
        Err(TransferError::Engine("no engine in this test".to_string()))
    }

    fn handle_incoming(&self, _transport: lattice_net::TcpTransport) {}

    fn release(&self, _info_hash: &str) {}
}

struct Instance {
    identity_public: lattice_shared::identity::PublicIdentity,
    context: Arc<MeshContext>,
    network: Arc<Network>,
}

fn instance(nickname: &str) -> Instance {
    let identity = Identity::generate();
    let identity_public = identity.public();

    let mut settings = InMemorySettings::new(nickname);
    settings.tcp_listen_port = 0;

    let context = MeshContext::new(
        identity,
        Arc::new(settings) as Arc<dyn Settings>,
        Arc::new(InMemoryShareIndex::new()) as Arc<dyn ShareIndex>,
        Arc::new(NullProvider),
    );
    let network = context.add_network(NET_NAME);

    Instance {
        identity_public,
        context,
        network,
    }
}

fn loopback(addr: SocketAddr) -> Destination {
    let mut addr = addr;
    addr.set_ip("127.0.0.1".parse().unwrap());
    Destination::from_socket_addr(addr)
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    timeout(Duration::from_secs(10), async {
        loop {
            if check() {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tcp_handshake_and_private_message() {
    init_tracing();
    let alice = instance("alice");
    let bob = instance("bob");

    alice
        .network
        .add_trusted_node(TrustedNodeInfo::new(bob.identity_public, "bob"))
        .unwrap();
    bob.network
        .add_trusted_node(TrustedNodeInfo::new(alice.identity_public, "alice"))
        .unwrap();

    alice.context.start().await.unwrap();
    bob.context.start().await.unwrap();

    let mut bob_events = bob.context.events().subscribe();

    let bob_node = bob.network.local_node_id();
    let dest = loopback(bob.context.listen_addr().unwrap());
    alice
        .context
        .connect_to(&alice.network, dest, bob_node)
        .await
        .unwrap();

    // Handshake, auth, ready, and the session-key exchange all complete
    // in the background.
    wait_for("alice's session with bob", || {
        alice
            .network
            .get_node(&bob_node)
            .map(|n| n.finished_key_exchange())
            .unwrap_or(false)
    })
    .await;
    wait_for("bob's session with alice", || {
        bob.network
            .get_node(&alice.network.local_node_id())
            .map(|n| n.finished_key_exchange())
            .unwrap_or(false)
    })
    .await;

    assert_eq!(alice.network.ready_local_connections().len(), 1);
    assert_eq!(bob.network.ready_local_connections().len(), 1);

    alice
        .network
        .send_private_message(&bob_node, "over real sockets")
        .unwrap();

    let received = timeout(Duration::from_secs(10), async {
        loop {
            match bob_events.recv().await {
                Ok(NetworkEvent::PrivateMessage { text, .. }) => return text,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for the private message");
    assert_eq!(received, "over real sockets");

    alice.context.stop().await;
    bob.context.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_network_id_is_fatal() {
    init_tracing();
    let alice = instance("alice");
    let bob = instance("bob");

    alice
        .network
        .add_trusted_node(TrustedNodeInfo::new(bob.identity_public, "bob"))
        .unwrap();

    // Bob never joined this network.
    let stray = alice.context.add_network("some-other-net");

    alice.context.start().await.unwrap();
    bob.context.start().await.unwrap();

    let mut bob_events = bob.context.events().subscribe();

    let dest = loopback(bob.context.listen_addr().unwrap());
    let result = alice
        .context
        .connect_to(&stray, dest, bob.network.local_node_id())
        .await;

    // The responder tears the transport down on the unknown network ID
    // and reports it; the initiator notices the dead transport at the
    // latest on first use, so the connection never becomes ready.
    let message = timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(NetworkEvent::TransportError { message }) = bob_events.recv().await {
                return message;
            }
        }
    })
    .await
    .expect("timed out waiting for bob's transport error");
    assert!(message.contains("Unknown network"));

    if result.is_ok() {
        sleep(Duration::from_millis(500)).await;
        assert!(stray.ready_local_connections().is_empty());
    }

    alice.context.stop().await;
    bob.context.stop().await;
}
