//! The connection graph: live transport-backed connections and inferred
//! remote edges.

use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use lattice_net::Destination;
use lattice_shared::error::RoutingError;
use lattice_shared::protocol::Message;
use lattice_shared::types::NodeId;

/// Directional handshake state of a local connection. Only `Ready`
/// connections take part in routing and broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Waiting,
    Connecting,
    Connected,
    Securing,
    Ready,
    Disconnected,
}

/// A connection backed by a live transport.
///
/// The connection itself is transport-agnostic: outbound messages go into
/// a queue drained by the writer task, and `closed` tells both loops to
/// stop. Disconnection is terminal.
pub struct LocalNodeConnection {
    id: Uuid,
    incoming: bool,
    remote_addr: Destination,
    state: Mutex<ConnectionState>,
    remote_node: RwLock<Option<NodeId>>,
    outbound: mpsc::UnboundedSender<Message>,
    closed_tx: watch::Sender<bool>,
    last_ping: Mutex<Option<(u64, Instant)>>,
    latency: Mutex<Option<Duration>>,
}

impl LocalNodeConnection {
    pub fn new(
        incoming: bool,
        remote_addr: Destination,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Self {
        let (closed_tx, _closed_rx) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            incoming,
            remote_addr,
            state: Mutex::new(if incoming {
                ConnectionState::Connected
            } else {
                ConnectionState::Waiting
            }),
            remote_node: RwLock::new(None),
            outbound,
            closed_tx,
            last_ping: Mutex::new(None),
            latency: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn incoming(&self) -> bool {
        self.incoming
    }

    pub fn remote_addr(&self) -> Destination {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: ConnectionState) {
        let mut guard = self.state.lock().unwrap();
        if *guard == ConnectionState::Disconnected {
            // Terminal; nothing comes back from it.
            return;
        }
        if *guard != state {
            debug!(connection = %self.describe(), from = ?*guard, to = ?state, "Connection state changed");
            *guard = state;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn remote_node_id(&self) -> Option<NodeId> {
        *self.remote_node.read().unwrap()
    }

    pub fn set_remote_node(&self, node: NodeId) {
        *self.remote_node.write().unwrap() = Some(node);
    }

    /// Queue a message for the writer task. Fails once the connection is
    /// disconnected or the writer is gone.
    pub fn send_message(&self, message: Message) -> Result<(), RoutingError> {
        if self.state() == ConnectionState::Disconnected {
            return Err(RoutingError::ConnectionClosed(self.describe()));
        }
        self.outbound
            .send(message)
            .map_err(|_| RoutingError::ConnectionClosed(self.describe()))
    }

    /// Transition to `Disconnected` and signal the I/O loops. Idempotent.
    pub fn disconnect(&self) {
        let mut guard = self.state.lock().unwrap();
        if *guard == ConnectionState::Disconnected {
            return;
        }
        *guard = ConnectionState::Disconnected;
        drop(guard);

        debug!(connection = %self.describe(), "Connection disconnected");
        // send_replace stores the value even when nobody subscribed yet, so
        // loops attaching after the fact still observe the closed state.
        let _ = self.closed_tx.send_replace(true);
    }

    /// A receiver that flips to `true` when the connection closes.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    pub fn record_ping_sent(&self, timestamp: u64) {
        *self.last_ping.lock().unwrap() = Some((timestamp, Instant::now()));
    }

    /// Match a pong against the outstanding ping and record latency.
    pub fn received_pong(&self, timestamp: u64) -> Option<Duration> {
        let mut guard = self.last_ping.lock().unwrap();
        match guard.take() {
            Some((sent, at)) if sent == timestamp => {
                let latency = at.elapsed();
                *self.latency.lock().unwrap() = Some(latency);
                Some(latency)
            }
            other => {
                *guard = other;
                None
            }
        }
    }

    pub fn latency(&self) -> Option<Duration> {
        *self.latency.lock().unwrap()
    }

    pub fn describe(&self) -> String {
        format!(
            "{}/{}",
            if self.incoming { "in" } else { "out" },
            self.remote_addr
        )
    }
}

/// An edge between two nodes neither of which is local: topology
/// knowledge only, no transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteNodeConnection {
    pub source: NodeId,
    pub dest: NodeId,
}

/// One entry in a network's connection collection.
#[derive(Clone)]
pub enum NodeLink {
    Local(std::sync::Arc<LocalNodeConnection>),
    Remote(RemoteNodeConnection),
}

impl NodeLink {
    /// Both endpoints of the edge, if known. `local` is the local node's
    /// ID, used to anchor local connections.
    pub fn endpoints(&self, local: &NodeId) -> Option<(NodeId, NodeId)> {
        match self {
            NodeLink::Local(conn) => conn.remote_node_id().map(|remote| (*local, remote)),
            NodeLink::Remote(rc) => Some((rc.source, rc.dest)),
        }
    }

    pub fn involves(&self, local: &NodeId, node: &NodeId) -> bool {
        self.endpoints(local)
            .map(|(a, b)| a == *node || b == *node)
            .unwrap_or(false)
    }

    pub fn is_active(&self) -> bool {
        match self {
            NodeLink::Local(conn) => conn.state() != ConnectionState::Disconnected,
            NodeLink::Remote(_) => true,
        }
    }
}
