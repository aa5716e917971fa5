//! Keeps a network connected to its target number of peers.
//!
//! Handshake failures are never retried by the transport layer; this is
//! where the retry policy lives, as per-destination exponential backoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info};

use lattice_shared::types::NodeId;

use crate::network::Network;
use crate::transport_manager::TransportManager;

const TICK_SECS: u64 = 15;
const MAX_BACKOFF_SECS: u64 = 600;

struct BackoffState {
    failures: u32,
    retry_after: Instant,
}

pub struct AutoconnectManager {
    network: Arc<Network>,
    transports: Arc<TransportManager>,
    target: usize,
    backoff: Mutex<HashMap<NodeId, BackoffState>>,
    shutdown_tx: watch::Sender<bool>,
}

impl AutoconnectManager {
    pub fn new(
        network: Arc<Network>,
        transports: Arc<TransportManager>,
        target: usize,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            network,
            transports,
            target,
            backoff: Mutex::new(HashMap::new()),
            shutdown_tx,
        })
    }

    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(TICK_SECS));
            loop {
                tokio::select! {
                    _ = interval.tick() => manager.tick().await,
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(network = %manager.network.name(), "Autoconnect stopped");
        });
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn tick(&self) {
        let ready = self.network.ready_local_connections().len();
        if ready >= self.target {
            return;
        }

        let mut wanted = self.target - ready;
        for candidate in self.candidates() {
            if wanted == 0 {
                break;
            }
            if self.try_connect(candidate).await {
                wanted -= 1;
            }
        }
    }

    /// Trusted nodes with connectable destinations that we are not
    /// already connected to and that are not backing off.
    fn candidates(&self) -> Vec<NodeId> {
        let connected: Vec<NodeId> = self
            .network
            .local_connections()
            .iter()
            .filter_map(|c| c.remote_node_id())
            .collect();

        let now = Instant::now();
        let backoff = self.backoff.lock().unwrap();

        self.network
            .nodes()
            .into_iter()
            .filter(|n| n.id() != self.network.local_node_id())
            .filter(|n| self.network.is_trusted(&n.id()))
            .filter(|n| !connected.contains(&n.id()))
            .filter(|n| n.destinations().iter().any(|d| d.can_connect()))
            .filter(|n| {
                backoff
                    .get(&n.id())
                    .map(|b| b.retry_after <= now)
                    .unwrap_or(true)
            })
            .map(|n| n.id())
            .collect()
    }

    async fn try_connect(&self, node: NodeId) -> bool {
        let destinations = match self.network.get_node(&node) {
            Some(n) => n.destinations(),
            None => return false,
        };

        for dest in destinations.into_iter().filter(|d| d.can_connect()) {
            info!(
                network = %self.network.name(),
                node = %node.short(),
                dest = %dest,
                "Autoconnecting"
            );
            match self
                .transports
                .connect_to_node(&self.network, dest, node)
                .await
            {
                Ok(_connection) => {
                    self.backoff.lock().unwrap().remove(&node);
                    return true;
                }
                Err(e) => {
                    debug!(
                        network = %self.network.name(),
                        node = %node.short(),
                        error = %e,
                        "Autoconnect attempt failed"
                    );
                }
            }
        }

        self.record_failure(node);
        false
    }

    fn record_failure(&self, node: NodeId) {
        let mut backoff = self.backoff.lock().unwrap();
        let state = backoff.entry(node).or_insert(BackoffState {
            failures: 0,
            retry_after: Instant::now(),
        });
        state.failures += 1;
        let delay = (TICK_SECS << state.failures.min(6)).min(MAX_BACKOFF_SECS);
        state.retry_after = Instant::now() + Duration::from_secs(delay);
    }
}
