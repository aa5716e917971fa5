//! The application context.
//!
//! One `MeshContext` is constructed at startup and handed (by `Arc`) to
//! everything that needs it; there are no ambient globals. It owns the
//! identity, the joined networks, the transport and transfer managers,
//! and the listener/autoconnect lifecycle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::watch;
use tracing::{info, warn};

use lattice_net::{Destination, TransportListener};
use lattice_shared::identity::Identity;
use lattice_shared::types::NodeId;
use lattice_transfer::{
    FileTransferManager, PieceExchangeProvider, TransferEvents, TransferMessenger,
};

use crate::autoconnect::AutoconnectManager;
use crate::connection::LocalNodeConnection;
use crate::events::EventBus;
use crate::interfaces::{NetworkInfo, Settings, ShareIndex};
use crate::messenger::MeshMessenger;
use crate::network::Network;
use crate::transport_manager::TransportManager;

/// Callback hook for credential unlock (e.g. an encrypted key store).
pub type PasswordPrompt = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// All joined networks, keyed by their SHA-512 identifier.
pub struct NetworkRegistry {
    networks: RwLock<HashMap<String, Arc<Network>>>,
}

impl NetworkRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            networks: RwLock::new(HashMap::new()),
        })
    }

    pub fn insert(&self, network: Arc<Network>) {
        self.networks
            .write()
            .unwrap()
            .insert(network.id().to_string(), network);
    }

    pub fn remove(&self, network_id: &str) -> Option<Arc<Network>> {
        self.networks.write().unwrap().remove(network_id)
    }

    pub fn get_by_id(&self, network_id: &str) -> Option<Arc<Network>> {
        self.networks.read().unwrap().get(network_id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Network>> {
        self.networks
            .read()
            .unwrap()
            .values()
            .find(|n| n.name() == name)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<Network>> {
        self.networks.read().unwrap().values().cloned().collect()
    }
}

pub struct MeshContext {
    identity: Arc<Identity>,
    settings: Arc<dyn Settings>,
    share_index: Arc<dyn ShareIndex>,
    events: EventBus,
    networks: Arc<NetworkRegistry>,
    transports: Arc<TransportManager>,
    transfers: Arc<FileTransferManager>,
    autoconnects: Mutex<Vec<Arc<AutoconnectManager>>>,
    listener_shutdown: Mutex<Option<watch::Sender<bool>>>,
    listen_addr: Mutex<Option<SocketAddr>>,
    password_prompt: Mutex<Option<PasswordPrompt>>,
}

impl MeshContext {
    pub fn new(
        identity: Identity,
        settings: Arc<dyn Settings>,
        share_index: Arc<dyn ShareIndex>,
        provider: Arc<dyn PieceExchangeProvider>,
    ) -> Arc<Self> {
        let identity = Arc::new(identity);
        let events = EventBus::new();
        let networks = NetworkRegistry::new();
        let transports = TransportManager::new(Arc::clone(&networks), events.clone());
        let transfers =
            FileTransferManager::new(identity.node_id(), settings.download_dir(), provider);
        transports.set_transfer_manager(Arc::downgrade(&transfers));

        let context = Arc::new(Self {
            identity,
            settings,
            share_index,
            events,
            networks,
            transports,
            transfers,
            autoconnects: Mutex::new(Vec::new()),
            listener_shutdown: Mutex::new(None),
            listen_addr: Mutex::new(None),
            password_prompt: Mutex::new(None),
        });

        // Join every persisted network.
        for info in context.settings.network_infos() {
            context.add_network_from_info(&info);
        }

        context
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn local_node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn transfer_events(&self) -> &TransferEvents {
        self.transfers.events()
    }

    pub fn networks(&self) -> Vec<Arc<Network>> {
        self.networks.all()
    }

    pub fn get_network(&self, network_id: &str) -> Option<Arc<Network>> {
        self.networks.get_by_id(network_id)
    }

    pub fn transfer_manager(&self) -> &Arc<FileTransferManager> {
        &self.transfers
    }

    pub fn transport_manager(&self) -> &Arc<TransportManager> {
        &self.transports
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock().unwrap()
    }

    pub fn set_password_prompt(&self, prompt: PasswordPrompt) {
        *self.password_prompt.lock().unwrap() = Some(prompt);
    }

    /// Ask the application for a credential. `None` when no hook is set
    /// or the user declined.
    pub fn prompt_password(&self, context: &str) -> Option<String> {
        self.password_prompt
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|prompt| prompt(context))
    }

    // -----------------------------------------------------------------------
    // Network membership
    // -----------------------------------------------------------------------

    pub fn add_network(&self, name: &str) -> Arc<Network> {
        let network = Network::new(
            name,
            Arc::clone(&self.identity),
            Arc::clone(&self.settings),
            Arc::clone(&self.share_index),
            self.events.clone(),
        );
        self.wire_network(&network);
        network
    }

    pub fn add_network_from_info(&self, info: &NetworkInfo) -> Arc<Network> {
        let network = Network::from_network_info(
            info,
            Arc::clone(&self.identity),
            Arc::clone(&self.settings),
            Arc::clone(&self.share_index),
            self.events.clone(),
        );
        self.wire_network(&network);
        network
    }

    fn wire_network(&self, network: &Arc<Network>) {
        let messenger: Arc<dyn TransferMessenger> = Arc::new(MeshMessenger::new(
            Arc::downgrade(network),
            Arc::downgrade(&self.transports),
            Arc::downgrade(&self.transfers),
        ));
        network.set_transfer_wiring(Arc::downgrade(&self.transfers), messenger);
        self.networks.insert(Arc::clone(network));
        info!(network = %network.name(), "Joined network");
    }

    /// Leave a network: drop it from the registry and close every local
    /// connection it held.
    pub fn remove_network(&self, network_id: &str) {
        if let Some(network) = self.networks.remove(network_id) {
            info!(network = %network.name(), "Leaving network");
            network.disconnect_all();
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Bind the listener and start the accept and autoconnect loops.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let listener = TransportListener::bind(self.settings.tcp_listen_port()).await?;
        *self.listen_addr.lock().unwrap() = Some(listener.local_addr());

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        *self.listener_shutdown.lock().unwrap() = Some(shutdown_tx);

        let transports = Arc::clone(&self.transports);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok(transport) => {
                                let transports = Arc::clone(&transports);
                                tokio::spawn(async move {
                                    transports.handle_incoming(transport).await;
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "Accept failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Listener stopped");
        });

        let target = self.settings.autoconnect_count();
        let mut autoconnects = self.autoconnects.lock().unwrap();
        for network in self.networks.all() {
            let manager =
                AutoconnectManager::new(network, Arc::clone(&self.transports), target);
            manager.start();
            autoconnects.push(manager);
        }

        Ok(())
    }

    /// Stop accepting, stop autoconnecting, and drop every connection.
    pub async fn stop(&self) {
        if let Some(shutdown) = self.listener_shutdown.lock().unwrap().take() {
            let _ = shutdown.send(true);
        }

        for manager in self.autoconnects.lock().unwrap().drain(..) {
            manager.stop();
        }

        for network in self.networks.all() {
            network.disconnect_all();
        }
    }

    /// Manually dial a node on one of our networks.
    pub async fn connect_to(
        self: &Arc<Self>,
        network: &Arc<Network>,
        dest: Destination,
        node: NodeId,
    ) -> anyhow::Result<Arc<LocalNodeConnection>> {
        let connection = self.transports.connect_to_node(network, dest, node).await?;
        Ok(connection)
    }
}
