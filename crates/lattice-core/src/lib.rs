//! The mesh core: per-network routing engine, message processor, node and
//! connection model, transport manager, and the application context that
//! wires them together.

pub mod autoconnect;
pub mod builder;
pub mod chat;
pub mod connection;
pub mod context;
pub mod events;
pub mod interfaces;
pub mod messenger;
pub mod network;
pub mod node;
pub mod processor;
pub mod transport_manager;
pub mod trust;

pub use context::{MeshContext, NetworkRegistry, PasswordPrompt};
pub use events::{EventBus, NetworkEvent};
pub use network::Network;
pub use node::Node;
pub use trust::TrustedNodeInfo;
