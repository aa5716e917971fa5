// Byte-transport layer: destinations, TCP transports, length-prefix
// framing, and the per-connection transport encryptor.

pub mod destination;
pub mod encryptor;
pub mod framing;
pub mod listener;
pub mod transport;

pub use destination::Destination;
pub use encryptor::TransportEncryptor;
pub use listener::TransportListener;
pub use transport::{TcpTransport, TransportReader, TransportState, TransportWriter};
