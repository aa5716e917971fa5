/// Protocol version exchanged during connection authentication.
pub const PROTOCOL_VERSION: u32 = 1;

/// XChaCha20-Poly1305 nonce size in bytes.
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes.
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Length of the Diffie-Hellman public value sent during the transport
/// handshake (X25519).
pub const KEY_EXCHANGE_LEN: usize = 32;

/// Length of the connection-type tag sent during the transport handshake.
pub const CONNECTION_TYPE_LEN: usize = 8;

/// Length of the raw network-identifier digest (SHA-512) sent during the
/// transport handshake.
pub const NETWORK_ID_LEN: usize = 64;

/// Connection-type tag for a node connection.
pub const CONNECTION_TYPE_NODE: u64 = 1;

/// Connection-type tag for a file-transfer data channel.
pub const CONNECTION_TYPE_TRANSFER: u64 = 2;

/// Maximum size of a single framed message on the wire (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Default TCP listen port.
pub const DEFAULT_TCP_PORT: u16 = 7332;

/// Interval between keepalive pings on a ready connection.
pub const PING_INTERVAL_SECS: u64 = 30;

/// Key derivation contexts (BLAKE3).
pub const KDF_CONTEXT_TRANSPORT_KEY: &str = "lattice-transport-key-v1";
pub const KDF_CONTEXT_SEALED_KEY: &str = "lattice-sealed-key-v1";
pub const KDF_CONTEXT_ROOM_KEY: &str = "lattice-room-key-v1";
