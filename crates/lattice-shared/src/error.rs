use thiserror::Error;

use crate::protocol::MessageType;
use crate::types::NodeId;

#[derive(Error, Debug)]
pub enum LatticeError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Chat error: {0}")]
    Chat(#[from] ChatError),

    #[error("Cannot add your own key as a trusted node")]
    OwnKey,

    #[error("Unknown memo")]
    UnknownMemo,

    #[error("Only the memo author can delete it")]
    NotMemoAuthor,

    #[error("You do not have an avatar")]
    NoAvatar,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Sealed blob is malformed")]
    InvalidSealedBlob,
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Invalid signature")]
    InvalidSignature,
}

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Message content does not match its type tag {expected:?}")]
    ContentMismatch { expected: MessageType },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Expected routing failures, reported to the caller rather than thrown
/// across the processing loop.
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("Node {0} does not exist on the network")]
    UnknownNode(NodeId),

    #[error("No session key available for {node} (required by {message_type:?})")]
    KeyNotAvailable {
        node: NodeId,
        message_type: MessageType,
    },

    #[error("No direct connection to {0}")]
    NoConnection(NodeId),

    #[error("{message_type:?} message to {to} could not be delivered: no ready connections")]
    DeliveryFailed {
        message_type: MessageType,
        to: NodeId,
    },

    #[error("Connection {0} is closed")]
    ConnectionClosed(String),
}

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Unknown network: {0}")]
    UnknownNetwork(String),

    #[error("Unknown connection type: {0}")]
    UnknownConnectionType(u64),

    #[error("Remote closed the transport during handshake")]
    ClosedDuringHandshake,

    #[error("You tried to connect to yourself")]
    ConnectToSelf,

    #[error("Already connected to {0}")]
    AlreadyConnected(NodeId),

    #[error("Crypto error during handshake: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Wire error during handshake: {0}")]
    Wire(#[from] WireError),

    #[error("IO error during handshake: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Node {0} is already a peer of this transfer")]
    DuplicatePeer(NodeId),

    #[error("You cannot start a file transfer with yourself")]
    SelfTransfer,

    #[error("A file named {0} already exists in the download directory")]
    FileExists(String),

    #[error("Transfer has not been started")]
    NotStarted,

    #[error("Unknown transfer")]
    UnknownTransfer,

    #[error("File {0} is already queued for hashing")]
    AlreadyQueued(String),

    #[error("Hashing failed: {0}")]
    Hashing(String),

    #[error("Piece-exchange engine error: {0}")]
    Engine(String),
}

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Not in chat room {0}")]
    NotInRoom(String),

    #[error("Already in chat room {0}")]
    AlreadyInRoom(String),

    #[error("Incorrect password")]
    IncorrectPassword,
}
