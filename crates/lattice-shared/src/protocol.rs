//! Wire protocol model: the message envelope, the message-type taxonomy,
//! and the typed content payload carried by each type.
//!
//! Every message on an established transport is a bincode-encoded
//! [`Message`]. The envelope's `body` is the bincode encoding of a
//! [`Content`] value, additionally sealed with the per-node session key for
//! types that require an established encrypted session.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::WireError;
use crate::identity::PublicIdentity;
use crate::types::{MessageId, NodeId};

/// Every message type spoken on the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Ping,
    Pong,
    Auth,
    AuthReply,
    Hello,
    RequestKey,
    MyKey,
    NewSessionKey,
    RequestInfo,
    MyInfo,
    NonCriticalError,
    CriticalError,
    SearchRequest,
    SearchResult,
    RequestFile,
    ConnectionDown,
    JoinChat,
    LeaveChat,
    ChatInvite,
    ChatroomMessage,
    PrivateMessage,
    Ready,
    AddMemo,
    DeleteMemo,
    RequestDirListing,
    RespondDirListing,
    Ack,
    RequestFileDetails,
    FileDetails,
    RequestAvatar,
    Avatar,
    Test,
}

impl MessageType {
    /// Types that may only travel over a direct transport connection.
    /// They are never session-encrypted.
    pub fn is_local_only(self) -> bool {
        matches!(
            self,
            Self::Auth
                | Self::AuthReply
                | Self::CriticalError
                | Self::Ping
                | Self::Pong
                | Self::Ready
        )
    }

    /// Types that can be received from (and sent to) nodes without a
    /// mutual trust relationship.
    pub fn is_insecure(self) -> bool {
        matches!(
            self,
            Self::Hello
                | Self::Auth
                | Self::AuthReply
                | Self::JoinChat
                | Self::LeaveChat
                | Self::ChatroomMessage
                | Self::ConnectionDown
                | Self::AddMemo
                | Self::DeleteMemo
                | Self::RequestKey
                | Self::MyKey
                | Self::Ack
                | Self::NonCriticalError
                | Self::SearchRequest
                | Self::SearchResult
        )
    }

    /// Types that require an established session key and travel
    /// session-encrypted. `NewSessionKey` is the one type that requires
    /// mutual trust yet stays unencrypted: it is what bootstraps the
    /// session, sealed to the recipient's exchange key instead.
    pub fn requires_session(self) -> bool {
        !self.is_insecure() && !self.is_local_only() && self != Self::NewSessionKey
    }

    /// Only these types are acknowledged.
    pub fn requires_ack(self) -> bool {
        matches!(
            self,
            Self::PrivateMessage | Self::RequestFile | Self::NewSessionKey | Self::Test
        )
    }
}

// ---------------------------------------------------------------------------
// Content payloads
// ---------------------------------------------------------------------------

/// Connection authentication payload (`Auth` / `AuthReply`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthInfo {
    pub protocol_version: u32,
    pub nickname: String,
}

/// Nickname announcement for newly met nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloInfo {
    pub nickname: String,
}

/// Public key material shipped in `MyKey` replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyInfo {
    pub public: PublicIdentity,
    pub identifier: String,
}

/// A connectable address advertised by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationInfo {
    pub address: IpAddr,
    pub port: u16,
}

/// Node profile pushed to trusted peers (`MyInfo`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub nickname: String,
    pub destinations: Vec<DestinationInfo>,
    pub avatar_size: u64,
    pub file_count: u64,
    pub byte_count: u64,
}

/// Chat membership change (`JoinChat` / `LeaveChat`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatAction {
    pub room_id: String,
    pub room_name: String,
}

/// A chat-room message. For password-protected rooms the text is
/// encrypted with the room key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessageContent {
    pub room_id: String,
    pub text: Vec<u8>,
    pub encrypted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatInviteInfo {
    pub room_id: String,
    pub room_name: String,
    pub message: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoInfo {
    pub id: Uuid,
    pub author: NodeId,
    pub subject: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// A known edge between two nodes, gossiped in network state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub source_id: NodeId,
    pub source_nickname: String,
    pub dest_id: NodeId,
    pub dest_nickname: String,
}

/// A retracted edge (`ConnectionDown`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConnectionEdge {
    pub source_id: NodeId,
    pub dest_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRoomInfo {
    pub id: String,
    pub name: String,
    pub users: Vec<NodeId>,
    pub has_password: bool,
}

/// Snapshot of what a node knows about the network, exchanged when a
/// connection becomes ready.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkState {
    pub known_connections: Vec<ConnectionInfo>,
    pub known_chat_rooms: Vec<ChatRoomInfo>,
    pub known_memos: Vec<MemoInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequestInfo {
    pub id: Uuid,
    pub query: String,
    pub page: u32,
}

/// A shared file, as listed in search results and directory listings.
/// `pieces` is only populated in `FileDetails` responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedFileListing {
    pub name: String,
    pub full_path: String,
    pub size: u64,
    pub info_hash: Option<String>,
    pub piece_length: u32,
    pub pieces: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResultInfo {
    pub search_id: Uuid,
    pub files: Vec<SharedFileListing>,
    pub directories: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedDirectoryInfo {
    pub full_path: String,
    pub directories: Vec<String>,
    pub files: Vec<SharedFileListing>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFileInfo {
    pub full_path: String,
    pub transfer_id: Uuid,
}

/// Application-level errors carried by `NonCriticalError` and
/// `CriticalError` messages.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeshError {
    #[error("Not trusted")]
    NotTrusted,

    #[error("You tried to connect to yourself")]
    ConnectToSelf,

    #[error("A connection to this node already exists")]
    AlreadyConnected,

    #[error("Protocol version mismatch (local {local}, remote {remote})")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("{0:?} messages are only valid on a direct connection")]
    LocalOnly(MessageType),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Typed message content, one variant per [`MessageType`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Content {
    Ping(u64),
    Pong(u64),
    Auth(AuthInfo),
    AuthReply(AuthInfo),
    Hello(HelloInfo),
    RequestKey,
    MyKey(KeyInfo),
    /// A session key sealed to the recipient's exchange key.
    NewSessionKey(Vec<u8>),
    RequestInfo,
    MyInfo(NodeInfo),
    NonCriticalError(MeshError),
    CriticalError(MeshError),
    SearchRequest(SearchRequestInfo),
    SearchResult(SearchResultInfo),
    RequestFile(RequestFileInfo),
    ConnectionDown(ConnectionEdge),
    JoinChat(ChatAction),
    LeaveChat(ChatAction),
    ChatInvite(ChatInviteInfo),
    ChatroomMessage(ChatMessageContent),
    PrivateMessage(String),
    Ready(NetworkState),
    AddMemo(MemoInfo),
    DeleteMemo(Uuid),
    RequestDirListing(String),
    RespondDirListing(SharedDirectoryInfo),
    Ack(MessageId),
    RequestFileDetails(String),
    FileDetails(SharedFileListing),
    RequestAvatar,
    Avatar(Vec<u8>),
    Test,
}

impl Content {
    pub fn message_type(&self) -> MessageType {
        match self {
            Content::Ping(_) => MessageType::Ping,
            Content::Pong(_) => MessageType::Pong,
            Content::Auth(_) => MessageType::Auth,
            Content::AuthReply(_) => MessageType::AuthReply,
            Content::Hello(_) => MessageType::Hello,
            Content::RequestKey => MessageType::RequestKey,
            Content::MyKey(_) => MessageType::MyKey,
            Content::NewSessionKey(_) => MessageType::NewSessionKey,
            Content::RequestInfo => MessageType::RequestInfo,
            Content::MyInfo(_) => MessageType::MyInfo,
            Content::NonCriticalError(_) => MessageType::NonCriticalError,
            Content::CriticalError(_) => MessageType::CriticalError,
            Content::SearchRequest(_) => MessageType::SearchRequest,
            Content::SearchResult(_) => MessageType::SearchResult,
            Content::RequestFile(_) => MessageType::RequestFile,
            Content::ConnectionDown(_) => MessageType::ConnectionDown,
            Content::JoinChat(_) => MessageType::JoinChat,
            Content::LeaveChat(_) => MessageType::LeaveChat,
            Content::ChatInvite(_) => MessageType::ChatInvite,
            Content::ChatroomMessage(_) => MessageType::ChatroomMessage,
            Content::PrivateMessage(_) => MessageType::PrivateMessage,
            Content::Ready(_) => MessageType::Ready,
            Content::AddMemo(_) => MessageType::AddMemo,
            Content::DeleteMemo(_) => MessageType::DeleteMemo,
            Content::RequestDirListing(_) => MessageType::RequestDirListing,
            Content::RespondDirListing(_) => MessageType::RespondDirListing,
            Content::Ack(_) => MessageType::Ack,
            Content::RequestFileDetails(_) => MessageType::RequestFileDetails,
            Content::FileDetails(_) => MessageType::FileDetails,
            Content::RequestAvatar => MessageType::RequestAvatar,
            Content::Avatar(_) => MessageType::Avatar,
            Content::Test => MessageType::Test,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        bincode::serialize(self).map_err(|e| WireError::Encode(e.to_string()))
    }

    /// Decode a content payload and check it against the envelope's type
    /// tag. A mismatch means the sender lied about the type (or the body
    /// was decrypted with the wrong key).
    pub fn decode(expected: MessageType, bytes: &[u8]) -> Result<Self, WireError> {
        let content: Content =
            bincode::deserialize(bytes).map_err(|e| WireError::Decode(e.to_string()))?;
        if content.message_type() != expected {
            return Err(WireError::ContentMismatch { expected });
        }
        Ok(content)
    }
}

/// The immutable message envelope.
///
/// `body` is an encoded [`Content`]; for types with
/// [`MessageType::requires_session`] it is additionally encrypted with the
/// sender's session key. `signature` is an Ed25519 signature over `body`,
/// verifiable once the sender's public key is trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub from: NodeId,
    pub to: NodeId,
    pub ty: MessageType,
    pub body: Vec<u8>,
    pub signature: Option<Vec<u8>>,
}

impl Message {
    /// Serialize to binary (bincode).
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        bincode::serialize(self).map_err(|e| WireError::Encode(e.to_string()))
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        bincode::deserialize(data).map_err(|e| WireError::Decode(e.to_string()))
    }
}
