use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};
use uuid::Uuid;

/// Length of a node identifier in bytes (SHA-512 digest).
pub const NODE_ID_LEN: usize = 64;

// Node identity = SHA-512 over the node's public keys (128 hex chars).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    /// The broadcast sentinel: the all-zero node ID.
    pub const BROADCAST: NodeId = NodeId([0u8; NODE_ID_LEN]);

    /// Derive a node ID by hashing arbitrary key material.
    pub fn from_key_material(material: &[u8]) -> Self {
        let digest = Sha512::digest(material);
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != NODE_ID_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; NODE_ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// First 8 hex chars, for log output.
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

// serde only derives array impls up to 32 elements, so the 64-byte digest
// is serialized by hand as a byte string.
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct NodeIdVisitor;

impl<'de> Visitor<'de> for NodeIdVisitor {
    type Value = NodeId;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "{} bytes", NODE_ID_LEN)
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        if v.len() != NODE_ID_LEN {
            return Err(E::invalid_length(v.len(), &self));
        }
        let mut arr = [0u8; NODE_ID_LEN];
        arr.copy_from_slice(v);
        Ok(NodeId(arr))
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut arr = [0u8; NODE_ID_LEN];
        for (i, slot) in arr.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        Ok(NodeId(arr))
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(NodeIdVisitor)
    }
}

/// Unique message identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SHA-512 digest of arbitrary input, as 128 lowercase hex chars.
///
/// Network and chat-room identifiers are derived this way.
pub fn sha512_hex(input: &str) -> String {
    hex::encode(Sha512::digest(input.as_bytes()))
}

/// Raw SHA-512 digest of arbitrary input.
pub fn sha512_bytes(input: &[u8]) -> [u8; 64] {
    let digest = Sha512::digest(input);
    let mut out = [0u8; 64];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_is_all_zero_hex() {
        assert_eq!(NodeId::BROADCAST.to_hex(), "0".repeat(128));
        assert!(NodeId::BROADCAST.is_broadcast());
    }

    #[test]
    fn test_node_id_hex_roundtrip() {
        let id = NodeId::from_key_material(b"some key material");
        let restored = NodeId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, restored);
        assert_eq!(id.to_hex().len(), 128);
    }

    #[test]
    fn test_node_id_from_hex_rejects_wrong_length() {
        assert!(NodeId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_node_id_serde_roundtrip() {
        let id = NodeId::from_key_material(b"serde");
        let bytes = bincode::serialize(&id).unwrap();
        let restored: NodeId = bincode::deserialize(&bytes).unwrap();
        assert_eq!(id, restored);
    }

    #[test]
    fn test_network_id_is_deterministic() {
        assert_eq!(sha512_hex("Home Network"), sha512_hex("Home Network"));
        assert_ne!(sha512_hex("Home Network"), sha512_hex("Work Network"));
    }
}
