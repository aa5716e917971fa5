use serde::{Deserialize, Serialize};

use lattice_shared::error::IdentityError;
use lattice_shared::identity::{verify_signature, PublicIdentity};
use lattice_shared::protocol::KeyInfo;
use lattice_shared::types::NodeId;

/// An explicitly imported public key. Mutual trust is the precondition for
/// secure messaging and for direct connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedNodeInfo {
    pub public: PublicIdentity,
    /// Display identifier chosen when the key was imported.
    pub identifier: String,
}

impl TrustedNodeInfo {
    pub fn new(public: PublicIdentity, identifier: &str) -> Self {
        Self {
            public,
            identifier: identifier.to_string(),
        }
    }

    pub fn from_key_info(info: &KeyInfo) -> Self {
        Self {
            public: info.public,
            identifier: info.identifier.clone(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.public.node_id()
    }

    /// Verify a message signature against this node's signing key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), IdentityError> {
        verify_signature(&self.public.signing_key, message, signature)
    }
}
