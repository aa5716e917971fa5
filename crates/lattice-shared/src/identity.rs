use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::IdentityError;
use crate::types::NodeId;

/// A node's cryptographic identity: an Ed25519 signing keypair plus a
/// static X25519 exchange keypair. The node ID is the SHA-512 digest of
/// the two public keys, so it cannot be claimed without holding both
/// secrets.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    exchange_secret: StaticSecret,
}

/// The public half of an identity, as shipped in key-exchange messages and
/// imported into trusted-node lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIdentity {
    pub signing_key: [u8; 32],
    pub exchange_key: [u8; 32],
}

impl PublicIdentity {
    /// Derive the node ID for this public identity.
    pub fn node_id(&self) -> NodeId {
        let mut material = [0u8; 64];
        material[..32].copy_from_slice(&self.signing_key);
        material[32..].copy_from_slice(&self.exchange_key);
        NodeId::from_key_material(&material)
    }
}

/// Serializable format for storing/exporting an identity.
#[derive(Serialize, Deserialize)]
pub struct IdentityExport {
    pub signing_secret: [u8; 32],
    pub exchange_secret: [u8; 32],
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            exchange_secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Restore an identity from secret key bytes.
    pub fn from_secret_bytes(signing_secret: &[u8; 32], exchange_secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(signing_secret),
            exchange_secret: StaticSecret::from(*exchange_secret),
        }
    }

    /// Restore an identity from a serialized export.
    pub fn from_export(export: &IdentityExport) -> Self {
        Self::from_secret_bytes(&export.signing_secret, &export.exchange_secret)
    }

    /// Export for serialization.
    pub fn to_export(&self) -> IdentityExport {
        IdentityExport {
            signing_secret: *self.signing_key.as_bytes(),
            exchange_secret: self.exchange_secret.to_bytes(),
        }
    }

    /// The public half of this identity.
    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            signing_key: self.signing_key.verifying_key().to_bytes(),
            exchange_key: PublicKey::from(&self.exchange_secret).to_bytes(),
        }
    }

    /// The node ID derived from the public keys.
    pub fn node_id(&self) -> NodeId {
        self.public().node_id()
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// The static X25519 secret, for opening sealed session keys.
    pub fn exchange_secret(&self) -> &StaticSecret {
        &self.exchange_secret
    }
}

/// Verify a signature against an Ed25519 public key.
pub fn verify_signature(
    signing_key: &[u8; 32],
    message: &[u8],
    signature: &[u8],
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(signing_key).map_err(|_| IdentityError::InvalidKeyBytes)?;
    let signature =
        Signature::from_slice(signature).map_err(|_| IdentityError::InvalidSignature)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| IdentityError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_is_stable() {
        let identity = Identity::generate();
        assert_eq!(identity.node_id(), identity.public().node_id());
        assert_eq!(identity.node_id().to_hex().len(), 128);
    }

    #[test]
    fn test_export_roundtrip() {
        let identity = Identity::generate();
        let restored = Identity::from_export(&identity.to_export());
        assert_eq!(identity.node_id(), restored.node_id());
    }

    #[test]
    fn test_sign_verify() {
        let identity = Identity::generate();
        let message = b"signed payload";
        let signature = identity.sign(message);

        let public = identity.public();
        assert!(verify_signature(&public.signing_key, message, &signature).is_ok());
        assert!(verify_signature(&public.signing_key, b"other payload", &signature).is_err());
    }

    #[test]
    fn test_distinct_identities_distinct_ids() {
        assert_ne!(Identity::generate().node_id(), Identity::generate().node_id());
    }
}
