//! Per-connection transport encryption.
//!
//! After the handshake's Diffie-Hellman exchange, both ends derive the
//! same symmetric key and install an encryptor on the transport. Every
//! subsequent frame payload passes through it. A fresh random nonce is
//! prepended to each frame, so there is no per-connection IV state.

use lattice_shared::crypto::{self, SymmetricKey};
use lattice_shared::error::CryptoError;

#[derive(Clone)]
pub struct TransportEncryptor {
    key: SymmetricKey,
}

impl TransportEncryptor {
    pub fn new(key: SymmetricKey) -> Self {
        Self { key }
    }

    /// Derive the transport key from an X25519 shared secret.
    pub fn from_shared_secret(shared_secret: &[u8; 32]) -> Self {
        Self::new(crypto::derive_transport_key(shared_secret))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::encrypt(&self.key, plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::decrypt(&self.key, ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_ends_derive_same_cipher() {
        let shared = [9u8; 32];
        let a = TransportEncryptor::from_shared_secret(&shared);
        let b = TransportEncryptor::from_shared_secret(&shared);

        let sealed = a.encrypt(b"frame payload").unwrap();
        assert_eq!(b.decrypt(&sealed).unwrap(), b"frame payload");
    }

    #[test]
    fn test_different_secret_cannot_decrypt() {
        let a = TransportEncryptor::from_shared_secret(&[1u8; 32]);
        let b = TransportEncryptor::from_shared_secret(&[2u8; 32]);

        let sealed = a.encrypt(b"frame payload").unwrap();
        assert!(b.decrypt(&sealed).is_err());
    }
}
