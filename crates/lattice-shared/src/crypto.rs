use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::constants::{
    KDF_CONTEXT_ROOM_KEY, KDF_CONTEXT_SEALED_KEY, KDF_CONTEXT_TRANSPORT_KEY, KEY_EXCHANGE_LEN,
    NONCE_SIZE,
};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

// BLAKE3 KDF with domain separation
fn derive_key(context: &str, material: &[u8]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(material);
    let hash = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash.as_bytes()[..32]);
    key
}

/// Derive the per-connection transport key from an X25519 shared secret.
pub fn derive_transport_key(shared_secret: &[u8; 32]) -> SymmetricKey {
    derive_key(KDF_CONTEXT_TRANSPORT_KEY, shared_secret)
}

/// Derive a chat-room content key from the room password, salted with the
/// room identifier.
pub fn derive_room_key(password: &str, room_id: &str) -> SymmetricKey {
    let mut material = Vec::with_capacity(password.len() + room_id.len());
    material.extend_from_slice(password.as_bytes());
    material.extend_from_slice(room_id.as_bytes());
    derive_key(KDF_CONTEXT_ROOM_KEY, &material)
}

/// Seal a blob to a recipient's static X25519 key.
///
/// Output layout: ephemeral public value (32 bytes) || nonce || ciphertext.
/// Used to deliver session keys to trusted nodes.
pub fn seal(recipient_exchange_key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient_exchange_key));
    let key = derive_key(KDF_CONTEXT_SEALED_KEY, shared.as_bytes());

    let sealed = encrypt(&key, plaintext)?;

    let mut output = Vec::with_capacity(KEY_EXCHANGE_LEN + sealed.len());
    output.extend_from_slice(ephemeral_public.as_bytes());
    output.extend_from_slice(&sealed);
    Ok(output)
}

/// Open a blob sealed with [`seal`] using our static X25519 secret.
pub fn open(exchange_secret: &StaticSecret, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < KEY_EXCHANGE_LEN + NONCE_SIZE {
        return Err(CryptoError::InvalidSealedBlob);
    }

    let (ephemeral_bytes, sealed) = blob.split_at(KEY_EXCHANGE_LEN);
    let mut ephemeral_public = [0u8; 32];
    ephemeral_public.copy_from_slice(ephemeral_bytes);

    let shared = exchange_secret.diffie_hellman(&PublicKey::from(ephemeral_public));
    let key = derive_key(KDF_CONTEXT_SEALED_KEY, shared.as_bytes());

    decrypt(&key, sealed)
}
