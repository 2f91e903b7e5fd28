//! Symmetric primitives used by envelope sealing.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;

use crate::constants::{KDF_CONTEXT_ENVELOPE_KEY, NONCE_SIZE};
use crate::error::CryptoError;
use crate::types::PublicKey;

pub type SymmetricKey = [u8; 32];

/// Fresh random content key for hybrid envelopes.
pub fn content_key() -> SymmetricKey {
    let mut key = SymmetricKey::default();
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// XChaCha20-Poly1305 under `key`. Output is `nonce || ciphertext`.
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let sealed = XChaCha20Poly1305::new(key.into())
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok([nonce.as_slice(), &sealed].concat())
}

/// Inverse of [`seal`].
pub fn open(key: &SymmetricKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let (nonce, body) = sealed.split_at(NONCE_SIZE);
    XChaCha20Poly1305::new(key.into())
        .decrypt(XNonce::from_slice(nonce), body)
        .map_err(|_| CryptoError::DecryptionFailed)
}

// BLAKE3 KDF with domain separation, bound to the ephemeral key and both ends
pub fn derive_envelope_key(
    shared_secret: &[u8; 32],
    ephemeral_public: &[u8; 32],
    sender: &PublicKey,
    recipient: &PublicKey,
) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_ENVELOPE_KEY);
    hasher.update(shared_secret);
    hasher.update(ephemeral_public);
    hasher.update(&sender.signing);
    hasher.update(&sender.exchange);
    hasher.update(&recipient.signing);
    hasher.update(&recipient.exchange);
    *hasher.finalize().as_bytes()
}
