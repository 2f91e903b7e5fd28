//! Envelope sealing: per-recipient encryption plus sender signatures.
//!
//! Every envelope uses a fresh X25519 ephemeral key agreed against the
//! recipient's exchange key. Small payloads are encrypted directly under the
//! derived key; payloads above the hybrid threshold are encrypted under a
//! random content key and only that key is sealed, so the asymmetric work
//! does not grow with attachment size.

use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey as ExchangePublic};

use crate::constants::{HYBRID_THRESHOLD, PROTOCOL_VERSION};
use crate::crypto::{content_key, derive_envelope_key, open, seal, SymmetricKey};
use crate::error::CryptoError;
use crate::identity::{verify_signature, Identity};
use crate::protocol::Envelope;
use crate::types::PublicKey;

#[derive(Clone)]
pub struct CryptoEngine {
    identity: Identity,
    hybrid_threshold: usize,
}

impl CryptoEngine {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            hybrid_threshold: HYBRID_THRESHOLD,
        }
    }

    pub fn with_hybrid_threshold(mut self, threshold: usize) -> Self {
        self.hybrid_threshold = threshold;
        self
    }

    pub fn local_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    /// Encrypt `plaintext` for `recipient` and sign the result.
    pub fn encrypt_for(
        &self,
        recipient: &PublicKey,
        type_tag: u8,
        sequence: u64,
        plaintext: &[u8],
    ) -> Result<Envelope, CryptoError> {
        let sender = self.local_key();

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = ExchangePublic::from(&ephemeral).to_bytes();
        let shared = ephemeral.diffie_hellman(&ExchangePublic::from(recipient.exchange));
        if !shared.was_contributory() {
            return Err(CryptoError::EncryptionFailed);
        }
        let key = derive_envelope_key(shared.as_bytes(), &ephemeral_public, &sender, recipient);

        let (wrapped_key, ciphertext) = if plaintext.len() > self.hybrid_threshold {
            let content = content_key();
            let ciphertext = seal(&content, plaintext)?;
            (Some(seal(&key, &content)?), ciphertext)
        } else {
            (None, seal(&key, plaintext)?)
        };

        let mut envelope = Envelope {
            version: PROTOCOL_VERSION,
            sender,
            recipient: *recipient,
            sequence,
            type_tag,
            ephemeral: ephemeral_public,
            wrapped_key,
            ciphertext,
            signature: Vec::new(),
        };

        let signed = envelope
            .signing_bytes()
            .map_err(|_| CryptoError::EncryptionFailed)?;
        envelope.signature = self.identity.sign(&signed).to_bytes().to_vec();

        Ok(envelope)
    }

    /// Verify, then decrypt an envelope addressed to the local identity.
    pub fn decrypt(&self, envelope: &Envelope) -> Result<Vec<u8>, CryptoError> {
        let signed = envelope
            .signing_bytes()
            .map_err(|_| CryptoError::SignatureInvalid)?;
        verify_signature(&envelope.sender, &signed, &envelope.signature)
            .map_err(|_| CryptoError::SignatureInvalid)?;

        let local = self.local_key();
        if envelope.recipient != local {
            return Err(CryptoError::DecryptionFailed);
        }

        let shared = self
            .identity
            .exchange_secret()
            .diffie_hellman(&ExchangePublic::from(envelope.ephemeral));
        if !shared.was_contributory() {
            return Err(CryptoError::DecryptionFailed);
        }
        let key = derive_envelope_key(
            shared.as_bytes(),
            &envelope.ephemeral,
            &envelope.sender,
            &local,
        );

        match &envelope.wrapped_key {
            Some(wrapped) => {
                let unwrapped = open(&key, wrapped)?;
                let content: SymmetricKey = unwrapped
                    .as_slice()
                    .try_into()
                    .map_err(|_| CryptoError::DecryptionFailed)?;
                open(&content, &envelope.ciphertext)
            }
            None => open(&key, &envelope.ciphertext),
        }
    }
}
