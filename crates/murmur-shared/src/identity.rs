use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as ExchangePublic, StaticSecret};

use crate::error::IdentityError;
use crate::types::PublicKey;

/// A device's cryptographic identity: an Ed25519 key for signing envelopes
/// and an X25519 key for receiving them. The public half is the device
/// address. No email, no phone number.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    exchange_secret: StaticSecret,
}

/// Serializable format for storing the identity on disk (hex fields)
#[derive(Serialize, Deserialize)]
pub struct IdentityExport {
    pub signing_secret: String,
    pub exchange_secret: String,
    pub public_key: String,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            exchange_secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Restore identity from secret key bytes
    pub fn from_secret_bytes(signing: &[u8; 32], exchange: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(signing),
            exchange_secret: StaticSecret::from(*exchange),
        }
    }

    /// Restore identity from a serialized export, checking that the stored
    /// public key still matches the secrets.
    pub fn from_export(export: &IdentityExport) -> Result<Self, IdentityError> {
        let signing = decode_secret(&export.signing_secret)?;
        let exchange = decode_secret(&export.exchange_secret)?;
        let identity = Self::from_secret_bytes(&signing, &exchange);

        let stored = PublicKey::from_hex(&export.public_key)?;
        if stored != identity.public_key() {
            return Err(IdentityError::KeyMismatch);
        }
        Ok(identity)
    }

    /// The device address
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            signing: self.signing_key.verifying_key().to_bytes(),
            exchange: ExchangePublic::from(&self.exchange_secret).to_bytes(),
        }
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub(crate) fn exchange_secret(&self) -> &StaticSecret {
        &self.exchange_secret
    }

    /// Derive a database encryption key from the identity using BLAKE3
    pub fn derive_db_key(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_derive_key(crate::constants::KDF_CONTEXT_DB_KEY);
        hasher.update(self.signing_key.as_bytes());
        *hasher.finalize().as_bytes()
    }

    /// Export identity for serialization
    pub fn to_export(&self) -> IdentityExport {
        IdentityExport {
            signing_secret: hex::encode(self.signing_key.as_bytes()),
            exchange_secret: hex::encode(self.exchange_secret.to_bytes()),
            public_key: self.public_key().to_hex(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key().short())
            .finish_non_exhaustive()
    }
}

fn decode_secret(hex_str: &str) -> Result<[u8; 32], IdentityError> {
    let bytes = hex::decode(hex_str.trim()).map_err(|_| IdentityError::InvalidKeyBytes)?;
    bytes.try_into().map_err(|_| IdentityError::InvalidKeyBytes)
}

/// Verify an Ed25519 signature against the signing half of a public key
pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    signature: &[u8],
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(&public_key.signing).map_err(|_| IdentityError::InvalidKeyBytes)?;
    let signature = Signature::from_slice(signature).map_err(|_| IdentityError::InvalidKeyBytes)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| IdentityError::InvalidKeyBytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_generation() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_identity_roundtrip() {
        let id = Identity::generate();
        let export = id.to_export();
        let restored = Identity::from_export(&export).unwrap();
        assert_eq!(id.public_key(), restored.public_key());
    }

    #[test]
    fn test_export_with_foreign_public_key_is_rejected() {
        let id = Identity::generate();
        let mut export = id.to_export();
        export.public_key = Identity::generate().public_key().to_hex();
        assert_eq!(
            Identity::from_export(&export).unwrap_err(),
            IdentityError::KeyMismatch
        );
    }

    #[test]
    fn test_export_with_garbage_secret_is_rejected() {
        let id = Identity::generate();
        let mut export = id.to_export();
        export.signing_secret = "not hex".into();
        assert!(Identity::from_export(&export).is_err());
    }

    #[test]
    fn test_sign_verify() {
        let id = Identity::generate();
        let message = b"Hello, Murmur!";
        let signature = id.sign(message).to_bytes();

        assert!(verify_signature(&id.public_key(), message, &signature).is_ok());

        // Wrong message should fail
        assert!(verify_signature(&id.public_key(), b"wrong", &signature).is_err());

        // Truncated signature should fail
        assert!(verify_signature(&id.public_key(), message, &signature[..10]).is_err());
    }

    #[test]
    fn test_db_key_derivation_deterministic() {
        let id = Identity::generate();
        assert_eq!(id.derive_db_key(), id.derive_db_key());
        assert_ne!(id.derive_db_key(), Identity::generate().derive_db_key());
    }

    #[test]
    fn test_debug_does_not_leak_secrets() {
        let id = Identity::generate();
        let rendered = format!("{id:?}");
        assert!(!rendered.contains(&hex::encode(id.signing_key.as_bytes())));
    }
}
