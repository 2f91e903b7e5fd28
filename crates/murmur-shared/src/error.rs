use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Envelope signature is invalid")]
    SignatureInvalid,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Stored public key does not match the secret key")]
    KeyMismatch,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid attachment: {0}")]
    InvalidAttachment(String),

    #[error("Unsupported message type: {0}")]
    UnsupportedType(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
