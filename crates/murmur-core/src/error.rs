use murmur_net::NetError;
use murmur_shared::error::{CodecError, CryptoError};
use murmur_store::StoreError;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced to callers of the messaging service.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Message content is empty")]
    EmptyContent,

    #[error("Invalid attachment: {0}")]
    InvalidAttachment(String),

    #[error("Unsupported message type: {0}")]
    UnsupportedType(String),

    #[error("Transport unavailable")]
    TransportUnavailable,

    /// Identity key material is missing or unreadable. Fatal.
    #[error("Key storage error: {0}")]
    KeyStorage(String),

    #[error("Public key already belongs to contact {0}")]
    DuplicateKey(Uuid),

    #[error("Not found")]
    NotFound,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Storage error: {0}")]
    Store(StoreError),

    #[error("Network error: {0}")]
    Net(NetError),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Self::NotFound,
            StoreError::DuplicateKey(owner) => Self::DuplicateKey(owner),
            StoreError::Validation(reason) => Self::Validation(reason),
            StoreError::KeyStorage(reason) => Self::KeyStorage(reason),
            other => Self::Store(other),
        }
    }
}

impl From<CodecError> for ServiceError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::InvalidAttachment(reason) => Self::InvalidAttachment(reason),
            CodecError::UnsupportedType(kind) => Self::UnsupportedType(kind),
            CodecError::Serialization(reason) => Self::Validation(reason),
        }
    }
}

impl From<NetError> for ServiceError {
    fn from(e: NetError) -> Self {
        match e {
            NetError::TransportUnavailable | NetError::Unreachable(_) | NetError::Timeout => {
                Self::TransportUnavailable
            }
            other => Self::Net(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
