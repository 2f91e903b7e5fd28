use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite / SQLCipher error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// The public key is already registered to another contact.
    #[error("Public key already belongs to contact {0}")]
    DuplicateKey(uuid::Uuid),

    /// A record failed validation before it reached the database.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Persisted key material is missing, unreadable or inconsistent.
    /// Fatal: the identity is never regenerated over it.
    #[error("Key storage error: {0}")]
    KeyStorage(String),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
