//! # murmur-store
//!
//! Local persistence for the Murmur engine: the device identity file, the
//! contact directory and the append-only message log.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` with typed CRUD helpers, and async facades
//! (`ContactStore`, `MessageStore`) that share one handle behind a tokio
//! mutex. When built with the `sqlcipher` feature the database is encrypted
//! with a key derived from the identity.

pub mod contacts;
pub mod database;
pub mod keys;
pub mod messages;
pub mod migrations;

mod error;

pub use contacts::ContactStore;
pub use database::{Database, SharedDatabase};
pub use error::{Result, StoreError};
pub use keys::KeyManager;
pub use messages::{AppendOutcome, Conversation, MessageStore};
