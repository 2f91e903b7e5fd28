//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation.
//!
//! Note: SQLCipher (encrypted SQLite) requires OpenSSL at build time and is
//! behind the `sqlcipher` feature. Without it the database is plain SQLite;
//! message bodies at rest are then protected only by the filesystem.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use directories::ProjectDirs;
use murmur_shared::types::PublicKey;
use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::error::{Result, StoreError};
use crate::migrations;

/// One connection shared by every async store facade.
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// The platform-appropriate data directory:
    /// - Linux:   `~/.local/share/murmur`
    /// - macOS:   `~/Library/Application Support/org.murmur.murmur`
    /// - Windows: `{FOLDERID_RoamingAppData}\murmur\murmur\data`
    pub fn default_data_dir() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("org", "murmur", "murmur").ok_or(StoreError::NoDataDir)?;
        Ok(project_dirs.data_dir().to_path_buf())
    }

    /// Path of the database belonging to `owner` under `data_dir`. All
    /// persisted state is rooted at the local public key.
    pub fn path_for(data_dir: &Path, owner: &PublicKey) -> PathBuf {
        data_dir.join(&owner.to_hex()[..16]).join("murmur.db")
    }

    /// Open (or create) the database for `owner` under `data_dir`.
    pub fn open_for(data_dir: &Path, owner: &PublicKey, db_key: &[u8; 32]) -> Result<Self> {
        let db_path = Self::path_for(data_dir, owner);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %db_path.display(), owner = %owner.short(), "opening database");

        Self::open_at(&db_path, db_key)
    }

    /// Open (or create) a database at an explicit path.
    ///
    /// This is useful for tests and for embedding the store inside custom
    /// directory layouts.
    pub fn open_at(path: &Path, db_key: &[u8; 32]) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, db_key)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, &[0u8; 32])
    }

    fn init(conn: Connection, db_key: &[u8; 32]) -> Result<Self> {
        #[cfg(feature = "sqlcipher")]
        conn.execute_batch(&format!("PRAGMA key = \"x'{}'\";", hex::encode(db_key)))?;
        #[cfg(not(feature = "sqlcipher"))]
        let _ = db_key;

        // Recommended SQLite settings.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Run schema migrations.
        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// Wrap the database for sharing between async facades.
    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return a mutable reference to the underlying connection.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}

/// Map a parse failure inside a row to a rusqlite conversion error.
pub(crate) fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}
