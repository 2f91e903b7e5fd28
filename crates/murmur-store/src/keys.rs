//! Device identity persistence.
//!
//! The identity lives in a small JSON file next to the per-identity
//! database directory. It is created exactly once. If the file exists but
//! cannot be read or parsed, loading fails with [`StoreError::KeyStorage`]
//! instead of generating a replacement, because a new key would orphan every
//! contact that knows this device by its current address.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use murmur_shared::identity::IdentityExport;
use murmur_shared::types::PublicKey;
use murmur_shared::Identity;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::error::{Result, StoreError};

pub const IDENTITY_FILE_NAME: &str = "identity.json";

pub struct KeyManager {
    path: PathBuf,
    identity: OnceCell<Identity>,
}

impl KeyManager {
    /// Manage the identity file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            identity: OnceCell::new(),
        }
    }

    /// Manage `identity.json` inside `data_dir`.
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(IDENTITY_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted identity, or generate and persist a new one.
    /// Idempotent; concurrent callers observe the same identity.
    pub async fn get_or_create_identity(&self) -> Result<Identity> {
        self.identity
            .get_or_try_init(|| self.load_or_generate())
            .await
            .cloned()
    }

    /// Public key of the loaded identity.
    pub fn public_key(&self) -> Result<PublicKey> {
        self.identity
            .get()
            .map(Identity::public_key)
            .ok_or_else(|| StoreError::KeyStorage("identity not loaded".into()))
    }

    async fn load_or_generate(&self) -> Result<Identity> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => {
                let export: IdentityExport = serde_json::from_str(&text).map_err(|e| {
                    warn!(path = %self.path.display(), error = %e, "identity file is corrupt");
                    StoreError::KeyStorage(format!("unreadable identity file: {e}"))
                })?;
                let identity = Identity::from_export(&export)
                    .map_err(|e| StoreError::KeyStorage(format!("invalid identity: {e}")))?;
                info!(pubkey = %identity.public_key().short(), "Loaded identity");
                Ok(identity)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let identity = Identity::generate();
                self.persist(&identity).await?;
                info!(pubkey = %identity.public_key().short(), "Created new identity");
                Ok(identity)
            }
            Err(e) => Err(StoreError::KeyStorage(format!(
                "cannot read {}: {e}",
                self.path.display()
            ))),
        }
    }

    // Write to a sibling temp file, fsync, then rename into place.
    async fn persist(&self, identity: &Identity) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(&identity.to_export())
            .map_err(|e| StoreError::KeyStorage(e.to_string()))?;
        let tmp_path = self.path.with_extension("json.tmp");

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&tmp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}
