//! Peer address book.
//!
//! Maps a peer's public key to the socket address its node listens on.
//! Entries come from a peers file or are added at runtime.

use std::collections::HashMap;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use murmur_shared::types::PublicKey;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    entries: HashMap<PublicKey, SocketAddr>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load entries from a peers file.
    ///
    /// One `<hex public key> <host:port>` pair per line. Empty lines and
    /// lines starting with `#` are ignored; malformed lines are logged and
    /// skipped. A missing file yields an empty book.
    ///
    /// ```text
    /// # alice's laptop
    /// 3f9c...e1 192.168.1.20:4101
    /// ```
    pub fn load(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read peers file");
                return Self::new();
            }
        };

        let book = Self::parse(&content);
        info!(count = book.len(), path = %path.display(), "Loaded peer addresses");
        book
    }

    pub fn parse(content: &str) -> Self {
        let mut book = Self::new();
        for line in content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
        {
            match parse_entry(line) {
                Some((key, addr)) => {
                    debug!(peer = %key.short(), addr = %addr, "Loaded peer address");
                    book.insert(key, addr);
                }
                None => warn!(line = %line, "Skipping invalid peer entry"),
            }
        }
        book
    }

    pub fn insert(&mut self, key: PublicKey, addr: SocketAddr) -> Option<SocketAddr> {
        self.entries.insert(key, addr)
    }

    pub fn remove(&mut self, key: &PublicKey) -> Option<SocketAddr> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &PublicKey) -> Option<SocketAddr> {
        self.entries.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn peers(&self) -> Vec<PublicKey> {
        self.entries.keys().copied().collect()
    }
}

fn parse_entry(line: &str) -> Option<(PublicKey, SocketAddr)> {
    let mut parts = line.split_whitespace();
    let key = parts.next()?.parse::<PublicKey>().ok()?;
    let addr = parse_addr(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some((key, addr))
}

/// Parse `host:port`, resolving host names.
pub fn parse_addr(raw: &str) -> Option<SocketAddr> {
    raw.parse::<SocketAddr>()
        .ok()
        .or_else(|| raw.to_socket_addrs().ok()?.next())
}
