//! In-process network for tests and embedding: links are tokio duplex pipes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use murmur_shared::types::PublicKey;
use tokio::sync::{mpsc, Mutex};

use crate::error::NetError;
use crate::link::{Link, PeerConnector};

const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Default)]
struct Registry {
    listeners: HashMap<PublicKey, mpsc::Sender<Link>>,
    unreachable: HashSet<PublicKey>,
}

/// A switchboard of in-process nodes keyed by public key.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    registry: Arc<Mutex<Registry>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` as reachable and return the queue its inbound links
    /// arrive on. Replaces any previous registration.
    pub async fn listen(&self, key: PublicKey) -> mpsc::Receiver<Link> {
        let (tx, rx) = mpsc::channel(16);
        self.registry.lock().await.listeners.insert(key, tx);
        rx
    }

    /// Simulate a peer going offline (`false`) or coming back (`true`).
    /// Only affects new connection attempts.
    pub async fn set_reachable(&self, key: PublicKey, reachable: bool) {
        let mut registry = self.registry.lock().await;
        if reachable {
            registry.unreachable.remove(&key);
        } else {
            registry.unreachable.insert(key);
        }
    }

    /// A connector that dials through this network.
    pub fn connector(&self) -> Arc<dyn PeerConnector> {
        Arc::new(self.clone())
    }

    async fn dial(self, peer: PublicKey) -> Result<Link, NetError> {
        let listener = {
            let registry = self.registry.lock().await;
            if registry.unreachable.contains(&peer) {
                return Err(NetError::Unreachable(peer.short()));
            }
            registry
                .listeners
                .get(&peer)
                .cloned()
                .ok_or_else(|| NetError::Unreachable(peer.short()))?
        };

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        listener
            .send(Link::from_stream(far, "memory"))
            .await
            .map_err(|_| NetError::Unreachable(peer.short()))?;

        Ok(Link::from_stream(near, format!("memory:{}", peer.short())))
    }
}

impl PeerConnector for MemoryNetwork {
    fn connect(&self, peer: PublicKey) -> BoxFuture<'static, Result<Link, NetError>> {
        self.clone().dial(peer).boxed()
    }
}
