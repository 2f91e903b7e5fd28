//! TCP connector backed by an [`AddressBook`].

use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use murmur_shared::types::PublicKey;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::NetError;
use crate::link::{Link, PeerConnector};
use crate::peers::AddressBook;

#[derive(Clone, Default)]
pub struct TcpConnector {
    book: Arc<RwLock<AddressBook>>,
}

impl TcpConnector {
    pub fn new(book: AddressBook) -> Self {
        Self {
            book: Arc::new(RwLock::new(book)),
        }
    }

    pub async fn add_peer(&self, key: PublicKey, addr: SocketAddr) {
        self.book.write().await.insert(key, addr);
    }

    pub async fn remove_peer(&self, key: &PublicKey) {
        self.book.write().await.remove(key);
    }

    pub async fn address_of(&self, key: &PublicKey) -> Option<SocketAddr> {
        self.book.read().await.get(key)
    }
}

impl PeerConnector for TcpConnector {
    fn connect(&self, peer: PublicKey) -> BoxFuture<'static, Result<Link, NetError>> {
        let book = self.book.clone();
        async move {
            let addr = book
                .read()
                .await
                .get(&peer)
                .ok_or_else(|| NetError::Unreachable(peer.short()))?;

            debug!(peer = %peer.short(), addr = %addr, "dialing");
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Link::from_stream(stream, addr.to_string()))
        }
        .boxed()
    }
}
