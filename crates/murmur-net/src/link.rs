//! Bidirectional byte links and the connector seam.

use futures::future::BoxFuture;
use murmur_shared::types::PublicKey;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::NetError;

pub type LinkReader = Box<dyn AsyncRead + Send + Unpin>;
pub type LinkWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One open byte channel to a remote node, split into halves.
pub struct Link {
    pub reader: LinkReader,
    pub writer: LinkWriter,
    /// Human readable remote endpoint, for logs.
    pub remote: String,
}

impl Link {
    pub fn new(reader: LinkReader, writer: LinkWriter, remote: impl Into<String>) -> Self {
        Self {
            reader,
            writer,
            remote: remote.into(),
        }
    }

    pub fn from_stream<S>(stream: S, remote: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(Box::new(reader), Box::new(writer), remote)
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("remote", &self.remote).finish()
    }
}

/// Opens a byte channel to a peer identified by its public key.
pub trait PeerConnector: Send + Sync + 'static {
    fn connect(&self, peer: PublicKey) -> BoxFuture<'static, Result<Link, NetError>>;
}
