//! The transport owns one channel per peer plus the inbound serving loops.
//!
//! Outbound traffic goes through per-peer [`ChannelHandle`] tasks. Inbound
//! links (from the TCP listener or the in-memory network) are served by a
//! receive loop that acks each data frame and forwards its payload to the
//! inbound queue handed out by [`Transport::new`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use murmur_shared::constants::{
    CONNECT_TIMEOUT_SECS, KEEPALIVE_SECS, RECONNECT_BASE_MS, RECONNECT_MAX_MS,
};
use murmur_shared::types::PublicKey;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ChannelHandle, ChannelQueue, ChannelState};
use crate::error::NetError;
use crate::frame::{read_frame, write_frame, LinkFrame};
use crate::link::{Link, PeerConnector};

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub keepalive_interval: Duration,
    pub connect_timeout: Duration,
    /// Capacity of the inbound payload, channel event and per-peer command
    /// queues.
    pub queue_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_millis(RECONNECT_BASE_MS),
            reconnect_max: Duration::from_millis(RECONNECT_MAX_MS),
            keepalive_interval: Duration::from_secs(KEEPALIVE_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            queue_capacity: 256,
        }
    }
}

/// Receiving ends produced alongside a [`Transport`].
pub struct TransportEvents {
    /// Payloads of acknowledged inbound data frames.
    pub inbound: mpsc::Receiver<Vec<u8>>,
    pub channels: mpsc::Receiver<ChannelEvent>,
}

pub struct Transport {
    connector: Arc<dyn PeerConnector>,
    config: TransportConfig,
    channels: Mutex<HashMap<PublicKey, ChannelHandle>>,
    acceptors: Mutex<Vec<JoinHandle<()>>>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    events_tx: mpsc::Sender<ChannelEvent>,
    shut_down: AtomicBool,
}

impl Transport {
    pub fn new(connector: Arc<dyn PeerConnector>, config: TransportConfig) -> (Self, TransportEvents) {
        let (inbound_tx, inbound) = mpsc::channel(config.queue_capacity);
        let (events_tx, channels) = mpsc::channel(config.queue_capacity);

        let transport = Self {
            connector,
            config,
            channels: Mutex::new(HashMap::new()),
            acceptors: Mutex::new(Vec::new()),
            inbound_tx,
            events_tx,
            shut_down: AtomicBool::new(false),
        };
        (transport, TransportEvents { inbound, channels })
    }

    /// Make sure a channel to `peer` exists and is (re)connecting.
    pub async fn open(&self, peer: &PublicKey) -> Result<watch::Receiver<ChannelState>, NetError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(NetError::TransportUnavailable);
        }
        let mut channels = self.channels.lock().await;
        let handle = channels.entry(*peer).or_insert_with(|| {
            debug!(peer = %peer.short(), "opening channel");
            ChannelHandle::spawn(
                *peer,
                self.connector.clone(),
                self.config.clone(),
                self.events_tx.clone(),
            )
        });
        Ok(handle.state())
    }

    pub async fn state(&self, peer: &PublicKey) -> ChannelState {
        self.channels
            .lock()
            .await
            .get(peer)
            .map(|handle| *handle.state().borrow())
            .unwrap_or(ChannelState::Disconnected)
    }

    /// Send `payload` to `peer`. Resolves once the remote transport has
    /// acknowledged the frame.
    pub async fn send(&self, peer: &PublicKey, payload: Vec<u8>) -> Result<(), NetError> {
        self.open(peer).await?;

        let queue = self.queue_for(peer).await.ok_or(NetError::Cancelled)?;
        let reply = queue.enqueue(payload).await?;
        reply.await.map_err(|_| NetError::Cancelled)?
    }

    /// Send `payload` without leaving a channel behind. An open channel to
    /// `peer` is reused; otherwise a link is dialled for this one frame and
    /// dropped once the remote acknowledges it.
    pub async fn send_transient(&self, peer: &PublicKey, payload: Vec<u8>) -> Result<(), NetError> {
        if self.is_shut_down() {
            return Err(NetError::TransportUnavailable);
        }
        if let Some(queue) = self.queue_for(peer).await {
            let reply = queue.enqueue(payload).await?;
            return reply.await.map_err(|_| NetError::Cancelled)?;
        }

        let limit = self.config.connect_timeout;
        let Link {
            mut reader,
            mut writer,
            remote,
        } = timeout(limit, self.connector.connect(*peer))
            .await
            .map_err(|_| NetError::Timeout)??;
        debug!(peer = %peer.short(), remote = %remote, "one-shot link");

        let exchange = async {
            write_frame(&mut writer, &LinkFrame::Data { id: 1, payload }).await?;
            while let Some(frame) = read_frame(&mut reader).await? {
                if matches!(frame, LinkFrame::Ack { id: 1 }) {
                    return Ok(());
                }
            }
            Err::<(), NetError>(NetError::TransportUnavailable)
        };
        timeout(limit, exchange).await.map_err(|_| NetError::Timeout)?
    }

    /// The map lock is released before anyone waits on the peer's queue.
    async fn queue_for(&self, peer: &PublicKey) -> Option<ChannelQueue> {
        self.channels.lock().await.get(peer).map(ChannelHandle::queue)
    }

    /// Stop the channel to `peer`. In-flight sends fail with `Cancelled`.
    pub async fn close(&self, peer: &PublicKey) -> bool {
        let handle = self.channels.lock().await.remove(peer);
        match handle {
            Some(handle) => {
                handle.close().await;
                info!(peer = %peer.short(), "channel closed");
                true
            }
            None => false,
        }
    }

    /// Close every channel and stop every inbound loop.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);

        let channels: Vec<_> = self.channels.lock().await.drain().collect();
        for (_, handle) in channels {
            handle.close().await;
        }
        for acceptor in self.acceptors.lock().await.drain(..) {
            acceptor.abort();
        }
        info!("transport shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Accept TCP connections on `addr`. Returns the bound address.
    pub async fn listen_tcp(&self, addr: SocketAddr) -> Result<SocketAddr, NetError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "listening for peers");

        let inbound = self.inbound_tx.clone();
        let keepalive = self.config.keepalive_interval;
        let task = tokio::spawn(async move {
            let mut links = JoinSet::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            let _ = stream.set_nodelay(true);
                            debug!(remote = %remote, "accepted peer link");
                            let link = Link::from_stream(stream, remote.to_string());
                            links.spawn(serve_link(link, inbound.clone(), keepalive));
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                    Some(_) = links.join_next(), if !links.is_empty() => {}
                }
            }
        });
        self.acceptors.lock().await.push(task);
        Ok(local)
    }

    /// Serve every link that arrives on `incoming`, e.g. from
    /// [`MemoryNetwork::listen`](crate::memory::MemoryNetwork::listen).
    pub async fn serve_incoming(&self, mut incoming: mpsc::Receiver<Link>) {
        let inbound = self.inbound_tx.clone();
        let keepalive = self.config.keepalive_interval;
        let task = tokio::spawn(async move {
            let mut links = JoinSet::new();
            loop {
                tokio::select! {
                    link = incoming.recv() => match link {
                        Some(link) => {
                            debug!(remote = %link.remote, "accepted peer link");
                            links.spawn(serve_link(link, inbound.clone(), keepalive));
                        }
                        None => break,
                    },
                    Some(_) = links.join_next(), if !links.is_empty() => {}
                }
            }
            while links.join_next().await.is_some() {}
        });
        self.acceptors.lock().await.push(task);
    }
}

/// Receive loop for one inbound link. Each data frame is forwarded to the
/// inbound queue, then acknowledged.
async fn serve_link(link: Link, inbound: mpsc::Sender<Vec<u8>>, keepalive: Duration) {
    let Link {
        mut reader,
        mut writer,
        remote,
    } = link;
    let silence_limit = keepalive * 3;

    loop {
        let frame = match timeout(silence_limit, read_frame(&mut reader)).await {
            Err(_) => {
                warn!(remote = %remote, "inbound link silent, closing");
                break;
            }
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                warn!(remote = %remote, error = %e, "inbound link failed");
                break;
            }
        };

        let reply = match frame {
            LinkFrame::Data { id, payload } => {
                if inbound.send(payload).await.is_err() {
                    break;
                }
                LinkFrame::Ack { id }
            }
            LinkFrame::Ping => LinkFrame::Pong,
            LinkFrame::Ack { .. } | LinkFrame::Pong => continue,
        };

        match timeout(silence_limit, write_frame(&mut writer, &reply)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(remote = %remote, error = %e, "inbound link write failed");
                break;
            }
            Err(_) => {
                warn!(remote = %remote, "inbound link stopped reading, closing");
                break;
            }
        }
    }
    debug!(remote = %remote, "inbound link closed");
}
