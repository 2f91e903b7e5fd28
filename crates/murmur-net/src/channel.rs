//! Per-peer outbound channel.
//!
//! Each peer gets one task that owns the link to it. The task connects
//! through the [`PeerConnector`], keeps the link alive with pings, resolves
//! sends when the remote acknowledges them, and reconnects with backoff
//! after failures. Callers talk to it over an mpsc command queue and watch
//! its [`ChannelState`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use murmur_shared::types::PublicKey;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::NetError;
use crate::frame::{read_frame, write_frame, LinkFrame};
use crate::link::{Link, LinkWriter, PeerConnector};
use crate::transport::TransportConfig;

/// Missed keep-alive intervals after which a silent link is dead.
const DEAD_AFTER_INTERVALS: u32 = 3;

const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected(PublicKey),
    Disconnected(PublicKey),
}

impl ChannelEvent {
    pub fn peer(&self) -> &PublicKey {
        match self {
            Self::Connected(peer) | Self::Disconnected(peer) => peer,
        }
    }
}

type SendReply = oneshot::Sender<Result<(), NetError>>;

#[derive(Debug)]
pub(crate) enum ChannelCommand {
    Send { payload: Vec<u8>, reply: SendReply },
    Close,
}

/// Sending side of a channel's command queue. Cloned out of the transport's
/// map so a full queue never blocks other peers.
#[derive(Clone)]
pub(crate) struct ChannelQueue(mpsc::Sender<ChannelCommand>);

impl ChannelQueue {
    /// Queue a payload. The returned receiver resolves with the outcome.
    pub(crate) async fn enqueue(
        &self,
        payload: Vec<u8>,
    ) -> Result<oneshot::Receiver<Result<(), NetError>>, NetError> {
        let (reply, done) = oneshot::channel();
        self.0
            .send(ChannelCommand::Send { payload, reply })
            .await
            .map_err(|_| NetError::Cancelled)?;
        Ok(done)
    }
}

/// Owner's handle on a running channel task.
pub(crate) struct ChannelHandle {
    commands: mpsc::Sender<ChannelCommand>,
    state: watch::Receiver<ChannelState>,
    task: JoinHandle<()>,
}

impl ChannelHandle {
    pub(crate) fn spawn(
        peer: PublicKey,
        connector: Arc<dyn PeerConnector>,
        config: TransportConfig,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(config.queue_capacity);
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);

        let task = PeerChannel {
            peer,
            connector,
            config,
            commands: commands_rx,
            state: state_tx,
            events,
        };

        Self {
            commands: commands_tx,
            state: state_rx,
            task: tokio::spawn(task.run()),
        }
    }

    pub(crate) fn state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    pub(crate) fn queue(&self) -> ChannelQueue {
        ChannelQueue(self.commands.clone())
    }

    /// Stop the task. Pending sends fail with `Cancelled`.
    pub(crate) async fn close(mut self) {
        let _ = self.commands.try_send(ChannelCommand::Close);
        if timeout(CLOSE_GRACE, &mut self.task).await.is_err() {
            self.task.abort();
        }
    }
}

struct PeerChannel {
    peer: PublicKey,
    connector: Arc<dyn PeerConnector>,
    config: TransportConfig,
    commands: mpsc::Receiver<ChannelCommand>,
    state: watch::Sender<ChannelState>,
    events: mpsc::Sender<ChannelEvent>,
}

enum SessionEnd {
    Closed,
    Dropped,
}

impl PeerChannel {
    async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.reconnect_base, self.config.reconnect_max);

        loop {
            self.state.send_replace(ChannelState::Connecting);
            debug!(peer = %self.peer.short(), attempt = backoff.attempt(), "connecting");

            let (attempt, queued) = match self.connect().await {
                Some(result) => result,
                None => return self.finish(),
            };

            match attempt {
                Ok(link) => {
                    backoff.reset();
                    info!(peer = %self.peer.short(), remote = %link.remote, "channel connected");
                    self.state.send_replace(ChannelState::Connected);
                    let _ = self.events.send(ChannelEvent::Connected(self.peer)).await;

                    let end = self.session(link, queued).await;

                    self.state.send_replace(ChannelState::Disconnected);
                    let _ = self.events.send(ChannelEvent::Disconnected(self.peer)).await;
                    match end {
                        SessionEnd::Closed => return self.finish(),
                        SessionEnd::Dropped => {
                            warn!(peer = %self.peer.short(), "channel link dropped");
                        }
                    }
                }
                Err(e) => {
                    debug!(peer = %self.peer.short(), error = %e, "connect failed");
                    for (_, reply) in queued {
                        let _ = reply.send(Err(NetError::TransportUnavailable));
                    }
                }
            }

            self.state.send_replace(ChannelState::Disconnected);
            let delay = backoff.next_delay();
            debug!(peer = %self.peer.short(), delay_ms = delay.as_millis() as u64, "reconnecting after delay");
            if !self.wait_disconnected(delay).await {
                return self.finish();
            }
        }
    }

    fn finish(&self) {
        self.state.send_replace(ChannelState::Disconnected);
        debug!(peer = %self.peer.short(), "channel closed");
    }

    /// One connection attempt. Sends arriving meanwhile are queued for the
    /// new link. Returns `None` when the channel was closed.
    async fn connect(&mut self) -> Option<(Result<Link, NetError>, Vec<(Vec<u8>, SendReply)>)> {
        let attempt = timeout(self.config.connect_timeout, self.connector.connect(self.peer));
        tokio::pin!(attempt);
        let mut queued = Vec::new();

        loop {
            tokio::select! {
                result = &mut attempt => {
                    let result = result.unwrap_or(Err(NetError::Timeout));
                    return Some((result, queued));
                }
                cmd = self.commands.recv() => match cmd {
                    Some(ChannelCommand::Send { payload, reply }) => queued.push((payload, reply)),
                    Some(ChannelCommand::Close) | None => {
                        for (_, reply) in queued {
                            let _ = reply.send(Err(NetError::Cancelled));
                        }
                        return None;
                    }
                },
            }
        }
    }

    /// Sleep out the backoff delay, failing sends fast. Returns `false` when
    /// the channel was closed.
    async fn wait_disconnected(&mut self, delay: Duration) -> bool {
        let wake = sleep(delay);
        tokio::pin!(wake);

        loop {
            tokio::select! {
                _ = &mut wake => return true,
                cmd = self.commands.recv() => match cmd {
                    Some(ChannelCommand::Send { reply, .. }) => {
                        let _ = reply.send(Err(NetError::TransportUnavailable));
                    }
                    Some(ChannelCommand::Close) | None => return false,
                },
            }
        }
    }

    async fn session(&mut self, link: Link, queued: Vec<(Vec<u8>, SendReply)>) -> SessionEnd {
        let Link {
            mut reader, writer, ..
        } = link;

        let (frames_tx, frames_rx) = mpsc::channel(64);
        let peer = self.peer;
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        if frames_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(peer = %peer.short(), error = %e, "link read failed");
                        break;
                    }
                }
            }
        });

        let mut session = Session {
            writer,
            write_limit: self.config.keepalive_interval * DEAD_AFTER_INTERVALS,
            in_flight: HashMap::new(),
            next_id: 1,
        };
        let end = self.drive(&mut session, frames_rx, queued).await;
        reader_task.abort();

        let closed = matches!(end, SessionEnd::Closed);
        session.fail_all(|| {
            if closed {
                NetError::Cancelled
            } else {
                NetError::TransportUnavailable
            }
        });
        end
    }

    async fn drive(
        &mut self,
        session: &mut Session,
        mut frames: mpsc::Receiver<LinkFrame>,
        queued: Vec<(Vec<u8>, SendReply)>,
    ) -> SessionEnd {
        for (payload, reply) in queued {
            if !session.send_data(payload, reply).await {
                return SessionEnd::Dropped;
            }
        }

        let interval = self.config.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + interval, interval);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(ChannelCommand::Send { payload, reply }) => {
                        if !session.send_data(payload, reply).await {
                            return SessionEnd::Dropped;
                        }
                    }
                    Some(ChannelCommand::Close) | None => return SessionEnd::Closed,
                },
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        return SessionEnd::Dropped;
                    };
                    last_inbound = Instant::now();
                    match frame {
                        LinkFrame::Ack { id } => session.acknowledge(id),
                        LinkFrame::Ping => {
                            if session.write(&LinkFrame::Pong).await.is_err() {
                                return SessionEnd::Dropped;
                            }
                        }
                        LinkFrame::Pong => {}
                        LinkFrame::Data { id, .. } => {
                            debug!(peer = %self.peer.short(), id, "ignoring data on outbound link");
                        }
                    }
                }
                _ = keepalive.tick() => {
                    if last_inbound.elapsed() >= interval * DEAD_AFTER_INTERVALS {
                        warn!(peer = %self.peer.short(), "link silent, closing");
                        return SessionEnd::Dropped;
                    }
                    if session.write(&LinkFrame::Ping).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }
            }
        }
    }
}

struct Session {
    writer: LinkWriter,
    /// A write stuck for this long means the peer stopped reading.
    write_limit: Duration,
    in_flight: HashMap<u64, SendReply>,
    next_id: u64,
}

impl Session {
    async fn write(&mut self, frame: &LinkFrame) -> Result<(), NetError> {
        timeout(self.write_limit, write_frame(&mut self.writer, frame))
            .await
            .map_err(|_| NetError::Timeout)?
    }

    /// Write a data frame. Returns `false` when the link is unusable; the
    /// reply has already been failed.
    async fn send_data(&mut self, payload: Vec<u8>, reply: SendReply) -> bool {
        let id = self.next_id;
        self.next_id += 1;

        match self.write(&LinkFrame::Data { id, payload }).await {
            Ok(()) => {
                self.in_flight.insert(id, reply);
                true
            }
            Err(NetError::FrameTooLarge(size)) => {
                let _ = reply.send(Err(NetError::FrameTooLarge(size)));
                true
            }
            Err(e) => {
                debug!(id, error = %e, "link write failed");
                let _ = reply.send(Err(NetError::TransportUnavailable));
                false
            }
        }
    }

    fn acknowledge(&mut self, id: u64) {
        if let Some(reply) = self.in_flight.remove(&id) {
            let _ = reply.send(Ok(()));
        }
    }

    fn fail_all(&mut self, error: impl Fn() -> NetError) {
        for (_, reply) in self.in_flight.drain() {
            let _ = reply.send(Err(error()));
        }
    }
}
