//! The messaging service: one instance owns the identity, the store, the
//! transport and every background task, and is the single entry point for
//! sending, receiving and directory changes.

mod contacts;
mod ingest;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use murmur_net::{ChannelEvent, ChannelState, Link, PeerConnector, Transport, TransportEvents};
use murmur_shared::constants::MAX_TEXT_SIZE;
use murmur_shared::protocol::{MessagePayload, Payload, ReceiptPayload};
use murmur_shared::types::timestamp_now;
use murmur_shared::{CryptoEngine, Message, MessageCodec, MessageStatus, MessageType, PublicKey};
use murmur_store::{ContactStore, Conversation, Database, KeyManager, MessageStore};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Result, ServiceError};
use crate::events::{EventBus, EventReceiver, MessagingEvent};
use crate::locks::KeyedLocks;
use crate::reorder::ReorderBuffer;
use crate::tasks::TaskSet;

pub use contacts::ContactDraft;
pub use ingest::{DropReason, IngestOutcome};

/// Handle to a running messaging engine. Cheap to clone; every clone
/// drives the same engine.
#[derive(Clone)]
pub struct MessagingService {
    inner: Arc<Inner>,
}

struct Inner {
    config: EngineConfig,
    local: PublicKey,
    crypto: CryptoEngine,
    codec: MessageCodec,
    keys: KeyManager,
    contacts: ContactStore,
    messages: MessageStore,
    transport: Transport,
    events: EventBus,
    /// Serializes message log writes per conversation peer.
    peer_locks: KeyedLocks<PublicKey>,
    /// Serializes directory writes per contact key.
    contact_locks: KeyedLocks<PublicKey>,
    reorder: Mutex<ReorderBuffer<Message>>,
    /// Transmissions and receipts in flight.
    outbound: TaskSet,
    background: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl MessagingService {
    /// Load (or create) the local identity, open its database, build the
    /// transport and start the inbound and channel event loops.
    pub async fn start(config: EngineConfig, connector: Arc<dyn PeerConnector>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|e| ServiceError::KeyStorage(format!("cannot create data dir: {e}")))?;

        let keys = KeyManager::in_dir(&config.data_dir);
        let identity = keys.get_or_create_identity().await?;
        let local = identity.public_key();

        let db = Database::open_for(&config.data_dir, &local, &identity.derive_db_key())?
            .into_shared();
        let (transport, transport_events) = Transport::new(connector, config.transport_config());

        let inner = Arc::new(Inner {
            crypto: CryptoEngine::new(identity).with_hybrid_threshold(config.hybrid_threshold),
            codec: MessageCodec::new(config.max_attachment_bytes),
            keys,
            contacts: ContactStore::new(db.clone()),
            messages: MessageStore::new(db),
            transport,
            events: EventBus::new(config.event_capacity),
            peer_locks: KeyedLocks::new(),
            contact_locks: KeyedLocks::new(),
            reorder: Mutex::new(ReorderBuffer::new(config.reorder_wait)),
            outbound: TaskSet::new(),
            background: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            local,
            config,
        });
        let service = Self { inner };

        let TransportEvents { inbound, channels } = transport_events;
        let ingest = tokio::spawn(service.clone().ingest_loop(inbound));
        let links = tokio::spawn(service.clone().channel_loop(channels));
        service.inner.background.lock().await.extend([ingest, links]);

        let contacts = service.inner.contacts.list().await?;
        for contact in &contacts {
            service.inner.transport.open(&contact.public_key).await?;
        }

        info!(
            pubkey = %local.short(),
            contacts = contacts.len(),
            "messaging service started"
        );
        Ok(service)
    }

    pub fn local_key(&self) -> PublicKey {
        self.inner.local
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn key_manager(&self) -> &KeyManager {
        &self.inner.keys
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Accept peer links over TCP. Returns the bound address.
    pub async fn listen_tcp(&self, addr: SocketAddr) -> Result<SocketAddr> {
        Ok(self.inner.transport.listen_tcp(addr).await?)
    }

    /// Serve links handed over by an in-process connector.
    pub async fn serve_incoming(&self, incoming: mpsc::Receiver<Link>) {
        self.inner.transport.serve_incoming(incoming).await;
    }

    pub async fn channel_state(&self, peer: &PublicKey) -> ChannelState {
        self.inner.transport.state(peer).await
    }

    // ---- sending ----

    /// Record a text message for `recipient` at `sent` and hand it to the
    /// transport in the background.
    pub async fn send_message(&self, text: &str, recipient: &PublicKey) -> Result<Message> {
        self.ensure_running()?;
        if text.trim().is_empty() {
            return Err(ServiceError::EmptyContent);
        }
        if text.len() > MAX_TEXT_SIZE {
            return Err(ServiceError::Validation(format!(
                "text is {} bytes, limit is {MAX_TEXT_SIZE}",
                text.len()
            )));
        }
        self.compose(MessageType::Text, text.to_string(), recipient).await
    }

    /// Like [`send_message`](Self::send_message) for base64 attachment
    /// content. Type and size are checked before anything is recorded.
    pub async fn send_media_message(
        &self,
        encoded: &str,
        kind: MessageType,
        recipient: &PublicKey,
    ) -> Result<Message> {
        self.ensure_running()?;
        if encoded.trim().is_empty() {
            return Err(ServiceError::EmptyContent);
        }
        self.inner.codec.validate_media(kind, encoded)?;
        self.compose(kind, encoded.trim().to_string(), recipient).await
    }

    async fn compose(&self, kind: MessageType, content: String, recipient: &PublicKey) -> Result<Message> {
        let inner = &self.inner;
        if *recipient == inner.local {
            return Err(ServiceError::Validation("cannot message the local identity".into()));
        }
        let fingerprint = MessageCodec::content_fingerprint(kind, &content)?;

        let message = {
            let _guard = inner.peer_locks.lock(recipient).await;
            let sequence = inner.messages.next_sequence(recipient).await?;
            let message = Message {
                id: Uuid::new_v4(),
                sender_id: inner.local,
                receiver_id: *recipient,
                kind,
                content,
                timestamp: timestamp_now(),
                status: MessageStatus::Sent,
                sequence,
                fingerprint,
            };
            inner.messages.append(&message).await?;
            message
        };

        info!(
            msg_id = %message.id,
            peer = %recipient.short(),
            kind = %kind,
            seq = message.sequence,
            "message recorded"
        );
        inner.events.publish(MessagingEvent::MessageAdded(message.clone()));

        let service = self.clone();
        let outgoing = message.clone();
        inner
            .outbound
            .spawn(async move {
                if let Err(e) = service.transmit(&outgoing).await {
                    service.defer(&outgoing, &e);
                }
            })
            .await;

        Ok(message)
    }

    /// Retransmit every outbound message to `peer` still at `sent`, in
    /// sequence order. Stops at the first transport failure. Returns the
    /// number of messages queued for retransmission.
    pub async fn retry_pending(&self, peer: &PublicKey) -> Result<usize> {
        self.ensure_running()?;
        let pending = self
            .inner
            .messages
            .pending_outbound(&self.inner.local, peer)
            .await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let count = pending.len();
        debug!(peer = %peer.short(), count, "retransmitting pending messages");

        let service = self.clone();
        self.inner
            .outbound
            .spawn(async move {
                for message in &pending {
                    if let Err(e) = service.transmit(message).await {
                        service.defer(message, &e);
                        break;
                    }
                }
            })
            .await;
        Ok(count)
    }

    async fn transmit(&self, message: &Message) -> Result<()> {
        let payload = Payload::Message(MessagePayload {
            id: message.id,
            kind: message.kind,
            content: message.content.clone(),
            timestamp: message.timestamp,
            sequence: message.sequence,
            fingerprint: message.fingerprint,
        });
        let bytes = self.seal(&message.receiver_id, &payload)?;
        self.inner.transport.send(&message.receiver_id, bytes).await?;
        debug!(msg_id = %message.id, peer = %message.receiver_id.short(), "message handed over");
        Ok(())
    }

    fn defer(&self, message: &Message, error: &ServiceError) {
        warn!(
            msg_id = %message.id,
            peer = %message.receiver_id.short(),
            error = %error,
            "delivery deferred"
        );
        self.inner.events.publish(MessagingEvent::DeliveryDeferred {
            message_id: message.id,
            peer: message.receiver_id,
            reason: error.to_string(),
        });
    }

    /// Send a delivery or read receipt for `message_id` to `peer` in the
    /// background. Best effort; skipped once shut down.
    async fn send_receipt(&self, peer: PublicKey, message_id: Uuid, status: MessageStatus) {
        if self.is_shut_down() {
            return;
        }
        let service = self.clone();
        self.inner
            .outbound
            .spawn(async move {
                let payload = Payload::Receipt(ReceiptPayload { message_id, status });
                // Receipts never leave a reconnecting channel behind for
                // peers outside the directory.
                let sent = match service.seal(&peer, &payload) {
                    Ok(bytes) => service
                        .inner
                        .transport
                        .send_transient(&peer, bytes)
                        .await
                        .map_err(ServiceError::from),
                    Err(e) => Err(e),
                };
                match sent {
                    Ok(()) => debug!(msg_id = %message_id, peer = %peer.short(), %status, "receipt sent"),
                    Err(e) => debug!(
                        msg_id = %message_id,
                        peer = %peer.short(),
                        error = %e,
                        "receipt not sent"
                    ),
                }
            })
            .await;
    }

    fn seal(&self, recipient: &PublicKey, payload: &Payload) -> Result<Vec<u8>> {
        let inner = &self.inner;
        let plaintext = inner.codec.build_envelope_plaintext(payload)?;
        let envelope =
            inner
                .crypto
                .encrypt_for(recipient, payload.type_tag(), payload.sequence(), &plaintext)?;
        envelope
            .to_bytes()
            .map_err(|e| ServiceError::Validation(format!("envelope encoding: {e}")))
    }

    // ---- reading ----

    /// The conversation between `local` and `peer`, oldest first.
    pub fn filter_conversation(&self, local: &PublicKey, peer: &PublicKey) -> Conversation {
        self.inner.messages.conversation(local, peer)
    }

    /// Mark everything `peer` delivered to us as read, send read receipts,
    /// and return the conversation.
    pub async fn open_conversation(&self, peer: &PublicKey) -> Result<Conversation> {
        let inner = &self.inner;
        let unread = {
            let _guard = inner.peer_locks.lock(peer).await;
            let unread = inner.messages.unread_inbound(&inner.local, peer).await?;
            let mut changed = Vec::with_capacity(unread.len());
            for message in unread {
                if inner.messages.mark_read(message.id).await? {
                    changed.push(message.id);
                }
            }
            changed
        };

        if !unread.is_empty() {
            debug!(peer = %peer.short(), count = unread.len(), "conversation read");
        }
        for message_id in unread {
            self.status_changed(message_id, *peer, MessageStatus::Read);
            self.send_receipt(*peer, message_id, MessageStatus::Read).await;
        }
        Ok(inner.messages.conversation(&inner.local, peer))
    }

    /// Mark one message read. Inbound messages also get a read receipt.
    /// Returns whether the status changed.
    pub async fn mark_read(&self, id: Uuid) -> Result<bool> {
        let inner = &self.inner;
        let message = inner.messages.get(id).await?;
        let peer = message.peer_of(&inner.local);

        let changed = {
            let _guard = inner.peer_locks.lock(&peer).await;
            inner.messages.mark_read(id).await?
        };
        if changed {
            self.status_changed(id, peer, MessageStatus::Read);
            if !message.is_outbound(&inner.local) {
                self.send_receipt(peer, id, MessageStatus::Read).await;
            }
        }
        Ok(changed)
    }

    fn status_changed(&self, message_id: Uuid, peer: PublicKey, status: MessageStatus) {
        self.inner.events.publish(MessagingEvent::StatusChanged {
            message_id,
            peer,
            status,
        });
    }

    // ---- lifecycle ----

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(ServiceError::TransportUnavailable);
        }
        Ok(())
    }

    async fn channel_loop(self, mut channels: mpsc::Receiver<ChannelEvent>) {
        while let Some(event) = channels.recv().await {
            match event {
                ChannelEvent::Connected(peer) => {
                    info!(peer = %peer.short(), "peer connected");
                    self.inner.events.publish(MessagingEvent::PeerConnection {
                        peer,
                        connected: true,
                    });
                    if let Err(e) = self.retry_pending(&peer).await {
                        warn!(peer = %peer.short(), error = %e, "retransmission failed");
                    }
                }
                ChannelEvent::Disconnected(peer) => {
                    info!(peer = %peer.short(), "peer disconnected");
                    self.inner.events.publish(MessagingEvent::PeerConnection {
                        peer,
                        connected: false,
                    });
                }
            }
        }
        debug!("channel event loop ended");
    }

    /// Stop everything. Buffered inbound messages are stored without
    /// receipts; outbound messages not yet delivered stay at `sent`.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        for task in inner.background.lock().await.drain(..) {
            task.abort();
        }

        let held = inner.reorder.lock().await.drain_all();
        for (sender, messages) in held {
            let _guard = inner.peer_locks.lock(&sender).await;
            self.deliver_inbound(messages).await;
        }

        inner.transport.shutdown().await;
        inner.outbound.abort_all().await;
        info!(pubkey = %inner.local.short(), "messaging service stopped");
    }

    /// Interval of the reorder flush ticker.
    fn reorder_tick(&self) -> Duration {
        (self.inner.config.reorder_wait / 4).clamp(Duration::from_millis(10), Duration::from_millis(500))
    }
}
