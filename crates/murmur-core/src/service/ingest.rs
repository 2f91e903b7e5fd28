//! Inbound path: envelope bytes from the transport become stored messages,
//! status updates, or a logged drop.

use murmur_shared::constants::PROTOCOL_VERSION;
use murmur_shared::protocol::{MessagePayload, ReceiptPayload, UNSEQUENCED};
use murmur_shared::{Envelope, Message, MessageStatus, Payload, PublicKey};
use murmur_store::StoreError;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::MessagingService;
use crate::events::MessagingEvent;
use crate::reorder::OutOfWindow;

/// What happened to one inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Messages appended at `delivered`, in sequence order. May include
    /// earlier messages that were waiting on this one.
    Delivered(Vec<Message>),
    /// Held back until a sequence gap fills or times out.
    Buffered,
    /// Already stored; a fresh receipt was sent.
    Duplicate(Uuid),
    StatusUpdated {
        message_id: Uuid,
        status: MessageStatus,
        changed: bool,
    },
    Dropped(DropReason),
}

/// Why an inbound envelope was discarded. Nothing is stored for a drop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    #[error("malformed envelope")]
    Malformed,

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("crypto: {0}")]
    Crypto(String),

    #[error("codec: {0}")]
    Codec(String),

    #[error("envelope and payload sequence numbers disagree")]
    SequenceMismatch,

    #[error("sequence {sequence} is too far ahead of expected {expected}")]
    SequenceOutOfWindow { expected: u64, sequence: u64 },

    #[error("message id {0} belongs to another conversation")]
    IdConflict(Uuid),

    #[error("receipt for unknown message {0}")]
    UnknownMessage(Uuid),

    #[error("receipt for {0} did not come from its recipient")]
    ReceiptMismatch(Uuid),

    #[error("storage: {0}")]
    Storage(String),

    #[error("service is shut down")]
    ShutDown,
}

impl IngestOutcome {
    fn dropped(sender: Option<&PublicKey>, reason: DropReason) -> Self {
        match sender {
            Some(sender) => warn!(peer = %sender.short(), reason = %reason, "inbound envelope dropped"),
            None => warn!(reason = %reason, "inbound envelope dropped"),
        }
        Self::Dropped(reason)
    }
}

impl From<StoreError> for DropReason {
    fn from(e: StoreError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl MessagingService {
    /// Process one envelope as received from the transport. Never fails:
    /// anything that cannot be accepted is logged and reported as
    /// [`IngestOutcome::Dropped`].
    pub async fn on_envelope_received(&self, raw: &[u8]) -> IngestOutcome {
        if self.is_shut_down() {
            return IngestOutcome::dropped(None, DropReason::ShutDown);
        }

        let envelope = match Envelope::from_bytes(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, len = raw.len(), "envelope decode failed");
                return IngestOutcome::dropped(None, DropReason::Malformed);
            }
        };
        let sender = envelope.sender;
        if envelope.version != PROTOCOL_VERSION {
            return IngestOutcome::dropped(Some(&sender), DropReason::UnsupportedVersion(envelope.version));
        }

        let plaintext = match self.inner.crypto.decrypt(&envelope) {
            Ok(plaintext) => plaintext,
            Err(e) => return IngestOutcome::dropped(Some(&sender), DropReason::Crypto(e.to_string())),
        };
        let payload = match self
            .inner
            .codec
            .parse_envelope_plaintext(envelope.type_tag, &plaintext)
        {
            Ok(payload) => payload,
            Err(e) => return IngestOutcome::dropped(Some(&sender), DropReason::Codec(e.to_string())),
        };

        if envelope.sequence != payload.sequence() {
            return IngestOutcome::dropped(Some(&sender), DropReason::SequenceMismatch);
        }

        let outcome = match payload {
            Payload::Receipt(receipt) => self.apply_receipt(sender, receipt).await,
            Payload::Message(message) => self.accept_message(sender, message).await,
        };
        match outcome {
            Ok(outcome) => outcome,
            Err(reason) => IngestOutcome::dropped(Some(&sender), reason),
        }
    }

    async fn apply_receipt(
        &self,
        sender: PublicKey,
        receipt: ReceiptPayload,
    ) -> Result<IngestOutcome, DropReason> {
        let inner = &self.inner;
        let ReceiptPayload { message_id, status } = receipt;

        let _guard = inner.peer_locks.lock(&sender).await;
        let original = match inner.messages.get(message_id).await {
            Ok(message) => message,
            Err(StoreError::NotFound) => return Err(DropReason::UnknownMessage(message_id)),
            Err(e) => return Err(e.into()),
        };
        // Only the recipient of one of our messages may move its status.
        if original.receiver_id != sender || original.sender_id != inner.local {
            return Err(DropReason::ReceiptMismatch(message_id));
        }

        let changed = inner.messages.advance_status(message_id, status).await?.is_some();
        if changed {
            debug!(msg_id = %message_id, peer = %sender.short(), %status, "status advanced");
            self.status_changed(message_id, sender, status);
        }
        Ok(IngestOutcome::StatusUpdated {
            message_id,
            status,
            changed,
        })
    }

    async fn accept_message(
        &self,
        sender: PublicKey,
        payload: MessagePayload,
    ) -> Result<IngestOutcome, DropReason> {
        let inner = &self.inner;
        if payload.sequence == UNSEQUENCED {
            return Err(DropReason::SequenceMismatch);
        }

        let _guard = inner.peer_locks.lock(&sender).await;

        match inner.messages.get(payload.id).await {
            Ok(stored) if stored.sender_id == sender => {
                debug!(msg_id = %payload.id, peer = %sender.short(), "duplicate message");
                let status = stored.status.max(MessageStatus::Delivered);
                self.send_receipt(sender, payload.id, status).await;
                return Ok(IngestOutcome::Duplicate(payload.id));
            }
            Ok(_) => return Err(DropReason::IdConflict(payload.id)),
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let message = Message {
            id: payload.id,
            sender_id: sender,
            receiver_id: inner.local,
            kind: payload.kind,
            content: payload.content,
            timestamp: payload.timestamp,
            status: MessageStatus::Delivered,
            sequence: payload.sequence,
            fingerprint: payload.fingerprint,
        };

        let seed = if inner.reorder.lock().await.knows(&sender) {
            None
        } else {
            Some(
                inner
                    .messages
                    .last_sequence(&sender, &inner.local)
                    .await?
                    .saturating_add(1),
            )
        };

        let ready = {
            let mut reorder = inner.reorder.lock().await;
            if let Some(next) = seed {
                reorder.track(sender, next);
            }
            reorder
                .push(sender, message.sequence, message, Instant::now())
                .map_err(|OutOfWindow { expected, sequence }| {
                    DropReason::SequenceOutOfWindow { expected, sequence }
                })?
        };

        if ready.is_empty() {
            debug!(peer = %sender.short(), seq = payload.sequence, "message held for reordering");
            return Ok(IngestOutcome::Buffered);
        }
        Ok(IngestOutcome::Delivered(self.deliver_inbound(ready).await))
    }

    /// Append released messages and acknowledge them. The caller holds the
    /// sender's peer lock.
    pub(super) async fn deliver_inbound(&self, messages: Vec<Message>) -> Vec<Message> {
        let inner = &self.inner;
        let mut delivered = Vec::with_capacity(messages.len());

        for message in messages {
            let sender = message.sender_id;
            match inner.messages.append(&message).await {
                Ok(outcome) if outcome.is_new() => {
                    let known_contact = matches!(inner.contacts.find_by_key(&sender).await, Ok(Some(_)));
                    info!(
                        msg_id = %message.id,
                        peer = %sender.short(),
                        seq = message.sequence,
                        known_contact,
                        "message received"
                    );
                    inner.events.publish(MessagingEvent::MessageReceived {
                        message: message.clone(),
                        known_contact,
                    });
                    self.send_receipt(sender, message.id, MessageStatus::Delivered).await;
                    delivered.push(message);
                }
                Ok(_) => {
                    debug!(msg_id = %message.id, "released message was already stored");
                }
                Err(e) => {
                    warn!(msg_id = %message.id, error = %e, "failed to store inbound message");
                }
            }
        }
        delivered
    }

    /// Release gaps that have waited longer than the reorder window.
    async fn flush_reorder(&self) {
        let now = Instant::now();
        let expired = self.inner.reorder.lock().await.expired(now);

        for sender in expired {
            let _guard = self.inner.peer_locks.lock(&sender).await;
            let released = self.inner.reorder.lock().await.flush_sender(&sender, now);
            if released.is_empty() {
                continue;
            }
            warn!(
                peer = %sender.short(),
                count = released.len(),
                first_seq = released[0].sequence,
                "sequence gap timed out, releasing held messages"
            );
            self.deliver_inbound(released).await;
        }
    }

    pub(super) async fn ingest_loop(self, mut inbound: mpsc::Receiver<Vec<u8>>) {
        let mut ticker = tokio::time::interval(self.reorder_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                raw = inbound.recv() => match raw {
                    Some(raw) => {
                        self.on_envelope_received(&raw).await;
                    }
                    None => break,
                },
                _ = ticker.tick() => self.flush_reorder().await,
            }
        }
        debug!("ingest loop ended");
    }
}
