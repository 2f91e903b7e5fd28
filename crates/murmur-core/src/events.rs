use murmur_shared::types::{Message, MessageStatus, PublicKey};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Notifications published by the messaging service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagingEvent {
    /// A locally composed message was recorded at `sent`.
    MessageAdded(Message),
    /// An inbound message was recorded. `known_contact` is false when the
    /// sender is not in the contact directory.
    MessageReceived { message: Message, known_contact: bool },
    StatusChanged {
        message_id: Uuid,
        peer: PublicKey,
        status: MessageStatus,
    },
    /// The transport could not hand a message over; it stays at `sent`
    /// and is retransmitted when the peer's channel reconnects.
    DeliveryDeferred {
        message_id: Uuid,
        peer: PublicKey,
        reason: String,
    },
    PeerConnection { peer: PublicKey, connected: bool },
}

pub type EventReceiver = broadcast::Receiver<MessagingEvent>;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MessagingEvent>,
}

impl EventBus {
    pub fn new(size: usize) -> Self {
        let (tx, _) = broadcast::channel(size.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: MessagingEvent) {
        let _ = self.tx.send(event);
    }
}
