//! End-to-end scenarios: in-process nodes talking over the memory network.

use std::path::Path;
use std::time::Duration;

use murmur_core::{
    ContactDraft, DropReason, EngineConfig, EventReceiver, IngestOutcome, MessagingEvent,
    MessagingService, ServiceError,
};
use murmur_net::{ChannelState, MemoryNetwork};
use murmur_shared::protocol::{MessagePayload, ReceiptPayload, UNSEQUENCED};
use murmur_shared::types::timestamp_now;
use murmur_shared::{
    CryptoEngine, Identity, Message, MessageCodec, MessageStatus, MessageType, Payload, PublicKey,
};
use tempfile::TempDir;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

const PATIENCE: Duration = Duration::from_secs(5);

struct Node {
    service: MessagingService,
    dir: TempDir,
}

impl Node {
    fn key(&self) -> PublicKey {
        self.service.local_key()
    }

    async fn history_with(&self, peer: &PublicKey) -> Vec<Message> {
        self.service
            .filter_conversation(&self.key(), peer)
            .to_vec()
            .await
            .unwrap()
    }

    async fn status_of(&self, peer: &PublicKey, id: Uuid) -> Option<MessageStatus> {
        self.history_with(peer)
            .await
            .into_iter()
            .find(|m| m.id == id)
            .map(|m| m.status)
    }
}

fn fast_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        reorder_wait: Duration::from_millis(200),
        reconnect_base: Duration::from_millis(20),
        reconnect_max: Duration::from_millis(50),
        keepalive_interval: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(1),
        ..EngineConfig::with_data_dir(dir)
    }
}

async fn start_in(net: &MemoryNetwork, dir: TempDir) -> Node {
    let service = MessagingService::start(fast_config(dir.path()), net.connector())
        .await
        .unwrap();
    let incoming = net.listen(service.local_key()).await;
    service.serve_incoming(incoming).await;
    Node { service, dir }
}

async fn spawn_node(net: &MemoryNetwork) -> Node {
    start_in(net, tempfile::tempdir().unwrap()).await
}

async fn befriend(node: &Node, name: &str, peer: &PublicKey) {
    node.service
        .save_contact(ContactDraft::new(name, *peer))
        .await
        .unwrap();
}

/// Wait for the first event matching `pred`.
async fn expect_event<F>(events: &mut EventReceiver, mut pred: F) -> MessagingEvent
where
    F: FnMut(&MessagingEvent) -> bool,
{
    timeout(PATIENCE, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_for_status(node: &Node, peer: &PublicKey, id: Uuid, status: MessageStatus) {
    timeout(PATIENCE, async {
        while node.status_of(peer, id).await != Some(status) {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("message {id} never reached {status}"));
}

async fn wait_for_channel(node: &Node, peer: &PublicKey, state: ChannelState) {
    timeout(PATIENCE, async {
        while node.service.channel_state(peer).await != state {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("channel never reached {state}"));
}

/// A peer that only crafts envelopes; it runs no service.
struct Remote {
    crypto: CryptoEngine,
}

impl Remote {
    fn new() -> Self {
        Self {
            crypto: CryptoEngine::new(Identity::generate()),
        }
    }

    fn key(&self) -> PublicKey {
        self.crypto.local_key()
    }

    fn seal(&self, to: &PublicKey, payload: &Payload) -> Vec<u8> {
        let plaintext = MessageCodec::default()
            .build_envelope_plaintext(payload)
            .unwrap();
        self.crypto
            .encrypt_for(to, payload.type_tag(), payload.sequence(), &plaintext)
            .unwrap()
            .to_bytes()
            .unwrap()
    }

    fn text(&self, to: &PublicKey, sequence: u64, text: &str) -> (Uuid, Vec<u8>) {
        let id = Uuid::new_v4();
        let payload = Payload::Message(MessagePayload {
            id,
            kind: MessageType::Text,
            content: text.to_string(),
            timestamp: timestamp_now(),
            sequence,
            fingerprint: MessageCodec::fingerprint(text.as_bytes()),
        });
        (id, self.seal(to, &payload))
    }

    fn receipt(&self, to: &PublicKey, message_id: Uuid, status: MessageStatus) -> Vec<u8> {
        self.seal(to, &Payload::Receipt(ReceiptPayload { message_id, status }))
    }
}

fn sequences(outcome: &IngestOutcome) -> Vec<u64> {
    match outcome {
        IngestOutcome::Delivered(messages) => messages.iter().map(|m| m.sequence).collect(),
        other => panic!("expected delivery, got {other:?}"),
    }
}

#[tokio::test]
async fn test_hello_is_sent_then_delivered() {
    let net = MemoryNetwork::new();
    let alice = spawn_node(&net).await;
    let bob = spawn_node(&net).await;
    befriend(&alice, "Bob", &bob.key()).await;

    let mut bob_events = bob.service.subscribe();
    let message = alice.service.send_message("hello", &bob.key()).await.unwrap();

    assert_eq!(message.kind, MessageType::Text);
    assert_eq!(message.status, MessageStatus::Sent);
    assert_eq!(message.content, "hello");
    assert_eq!(message.sequence, 1);

    let received = expect_event(&mut bob_events, |e| {
        matches!(e, MessagingEvent::MessageReceived { .. })
    })
    .await;
    match received {
        MessagingEvent::MessageReceived {
            message: inbound,
            known_contact,
        } => {
            assert_eq!(inbound.id, message.id);
            assert_eq!(inbound.content, "hello");
            assert_eq!(inbound.status, MessageStatus::Delivered);
            assert!(!known_contact, "bob never added alice");
        }
        other => panic!("unexpected event {other:?}"),
    }

    wait_for_status(&alice, &bob.key(), message.id, MessageStatus::Delivered).await;

    // Retransmissions on reconnect never duplicate the log entry.
    assert_eq!(bob.history_with(&alice.key()).await.len(), 1);
}

#[tokio::test]
async fn test_empty_text_is_rejected() {
    let net = MemoryNetwork::new();
    let alice = spawn_node(&net).await;
    let peer = Remote::new().key();

    let err = alice.service.send_message("   \n", &peer).await.unwrap_err();
    assert!(matches!(err, ServiceError::EmptyContent));
    assert!(alice.history_with(&peer).await.is_empty());
}

#[tokio::test]
async fn test_forged_signature_stores_nothing() {
    let net = MemoryNetwork::new();
    let bob = spawn_node(&net).await;
    let mallory = Remote::new();

    let (_, bytes) = mallory.text(&bob.key(), 1, "trust me");
    let mut envelope = murmur_shared::Envelope::from_bytes(&bytes).unwrap();
    envelope.signature[0] ^= 0xff;
    let tampered = envelope.to_bytes().unwrap();

    let outcome = bob.service.on_envelope_received(&tampered).await;
    assert!(matches!(outcome, IngestOutcome::Dropped(DropReason::Crypto(_))));
    assert!(bob.history_with(&mallory.key()).await.is_empty());

    let outcome = bob.service.on_envelope_received(b"not an envelope").await;
    assert_eq!(outcome, IngestOutcome::Dropped(DropReason::Malformed));
}

#[tokio::test]
async fn test_oversize_media_is_rejected_before_storage() {
    let net = MemoryNetwork::new();
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        max_attachment_bytes: 1024,
        ..fast_config(dir.path())
    };
    let alice = MessagingService::start(config, net.connector()).await.unwrap();
    let peer = Remote::new().key();

    let big = MessageCodec::encode_attachment(&vec![7u8; 4096]);
    let err = alice
        .send_media_message(&big, MessageType::Image, &peer)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidAttachment(_)));

    let err = alice
        .send_media_message("aGVsbG8=", MessageType::Text, &peer)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::UnsupportedType(_)));

    let conversation = alice.filter_conversation(&alice.local_key(), &peer);
    assert!(conversation.to_vec().await.unwrap().is_empty());

    // A valid attachment goes through.
    let small = MessageCodec::encode_attachment(&[1, 2, 3, 4]);
    let message = alice
        .send_media_message(&small, MessageType::Voice, &peer)
        .await
        .unwrap();
    assert_eq!(message.kind, MessageType::Voice);
    assert_eq!(message.fingerprint, MessageCodec::fingerprint(&[1, 2, 3, 4]));
}

#[tokio::test]
async fn test_out_of_order_envelopes_surface_in_sequence() {
    let net = MemoryNetwork::new();
    let bob = spawn_node(&net).await;
    let carol = Remote::new();

    let envelopes: Vec<_> = (1..=3)
        .map(|seq| carol.text(&bob.key(), seq, &format!("part {seq}")))
        .collect();

    assert_eq!(
        bob.service.on_envelope_received(&envelopes[2].1).await,
        IngestOutcome::Buffered
    );
    assert_eq!(
        bob.service.on_envelope_received(&envelopes[1].1).await,
        IngestOutcome::Buffered
    );
    let outcome = bob.service.on_envelope_received(&envelopes[0].1).await;
    assert_eq!(sequences(&outcome), vec![1, 2, 3]);

    let contents: Vec<_> = bob
        .history_with(&carol.key())
        .await
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents.len(), 3);

    // Replaying an already stored envelope is reported as a duplicate.
    let (first_id, first) = &envelopes[0];
    assert_eq!(
        bob.service.on_envelope_received(first).await,
        IngestOutcome::Duplicate(*first_id)
    );
    assert_eq!(bob.history_with(&carol.key()).await.len(), 3);
}

#[tokio::test]
async fn test_sequence_gap_is_released_after_wait() {
    let net = MemoryNetwork::new();
    let bob = spawn_node(&net).await;
    let carol = Remote::new();
    let mut events = bob.service.subscribe();

    let (_, first) = carol.text(&bob.key(), 1, "one");
    let (_, third) = carol.text(&bob.key(), 3, "three");
    assert_eq!(sequences(&bob.service.on_envelope_received(&first).await), vec![1]);
    assert_eq!(
        bob.service.on_envelope_received(&third).await,
        IngestOutcome::Buffered
    );

    let released = expect_event(&mut events, |e| {
        matches!(e, MessagingEvent::MessageReceived { message, .. } if message.sequence == 3)
    })
    .await;
    assert!(matches!(released, MessagingEvent::MessageReceived { .. }));
    assert_eq!(bob.history_with(&carol.key()).await.len(), 2);

    // The missing message is late now and passes straight through.
    let (_, second) = carol.text(&bob.key(), 2, "two");
    assert_eq!(sequences(&bob.service.on_envelope_received(&second).await), vec![2]);
}

#[tokio::test]
async fn test_queued_message_is_retransmitted_when_peer_returns() {
    let net = MemoryNetwork::new();
    let alice = spawn_node(&net).await;
    let bob = spawn_node(&net).await;
    net.set_reachable(bob.key(), false).await;

    let mut alice_events = alice.service.subscribe();
    befriend(&alice, "Bob", &bob.key()).await;
    let message = alice
        .service
        .send_message("are you there?", &bob.key())
        .await
        .unwrap();

    let deferred = expect_event(&mut alice_events, |e| {
        matches!(e, MessagingEvent::DeliveryDeferred { .. })
    })
    .await;
    assert!(
        matches!(deferred, MessagingEvent::DeliveryDeferred { message_id, .. } if message_id == message.id)
    );
    assert_eq!(
        alice.status_of(&bob.key(), message.id).await,
        Some(MessageStatus::Sent)
    );

    net.set_reachable(bob.key(), true).await;
    expect_event(&mut alice_events, |e| {
        matches!(e, MessagingEvent::PeerConnection { connected: true, .. })
    })
    .await;
    wait_for_status(&alice, &bob.key(), message.id, MessageStatus::Delivered).await;
    assert_eq!(bob.history_with(&alice.key()).await.len(), 1);
}

#[tokio::test]
async fn test_deleting_contact_closes_channel_and_keeps_history() {
    let net = MemoryNetwork::new();
    let alice = spawn_node(&net).await;
    let bob = spawn_node(&net).await;

    let contact = alice
        .service
        .save_contact(ContactDraft::new("Bob", bob.key()))
        .await
        .unwrap();
    let message = alice.service.send_message("bye", &bob.key()).await.unwrap();
    wait_for_channel(&alice, &bob.key(), ChannelState::Connected).await;
    wait_for_status(&alice, &bob.key(), message.id, MessageStatus::Delivered).await;
    // Let any retransmission triggered by the connect settle.
    sleep(Duration::from_millis(100)).await;

    alice.service.delete_contact(contact.id).await.unwrap();

    assert_eq!(
        alice.service.channel_state(&bob.key()).await,
        ChannelState::Disconnected
    );
    assert!(alice.service.load_contacts().await.unwrap().is_empty());
    let history = alice.history_with(&bob.key()).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, message.id);

    let err = alice.service.delete_contact(contact.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound));
}

#[tokio::test]
async fn test_contact_rules_are_enforced() {
    let net = MemoryNetwork::new();
    let alice = spawn_node(&net).await;
    let peer = Remote::new().key();

    let first = alice
        .service
        .save_contact(ContactDraft::new("Carol", peer))
        .await
        .unwrap();
    let err = alice
        .service
        .save_contact(ContactDraft::new("Carol again", peer))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::DuplicateKey(id) if id == first.id));

    let err = alice
        .service
        .save_contact(ContactDraft::new("  ", Remote::new().key()))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let err = alice
        .service
        .save_contact(ContactDraft::new("Me", alice.key()))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let renamed = alice
        .service
        .save_contact(ContactDraft {
            id: Some(first.id),
            ..ContactDraft::new("Caroline", peer)
        })
        .await
        .unwrap();
    assert_eq!(renamed.id, first.id);
    assert_eq!(renamed.created_at, first.created_at);

    let contacts = alice.service.load_contacts().await.unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].name, "Caroline");
}

#[tokio::test]
async fn test_corrupt_identity_is_fatal() {
    let net = MemoryNetwork::new();
    let dir = tempfile::tempdir().unwrap();
    let identity_path = dir.path().join(murmur_store::keys::IDENTITY_FILE_NAME);
    std::fs::write(&identity_path, b"{ definitely not a key").unwrap();

    let result = MessagingService::start(fast_config(dir.path()), net.connector()).await;
    assert!(matches!(result, Err(ServiceError::KeyStorage(_))));

    // The broken file is left for the user to inspect.
    assert_eq!(
        std::fs::read(&identity_path).unwrap(),
        b"{ definitely not a key"
    );
}

#[tokio::test]
async fn test_opening_conversation_sends_read_receipts() {
    let net = MemoryNetwork::new();
    let alice = spawn_node(&net).await;
    let bob = spawn_node(&net).await;
    befriend(&alice, "Bob", &bob.key()).await;
    befriend(&bob, "Alice", &alice.key()).await;

    let mut bob_events = bob.service.subscribe();
    let message = alice.service.send_message("read me", &bob.key()).await.unwrap();
    let received = expect_event(&mut bob_events, |e| {
        matches!(e, MessagingEvent::MessageReceived { .. })
    })
    .await;
    assert!(matches!(
        received,
        MessagingEvent::MessageReceived { known_contact: true, .. }
    ));

    let mut alice_events = alice.service.subscribe();
    let conversation = bob.service.open_conversation(&alice.key()).await.unwrap();
    let history = conversation.to_vec().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, MessageStatus::Read);

    expect_event(&mut alice_events, |e| {
        matches!(
            e,
            MessagingEvent::StatusChanged { message_id, status: MessageStatus::Read, .. }
                if *message_id == message.id
        )
    })
    .await;
    assert_eq!(
        alice.status_of(&bob.key(), message.id).await,
        Some(MessageStatus::Read)
    );

    // Nothing left to mark.
    assert!(!bob.service.mark_read(message.id).await.unwrap());
}

#[tokio::test]
async fn test_receipt_from_wrong_peer_is_ignored() {
    let net = MemoryNetwork::new();
    let alice = spawn_node(&net).await;
    let bob = Remote::new();
    let mallory = Remote::new();

    let message = alice.service.send_message("for bob", &bob.key()).await.unwrap();

    let forged = mallory.receipt(&alice.key(), message.id, MessageStatus::Read);
    assert_eq!(
        alice.service.on_envelope_received(&forged).await,
        IngestOutcome::Dropped(DropReason::ReceiptMismatch(message.id))
    );

    let unknown = bob.receipt(&alice.key(), Uuid::new_v4(), MessageStatus::Delivered);
    assert!(matches!(
        alice.service.on_envelope_received(&unknown).await,
        IngestOutcome::Dropped(DropReason::UnknownMessage(_))
    ));
    assert_eq!(
        alice.status_of(&bob.key(), message.id).await,
        Some(MessageStatus::Sent)
    );

    // The real recipient may skip straight to read, but never back.
    let read = bob.receipt(&alice.key(), message.id, MessageStatus::Read);
    assert_eq!(
        alice.service.on_envelope_received(&read).await,
        IngestOutcome::StatusUpdated {
            message_id: message.id,
            status: MessageStatus::Read,
            changed: true,
        }
    );
    let late = bob.receipt(&alice.key(), message.id, MessageStatus::Delivered);
    assert_eq!(
        alice.service.on_envelope_received(&late).await,
        IngestOutcome::StatusUpdated {
            message_id: message.id,
            status: MessageStatus::Delivered,
            changed: false,
        }
    );
    assert_eq!(
        alice.status_of(&bob.key(), message.id).await,
        Some(MessageStatus::Read)
    );
}

#[tokio::test]
async fn test_restart_keeps_identity_and_pending_messages() {
    let net = MemoryNetwork::new();
    let alice = spawn_node(&net).await;
    let peer = Remote::new().key();
    let key = alice.key();

    let message = alice.service.send_message("later", &peer).await.unwrap();
    alice.service.shutdown().await;

    let err = alice.service.send_message("too late", &peer).await.unwrap_err();
    assert!(matches!(err, ServiceError::TransportUnavailable));
    assert_eq!(
        alice.service.on_envelope_received(b"anything").await,
        IngestOutcome::Dropped(DropReason::ShutDown)
    );

    let Node { dir, .. } = alice;
    let restarted = start_in(&net, dir).await;
    assert_eq!(restarted.key(), key);

    let history = restarted.history_with(&peer).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, message.id);
    assert_eq!(history[0].status, MessageStatus::Sent);

    // Sequence numbering continues where it left off.
    let next = restarted.service.send_message("again", &peer).await.unwrap();
    assert_eq!(next.sequence, 2);
}

#[tokio::test]
async fn test_unsequenced_message_is_dropped() {
    let net = MemoryNetwork::new();
    let bob = spawn_node(&net).await;
    let carol = Remote::new();

    let (_, bytes) = carol.text(&bob.key(), UNSEQUENCED, "no order");
    assert_eq!(
        bob.service.on_envelope_received(&bytes).await,
        IngestOutcome::Dropped(DropReason::SequenceMismatch)
    );
    assert!(bob.history_with(&carol.key()).await.is_empty());
}

#[tokio::test]
async fn test_runaway_sequence_is_dropped_and_inbound_keeps_flowing() {
    let net = MemoryNetwork::new();
    let alice = spawn_node(&net).await;
    let bob = spawn_node(&net).await;
    let carol = Remote::new();

    let (_, runaway) = carol.text(&bob.key(), u64::MAX, "boom");
    assert_eq!(
        bob.service.on_envelope_received(&runaway).await,
        IngestOutcome::Dropped(DropReason::SequenceOutOfWindow {
            expected: 1,
            sequence: u64::MAX,
        })
    );
    assert!(bob.history_with(&carol.key()).await.is_empty());

    // Well past the reorder wait, the ingest loop is still alive.
    sleep(Duration::from_millis(600)).await;
    let (_, first) = carol.text(&bob.key(), 1, "one");
    assert_eq!(sequences(&bob.service.on_envelope_received(&first).await), vec![1]);

    let mut bob_events = bob.service.subscribe();
    let message = alice.service.send_message("after", &bob.key()).await.unwrap();
    expect_event(&mut bob_events, |e| {
        matches!(e, MessagingEvent::MessageReceived { message: m, .. } if m.id == message.id)
    })
    .await;
}

#[tokio::test]
async fn test_deleted_contact_stays_closed_when_it_writes_again() {
    let net = MemoryNetwork::new();
    let alice = spawn_node(&net).await;
    let bob = spawn_node(&net).await;

    let contact = alice
        .service
        .save_contact(ContactDraft::new("Bob", bob.key()))
        .await
        .unwrap();
    wait_for_channel(&alice, &bob.key(), ChannelState::Connected).await;
    alice.service.delete_contact(contact.id).await.unwrap();

    let mut alice_events = alice.service.subscribe();
    let message = bob.service.send_message("still here", &alice.key()).await.unwrap();
    let received = expect_event(&mut alice_events, |e| {
        matches!(e, MessagingEvent::MessageReceived { .. })
    })
    .await;
    assert!(matches!(
        received,
        MessagingEvent::MessageReceived { known_contact: false, .. }
    ));

    // The delivery receipt still reaches bob, over a one-shot link.
    wait_for_status(&bob, &alice.key(), message.id, MessageStatus::Delivered).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        alice.service.channel_state(&bob.key()).await,
        ChannelState::Disconnected
    );
}
