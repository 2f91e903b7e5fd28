use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{MessageStatus, MessageType, PublicKey};

/// Type tag for receipt envelopes; message envelopes use `MessageType::tag`.
pub const RECEIPT_TAG: u8 = 0x10;

/// Receipts are unsequenced and bypass receiver-side reordering.
pub const UNSEQUENCED: u64 = 0;

/// The signed, encrypted unit exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub version: u8,
    pub sender: PublicKey,
    pub recipient: PublicKey,
    /// Per-conversation, per-direction sequence number
    pub sequence: u64,
    pub type_tag: u8,
    /// Sender's one-time X25519 public key
    pub ephemeral: [u8; 32],
    /// Content key sealed under the agreed key (hybrid mode only)
    pub wrapped_key: Option<Vec<u8>>,
    /// XChaCha20-Poly1305: nonce || ciphertext
    pub ciphertext: Vec<u8>,
    /// Ed25519 signature over every other field
    pub signature: Vec<u8>,
}

// Borrowed view of the signed fields; serialized in declaration order.
#[derive(Serialize)]
struct SignedFields<'a> {
    version: u8,
    sender: &'a PublicKey,
    recipient: &'a PublicKey,
    sequence: u64,
    type_tag: u8,
    ephemeral: &'a [u8; 32],
    wrapped_key: &'a Option<Vec<u8>>,
    ciphertext: &'a [u8],
}

impl Envelope {
    /// Canonical bytes covered by the signature
    pub fn signing_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(&SignedFields {
            version: self.version,
            sender: &self.sender,
            recipient: &self.recipient,
            sequence: self.sequence,
            type_tag: self.type_tag,
            ephemeral: &self.ephemeral,
            wrapped_key: &self.wrapped_key,
            ciphertext: &self.ciphertext,
        })
    }

    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    pub fn is_receipt(&self) -> bool {
        self.type_tag == RECEIPT_TAG
    }
}

/// Plaintext carried inside an envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Payload {
    Message(MessagePayload),
    Receipt(ReceiptPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagePayload {
    /// Message UUID for deduplication
    pub id: Uuid,
    pub kind: MessageType,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    /// BLAKE3 hash of the content bytes for integrity verification
    pub fingerprint: [u8; 32],
}

/// Acknowledges delivery or read of a specific message id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReceiptPayload {
    pub message_id: Uuid,
    pub status: MessageStatus,
}

impl Payload {
    pub fn type_tag(&self) -> u8 {
        match self {
            Payload::Message(m) => m.kind.tag(),
            Payload::Receipt(_) => RECEIPT_TAG,
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            Payload::Message(m) => m.sequence,
            Payload::Receipt(_) => UNSEQUENCED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> Envelope {
        Envelope {
            version: 1,
            sender: PublicKey {
                signing: [1u8; 32],
                exchange: [2u8; 32],
            },
            recipient: PublicKey {
                signing: [3u8; 32],
                exchange: [4u8; 32],
            },
            sequence: 7,
            type_tag: MessageType::Text.tag(),
            ephemeral: [5u8; 32],
            wrapped_key: None,
            ciphertext: vec![1, 2, 3, 4, 5],
            signature: vec![0u8; 64],
        }
    }

    #[test]
    fn test_envelope_wire_roundtrip() {
        let env = sample_envelope();
        let bytes = env.to_bytes().unwrap();
        assert_eq!(Envelope::from_bytes(&bytes).unwrap(), env);
    }

    #[test]
    fn test_signing_bytes_ignore_signature() {
        let a = sample_envelope();
        let mut b = sample_envelope();
        b.signature = vec![9u8; 64];
        assert_eq!(a.signing_bytes().unwrap(), b.signing_bytes().unwrap());

        b.sequence += 1;
        assert_ne!(a.signing_bytes().unwrap(), b.signing_bytes().unwrap());
    }

    #[test]
    fn test_truncated_envelope_is_rejected() {
        let bytes = sample_envelope().to_bytes().unwrap();
        assert!(Envelope::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_receipt_payload_is_unsequenced() {
        let receipt = Payload::Receipt(ReceiptPayload {
            message_id: Uuid::new_v4(),
            status: MessageStatus::Read,
        });
        assert_eq!(receipt.type_tag(), RECEIPT_TAG);
        assert_eq!(receipt.sequence(), UNSEQUENCED);
    }
}
