use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CodecError, IdentityError};

// Device identity = Ed25519 verifying key + X25519 exchange key (2 x 32 bytes)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey {
    pub signing: [u8; 32],
    pub exchange: [u8; 32],
}

impl PublicKey {
    pub fn to_hex(&self) -> String {
        let mut out = hex::encode(self.signing);
        out.push_str(&hex::encode(self.exchange));
        out
    }

    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let s = s.trim();
        if s.len() != 128 {
            return Err(IdentityError::InvalidPublicKey(format!(
                "expected 128 hex chars, got {}",
                s.len()
            )));
        }
        let bytes =
            hex::decode(s).map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))?;
        let mut signing = [0u8; 32];
        let mut exchange = [0u8; 32];
        signing.copy_from_slice(&bytes[..32]);
        exchange.copy_from_slice(&bytes[32..]);
        Ok(Self { signing, exchange })
    }

    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for PublicKey {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum MessageType {
    Text = 0x01,
    Image = 0x02,
    Video = 0x03,
    Voice = 0x04,
}

impl MessageType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Text),
            0x02 => Some(Self::Image),
            0x03 => Some(Self::Video),
            0x04 => Some(Self::Voice),
            _ => None,
        }
    }

    /// Everything but text carries base64 attachment content.
    pub fn is_media(self) -> bool {
        match self {
            Self::Text => false,
            Self::Image | Self::Video | Self::Voice => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Voice => "voice",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "voice" => Ok(Self::Voice),
            other => Err(CodecError::UnsupportedType(other.to_string())),
        }
    }
}

/// Delivery state of a message. The derived ordering is the only allowed
/// direction of travel: `Sent < Delivered < Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn rank(self) -> i64 {
        match self {
            Self::Sent => 0,
            Self::Delivered => 1,
            Self::Read => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(Self::Sent),
            1 => Some(Self::Delivered),
            2 => Some(Self::Read),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single pairwise chat message. Both ends are public keys, never local
/// contact ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: PublicKey,
    pub receiver_id: PublicKey,
    pub kind: MessageType,
    /// Plaintext for text messages, base64 for attachments.
    pub content: String,
    /// Sender's local send time, millisecond precision.
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    /// Per-direction sequence number the message travelled with.
    pub sequence: u64,
    /// BLAKE3 fingerprint of the content bytes.
    pub fingerprint: [u8; 32],
}

impl Message {
    /// True when `{sender, receiver} == {a, b}`.
    pub fn is_between(&self, a: &PublicKey, b: &PublicKey) -> bool {
        (self.sender_id == *a && self.receiver_id == *b)
            || (self.sender_id == *b && self.receiver_id == *a)
    }

    pub fn is_outbound(&self, local: &PublicKey) -> bool {
        self.sender_id == *local
    }

    /// The other end of the conversation, seen from `local`.
    pub fn peer_of(&self, local: &PublicKey) -> PublicKey {
        if self.sender_id == *local {
            self.receiver_id
        } else {
            self.sender_id
        }
    }
}

/// A directory entry for a known peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    /// Local-only handle.
    pub id: Uuid,
    pub name: String,
    pub public_key: PublicKey,
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Current time truncated to millisecond precision so it survives storage
/// and the wire unchanged.
pub fn timestamp_now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key(fill: u8) -> PublicKey {
        PublicKey {
            signing: [fill; 32],
            exchange: [fill.wrapping_add(1); 32],
        }
    }

    #[test]
    fn test_public_key_hex_roundtrip() {
        let key = sample_key(7);
        let hex = key.to_hex();
        assert_eq!(hex.len(), 128);
        assert_eq!(hex.parse::<PublicKey>().unwrap(), key);
    }

    #[test]
    fn test_public_key_rejects_bad_input() {
        assert!(PublicKey::from_hex("pkC").is_err());
        assert!(PublicKey::from_hex(&"zz".repeat(64)).is_err());
    }

    #[test]
    fn test_message_type_tags() {
        for kind in [
            MessageType::Text,
            MessageType::Image,
            MessageType::Video,
            MessageType::Voice,
        ] {
            assert_eq!(MessageType::from_tag(kind.tag()), Some(kind));
            assert_eq!(kind.as_str().parse::<MessageType>().unwrap(), kind);
        }
        assert_eq!(MessageType::from_tag(0x7f), None);
        assert!(matches!(
            "sticker".parse::<MessageType>(),
            Err(CodecError::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_status_ordering() {
        assert!(MessageStatus::Sent < MessageStatus::Delivered);
        assert!(MessageStatus::Delivered < MessageStatus::Read);
        assert_eq!(
            MessageStatus::from_rank(MessageStatus::Read.rank()),
            Some(MessageStatus::Read)
        );
        assert_eq!(MessageStatus::from_rank(9), None);
    }

    #[test]
    fn test_message_is_between() {
        let a = sample_key(1);
        let b = sample_key(2);
        let c = sample_key(3);
        let msg = Message {
            id: Uuid::new_v4(),
            sender_id: a,
            receiver_id: b,
            kind: MessageType::Text,
            content: "hi".into(),
            timestamp: timestamp_now(),
            status: MessageStatus::Sent,
            sequence: 1,
            fingerprint: [0u8; 32],
        };
        assert!(msg.is_between(&a, &b));
        assert!(msg.is_between(&b, &a));
        assert!(!msg.is_between(&a, &c));
        assert_eq!(msg.peer_of(&a), b);
        assert_eq!(msg.peer_of(&b), a);
    }
}
