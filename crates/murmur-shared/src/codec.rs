//! Message codec: attachment text encoding, content fingerprints, and the
//! canonical plaintext carried inside envelopes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::constants::{MAX_ATTACHMENT_SIZE, MAX_TEXT_SIZE};
use crate::error::CodecError;
use crate::protocol::{Payload, RECEIPT_TAG};
use crate::types::MessageType;

#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_attachment_size: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(MAX_ATTACHMENT_SIZE)
    }
}

impl MessageCodec {
    pub fn new(max_attachment_size: usize) -> Self {
        Self {
            max_attachment_size,
        }
    }

    pub fn max_attachment_size(&self) -> usize {
        self.max_attachment_size
    }

    pub fn encode_attachment(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    pub fn decode_attachment(text: &str) -> Result<Vec<u8>, CodecError> {
        STANDARD
            .decode(text.trim())
            .map_err(|e| CodecError::InvalidAttachment(e.to_string()))
    }

    /// BLAKE3 fingerprint of raw bytes
    pub fn fingerprint(bytes: &[u8]) -> [u8; 32] {
        *blake3::hash(bytes).as_bytes()
    }

    /// Fingerprint of a message's content: the UTF-8 bytes for text, the
    /// decoded attachment bytes otherwise.
    pub fn content_fingerprint(kind: MessageType, content: &str) -> Result<[u8; 32], CodecError> {
        if kind.is_media() {
            Ok(Self::fingerprint(&Self::decode_attachment(content)?))
        } else {
            Ok(Self::fingerprint(content.as_bytes()))
        }
    }

    /// Check a media payload before any crypto or network work.
    pub fn validate_media(&self, kind: MessageType, encoded: &str) -> Result<(), CodecError> {
        if !kind.is_media() {
            return Err(CodecError::UnsupportedType(kind.to_string()));
        }
        // base64 never shrinks input, so oversized text can be rejected
        // without decoding it.
        if encoded.len() / 4 * 3 > self.max_attachment_size + 2 {
            return Err(CodecError::InvalidAttachment(format!(
                "attachment exceeds {} bytes",
                self.max_attachment_size
            )));
        }
        let bytes = Self::decode_attachment(encoded)?;
        if bytes.is_empty() {
            return Err(CodecError::InvalidAttachment("attachment is empty".into()));
        }
        if bytes.len() > self.max_attachment_size {
            return Err(CodecError::InvalidAttachment(format!(
                "attachment is {} bytes, limit is {}",
                bytes.len(),
                self.max_attachment_size
            )));
        }
        Ok(())
    }

    pub fn build_envelope_plaintext(&self, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(payload).map_err(|e| CodecError::Serialization(e.to_string()))
    }

    /// Parse and validate the plaintext of an envelope carrying `type_tag`.
    pub fn parse_envelope_plaintext(
        &self,
        type_tag: u8,
        bytes: &[u8],
    ) -> Result<Payload, CodecError> {
        if type_tag != RECEIPT_TAG && MessageType::from_tag(type_tag).is_none() {
            return Err(CodecError::UnsupportedType(format!("tag {type_tag:#04x}")));
        }

        let payload: Payload =
            bincode::deserialize(bytes).map_err(|e| CodecError::Serialization(e.to_string()))?;

        if payload.type_tag() != type_tag {
            return Err(CodecError::UnsupportedType(format!(
                "envelope tag {type_tag:#04x} does not match payload"
            )));
        }

        if let Payload::Message(message) = &payload {
            match message.kind {
                MessageType::Text => {
                    if message.content.len() > MAX_TEXT_SIZE {
                        return Err(CodecError::InvalidAttachment("text too large".into()));
                    }
                }
                MessageType::Image | MessageType::Video | MessageType::Voice => {
                    self.validate_media(message.kind, &message.content)?;
                }
            }
            let actual = Self::content_fingerprint(message.kind, &message.content)?;
            if actual != message.fingerprint {
                return Err(CodecError::InvalidAttachment("fingerprint mismatch".into()));
            }
        }

        Ok(payload)
    }
}
