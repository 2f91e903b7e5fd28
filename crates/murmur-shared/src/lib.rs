//! # murmur-shared
//!
//! Primitives shared by every Murmur crate: the device identity, envelope
//! sealing, the wire format and the message codec.

pub mod codec;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod sealing;
pub mod types;

pub use codec::MessageCodec;
pub use identity::Identity;
pub use protocol::{Envelope, Payload};
pub use sealing::CryptoEngine;
pub use types::{Contact, Message, MessageStatus, MessageType, PublicKey};
