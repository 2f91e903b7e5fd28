//! # murmur-net
//!
//! Peer-to-peer transport: one reconnecting channel per peer over pluggable
//! byte links (TCP, or the in-memory network used in tests).

pub mod backoff;
pub mod channel;
pub mod error;
pub mod frame;
pub mod link;
pub mod memory;
pub mod peers;
pub mod tcp;
pub mod transport;

pub use channel::{ChannelEvent, ChannelState};
pub use error::NetError;
pub use link::{Link, PeerConnector};
pub use memory::MemoryNetwork;
pub use peers::AddressBook;
pub use tcp::TcpConnector;
pub use transport::{Transport, TransportConfig, TransportEvents};
