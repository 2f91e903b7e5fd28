/// Wire protocol version carried in every envelope
pub const PROTOCOL_VERSION: u8 = 1;

/// Application name
pub const APP_NAME: &str = "Murmur";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Ed25519 / X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Payloads above this size are sealed with a wrapped content key (64 KiB)
pub const HYBRID_THRESHOLD: usize = 64 * 1024;

/// Maximum text message size in bytes (256 KiB)
pub const MAX_TEXT_SIZE: usize = 262_144;

/// Maximum decoded attachment size in bytes (25 MiB)
pub const MAX_ATTACHMENT_SIZE: usize = 25 * 1024 * 1024;

/// Maximum link frame size in bytes (64 MiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Maximum contact display name length, in characters
pub const MAX_CONTACT_NAME_LEN: usize = 64;

/// Default TCP listen port
pub const DEFAULT_LISTEN_PORT: u16 = 4101;

/// Reconnection backoff defaults
pub const RECONNECT_BASE_MS: u64 = 1_000;
pub const RECONNECT_MAX_MS: u64 = 60_000;

/// Keep-alive ping interval in seconds
pub const KEEPALIVE_SECS: u64 = 15;

/// Connection attempt timeout in seconds
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Longest wait on a sequence gap before surfacing buffered messages
pub const REORDER_WAIT_MS: u64 = 2_000;

/// Furthest a sequence number may run ahead of the expected one
pub const MAX_SEQUENCE_AHEAD: u64 = 1_024;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_ENVELOPE_KEY: &str = "murmur-envelope-key-v1";
pub const KDF_CONTEXT_DB_KEY: &str = "murmur-db-key-v1";
