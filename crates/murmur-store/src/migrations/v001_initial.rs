//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `contacts`, `messages` and `sequences`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Contacts (insertion order = seq)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contacts (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    id         TEXT NOT NULL UNIQUE,          -- UUID v4, local handle
    name       TEXT NOT NULL,
    public_key TEXT NOT NULL UNIQUE,          -- hex-encoded 64-byte public key
    avatar     TEXT,
    created_at TEXT NOT NULL                  -- RFC-3339
);

-- ----------------------------------------------------------------
-- Messages (append-only; only `status` is ever updated)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    sender_key   TEXT NOT NULL,               -- hex public key
    receiver_key TEXT NOT NULL,               -- hex public key
    kind         INTEGER NOT NULL,            -- MessageType tag
    content      TEXT NOT NULL,               -- plaintext or base64
    timestamp_ms INTEGER NOT NULL,            -- sender clock, unix millis
    status       INTEGER NOT NULL,            -- 0 sent, 1 delivered, 2 read
    sequence     INTEGER NOT NULL,
    fingerprint  TEXT NOT NULL                -- hex BLAKE3
);

CREATE INDEX IF NOT EXISTS idx_messages_pair_order
    ON messages(sender_key, receiver_key, timestamp_ms, id);

-- ----------------------------------------------------------------
-- Outbound sequence counters, one row per peer
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sequences (
    peer_key      TEXT PRIMARY KEY NOT NULL,
    next_outbound INTEGER NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
