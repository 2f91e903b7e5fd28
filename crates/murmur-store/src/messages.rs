//! The append-only message log.
//!
//! Rows are written once and only their `status` column ever changes, and
//! only forward. Conversations are read lazily with keyset pagination on
//! `(timestamp_ms, id)`, so a long history never has to be materialized.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use murmur_shared::types::{Message, MessageStatus, MessageType, PublicKey};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::database::{conversion_error, Database, SharedDatabase};
use crate::error::{Result, StoreError};

const MESSAGE_COLUMNS: &str =
    "id, sender_key, receiver_key, kind, content, timestamp_ms, status, sequence, fingerprint";

const DEFAULT_PAGE_SIZE: usize = 64;

/// What [`Database::append_message`] did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The id was new.
    Inserted,
    /// The id existed at a lower status and was moved forward.
    Advanced {
        from: MessageStatus,
        to: MessageStatus,
    },
    /// The id existed at an equal or higher status.
    Unchanged(MessageStatus),
}

impl AppendOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Inserted)
    }
}

impl Database {
    /// Insert `message` if its id is unseen; otherwise advance the stored
    /// status to `max(stored, message.status)` and leave every other field
    /// as first recorded.
    pub fn append_message(&mut self, message: &Message) -> Result<AppendOutcome> {
        let tx = self.conn_mut().transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT status FROM messages WHERE id = ?1",
                params![message.id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match existing {
            None => {
                tx.execute(
                    "INSERT INTO messages
                        (id, sender_key, receiver_key, kind, content, timestamp_ms,
                         status, sequence, fingerprint)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        message.id.to_string(),
                        message.sender_id.to_hex(),
                        message.receiver_id.to_hex(),
                        message.kind.tag(),
                        message.content,
                        message.timestamp.timestamp_millis(),
                        message.status.rank(),
                        message.sequence as i64,
                        hex::encode(message.fingerprint),
                    ],
                )?;
                AppendOutcome::Inserted
            }
            Some(rank) => {
                let stored = status_from_rank(6, rank)?;
                if message.status > stored {
                    tx.execute(
                        "UPDATE messages SET status = ?2 WHERE id = ?1",
                        params![message.id.to_string(), message.status.rank()],
                    )?;
                    AppendOutcome::Advanced {
                        from: stored,
                        to: message.status,
                    }
                } else {
                    AppendOutcome::Unchanged(stored)
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    pub fn get_message(&self, id: Uuid) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Move a message's status forward. Returns the previous status when it
    /// changed, `None` when the stored status was already at or past
    /// `status`.
    pub fn advance_status(&mut self, id: Uuid, status: MessageStatus) -> Result<Option<MessageStatus>> {
        let tx = self.conn_mut().transaction()?;
        let rank: i64 = tx
            .query_row(
                "SELECT status FROM messages WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;

        let stored = status_from_rank(6, rank)?;
        if status <= stored {
            return Ok(None);
        }
        tx.execute(
            "UPDATE messages SET status = ?2 WHERE id = ?1",
            params![id.to_string(), status.rank()],
        )?;
        tx.commit()?;
        Ok(Some(stored))
    }

    /// One page of the conversation between `local` and `peer`, strictly
    /// after `after` in `(timestamp_ms, id)` order.
    pub fn conversation_page(
        &self,
        local: &PublicKey,
        peer: &PublicKey,
        after: Option<&(i64, String)>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE ((sender_key = ?1 AND receiver_key = ?2)
                 OR (sender_key = ?2 AND receiver_key = ?1))
               AND (?3 IS NULL OR timestamp_ms > ?3 OR (timestamp_ms = ?3 AND id > ?4))
             ORDER BY timestamp_ms ASC, id ASC
             LIMIT ?5"
        ))?;

        let rows = stmt.query_map(
            params![
                local.to_hex(),
                peer.to_hex(),
                after.map(|(ts, _)| *ts),
                after.map(|(_, id)| id.as_str()),
                limit as i64,
            ],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Outbound messages from `local` to `peer` still waiting for a
    /// delivery receipt, in conversation order.
    pub fn pending_outbound(&self, local: &PublicKey, peer: &PublicKey) -> Result<Vec<Message>> {
        self.messages_with_status(local, peer, MessageStatus::Sent)
    }

    /// Inbound messages from `peer` that were delivered but not read.
    pub fn unread_inbound(&self, local: &PublicKey, peer: &PublicKey) -> Result<Vec<Message>> {
        self.messages_with_status(peer, local, MessageStatus::Delivered)
    }

    fn messages_with_status(
        &self,
        sender: &PublicKey,
        receiver: &PublicKey,
        status: MessageStatus,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE sender_key = ?1 AND receiver_key = ?2 AND status = ?3
             ORDER BY timestamp_ms ASC, id ASC"
        ))?;

        let rows = stmt.query_map(
            params![sender.to_hex(), receiver.to_hex(), status.rank()],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Allocate the next outbound sequence number towards `peer`. Numbers
    /// start at 1 and survive restarts.
    pub fn next_sequence(&mut self, peer: &PublicKey) -> Result<u64> {
        let key = peer.to_hex();
        let tx = self.conn_mut().transaction()?;

        let next: i64 = tx
            .query_row(
                "SELECT next_outbound FROM sequences WHERE peer_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(1);

        tx.execute(
            "INSERT INTO sequences (peer_key, next_outbound) VALUES (?1, ?2)
             ON CONFLICT(peer_key) DO UPDATE SET next_outbound = excluded.next_outbound",
            params![key, next + 1],
        )?;
        tx.commit()?;

        Ok(next as u64)
    }

    /// Highest sequence number recorded from `sender` to `receiver`, or 0.
    pub fn last_sequence(&self, sender: &PublicKey, receiver: &PublicKey) -> Result<u64> {
        let max: Option<i64> = self.conn().query_row(
            "SELECT MAX(sequence) FROM messages WHERE sender_key = ?1 AND receiver_key = ?2",
            params![sender.to_hex(), receiver.to_hex()],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) as u64)
    }

    pub fn message_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn status_from_rank(column: usize, rank: i64) -> rusqlite::Result<MessageStatus> {
    MessageStatus::from_rank(rank).ok_or(rusqlite::Error::IntegralValueOutOfRange(column, rank))
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let sender_hex: String = row.get(1)?;
    let receiver_hex: String = row.get(2)?;
    let kind_tag: u8 = row.get(3)?;
    let content: String = row.get(4)?;
    let timestamp_ms: i64 = row.get(5)?;
    let status_rank: i64 = row.get(6)?;
    let sequence: i64 = row.get(7)?;
    let fingerprint_hex: String = row.get(8)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| conversion_error(0, e))?;
    let sender_id = PublicKey::from_hex(&sender_hex).map_err(|e| conversion_error(1, e))?;
    let receiver_id = PublicKey::from_hex(&receiver_hex).map_err(|e| conversion_error(2, e))?;
    let kind = MessageType::from_tag(kind_tag)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(3, kind_tag.into()))?;
    let timestamp: DateTime<Utc> = DateTime::from_timestamp_millis(timestamp_ms)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(5, timestamp_ms))?;
    let status = status_from_rank(6, status_rank)?;
    let fingerprint: [u8; 32] = hex::decode(&fingerprint_hex)
        .map_err(|e| conversion_error(8, e))?
        .try_into()
        .map_err(|_| conversion_error(8, hex::FromHexError::InvalidStringLength))?;

    Ok(Message {
        id,
        sender_id,
        receiver_id,
        kind,
        content,
        timestamp,
        status,
        sequence: sequence as u64,
        fingerprint,
    })
}

fn cursor_of(message: &Message) -> (i64, String) {
    (message.timestamp.timestamp_millis(), message.id.to_string())
}

/// A lazy, restartable view of one pairwise conversation.
///
/// Each call to [`Conversation::stream`] starts again from the oldest
/// message and pulls pages on demand.
#[derive(Clone)]
pub struct Conversation {
    db: SharedDatabase,
    local: PublicKey,
    peer: PublicKey,
    page_size: usize,
}

struct PageState {
    db: SharedDatabase,
    local: PublicKey,
    peer: PublicKey,
    page_size: usize,
    cursor: Option<(i64, String)>,
    buffer: VecDeque<Message>,
    exhausted: bool,
}

impl Conversation {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn local(&self) -> &PublicKey {
        &self.local
    }

    pub fn peer(&self) -> &PublicKey {
        &self.peer
    }

    pub fn stream(&self) -> impl Stream<Item = Result<Message>> + Send + 'static {
        let state = PageState {
            db: self.db.clone(),
            local: self.local,
            peer: self.peer,
            page_size: self.page_size,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(message) = state.buffer.pop_front() {
                    return Some((Ok(message), state));
                }
                if state.exhausted {
                    return None;
                }

                let page = state.db.lock().await.conversation_page(
                    &state.local,
                    &state.peer,
                    state.cursor.as_ref(),
                    state.page_size,
                );
                match page {
                    Ok(page) => {
                        state.exhausted = page.len() < state.page_size;
                        if let Some(last) = page.last() {
                            state.cursor = Some(cursor_of(last));
                        }
                        state.buffer.extend(page);
                    }
                    Err(e) => {
                        state.exhausted = true;
                        return Some((Err(e), state));
                    }
                }
            }
        })
    }

    pub async fn to_vec(&self) -> Result<Vec<Message>> {
        self.stream().try_collect().await
    }
}

/// Async view of the message log over the shared connection.
#[derive(Clone)]
pub struct MessageStore {
    db: SharedDatabase,
}

impl MessageStore {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    pub async fn append(&self, message: &Message) -> Result<AppendOutcome> {
        let outcome = self.db.lock().await.append_message(message)?;
        tracing::trace!(msg_id = %message.id, ?outcome, "message appended");
        Ok(outcome)
    }

    pub async fn get(&self, id: Uuid) -> Result<Message> {
        self.db.lock().await.get_message(id)
    }

    pub fn conversation(&self, local: &PublicKey, peer: &PublicKey) -> Conversation {
        Conversation {
            db: self.db.clone(),
            local: *local,
            peer: *peer,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Set a message to `read`. Returns whether anything changed.
    pub async fn mark_read(&self, id: Uuid) -> Result<bool> {
        Ok(self.advance_status(id, MessageStatus::Read).await?.is_some())
    }

    pub async fn advance_status(
        &self,
        id: Uuid,
        status: MessageStatus,
    ) -> Result<Option<MessageStatus>> {
        self.db.lock().await.advance_status(id, status)
    }

    pub async fn pending_outbound(&self, local: &PublicKey, peer: &PublicKey) -> Result<Vec<Message>> {
        self.db.lock().await.pending_outbound(local, peer)
    }

    pub async fn unread_inbound(&self, local: &PublicKey, peer: &PublicKey) -> Result<Vec<Message>> {
        self.db.lock().await.unread_inbound(local, peer)
    }

    pub async fn next_sequence(&self, peer: &PublicKey) -> Result<u64> {
        self.db.lock().await.next_sequence(peer)
    }

    pub async fn last_sequence(&self, sender: &PublicKey, receiver: &PublicKey) -> Result<u64> {
        self.db.lock().await.last_sequence(sender, receiver)
    }

    pub async fn count(&self) -> Result<u64> {
        self.db.lock().await.message_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use futures::StreamExt;
    use murmur_shared::types::timestamp_now;
    use murmur_shared::{Identity, MessageCodec};

    fn keys() -> (PublicKey, PublicKey, PublicKey) {
        (
            Identity::generate().public_key(),
            Identity::generate().public_key(),
            Identity::generate().public_key(),
        )
    }

    fn message(from: PublicKey, to: PublicKey, content: &str, at: DateTime<Utc>) -> Message {
        Message {
            id: Uuid::new_v4(),
            sender_id: from,
            receiver_id: to,
            kind: MessageType::Text,
            content: content.to_string(),
            timestamp: at,
            status: MessageStatus::Sent,
            sequence: 1,
            fingerprint: MessageCodec::fingerprint(content.as_bytes()),
        }
    }

    fn store() -> MessageStore {
        MessageStore::new(Database::open_in_memory().unwrap().into_shared())
    }

    #[tokio::test]
    async fn test_append_round_trips_every_field() {
        let store = store();
        let (a, b, _) = keys();
        let original = message(a, b, "hello", timestamp_now());

        assert_eq!(store.append(&original).await.unwrap(), AppendOutcome::Inserted);
        assert_eq!(store.get(original.id).await.unwrap(), original);
    }

    #[tokio::test]
    async fn test_reappend_only_moves_status_forward() {
        let store = store();
        let (a, b, _) = keys();
        let mut m = message(a, b, "hi", timestamp_now());
        store.append(&m).await.unwrap();

        m.status = MessageStatus::Read;
        m.content = "rewritten".into();
        assert_eq!(
            store.append(&m).await.unwrap(),
            AppendOutcome::Advanced {
                from: MessageStatus::Sent,
                to: MessageStatus::Read
            }
        );

        m.status = MessageStatus::Delivered;
        assert_eq!(
            store.append(&m).await.unwrap(),
            AppendOutcome::Unchanged(MessageStatus::Read)
        );

        let stored = store.get(m.id).await.unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
        assert_eq!(stored.content, "hi");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_advance_status_is_monotonic() {
        let store = store();
        let (a, b, _) = keys();
        let m = message(a, b, "x", timestamp_now());
        store.append(&m).await.unwrap();

        assert_eq!(
            store.advance_status(m.id, MessageStatus::Delivered).await.unwrap(),
            Some(MessageStatus::Sent)
        );
        assert_eq!(
            store.advance_status(m.id, MessageStatus::Sent).await.unwrap(),
            None
        );
        assert!(store.mark_read(m.id).await.unwrap());
        assert!(!store.mark_read(m.id).await.unwrap());
        assert!(matches!(
            store.mark_read(Uuid::new_v4()).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_conversation_is_filtered_and_ordered_across_pages() {
        let store = store();
        let (a, b, c) = keys();
        let base = timestamp_now();

        // Interleave both directions plus unrelated traffic, out of order.
        let mut expected = Vec::new();
        for i in (0..10).rev() {
            let at = base + Duration::milliseconds(i / 2);
            let m = if i % 2 == 0 {
                message(a, b, &format!("a->b {i}"), at)
            } else {
                message(b, a, &format!("b->a {i}"), at)
            };
            store.append(&m).await.unwrap();
            expected.push(m);
            store.append(&message(a, c, "other", at)).await.unwrap();
        }
        expected.sort_by(|x, y| (x.timestamp, x.id).cmp(&(y.timestamp, y.id)));

        let conversation = store.conversation(&a, &b).with_page_size(3);
        let got = conversation.to_vec().await.unwrap();
        assert_eq!(got, expected);

        // Symmetric and restartable.
        assert_eq!(store.conversation(&b, &a).to_vec().await.unwrap(), expected);
        let first_two: Vec<_> = conversation.stream().take(2).collect().await;
        assert_eq!(first_two.len(), 2);
        assert_eq!(first_two[0].as_ref().unwrap(), &expected[0]);
    }

    #[tokio::test]
    async fn test_pending_and_unread_select_by_direction() {
        let store = store();
        let (local, peer, _) = keys();
        let now = timestamp_now();

        let outbound = message(local, peer, "out", now);
        let mut delivered_out = message(local, peer, "done", now);
        delivered_out.status = MessageStatus::Delivered;
        let mut inbound = message(peer, local, "in", now);
        inbound.status = MessageStatus::Delivered;

        for m in [&outbound, &delivered_out, &inbound] {
            store.append(m).await.unwrap();
        }

        let pending = store.pending_outbound(&local, &peer).await.unwrap();
        assert_eq!(pending.iter().map(|m| m.id).collect::<Vec<_>>(), vec![outbound.id]);

        let unread = store.unread_inbound(&local, &peer).await.unwrap();
        assert_eq!(unread.iter().map(|m| m.id).collect::<Vec<_>>(), vec![inbound.id]);

        assert_eq!(store.last_sequence(&peer, &local).await.unwrap(), 1);
        assert_eq!(store.last_sequence(&peer, &peer).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sequences_are_per_peer_and_persistent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq.db");
        let (_, b, c) = keys();

        {
            let store = MessageStore::new(Database::open_at(&path, &[1; 32]).unwrap().into_shared());
            assert_eq!(store.next_sequence(&b).await.unwrap(), 1);
            assert_eq!(store.next_sequence(&b).await.unwrap(), 2);
            assert_eq!(store.next_sequence(&c).await.unwrap(), 1);
        }

        let store = MessageStore::new(Database::open_at(&path, &[1; 32]).unwrap().into_shared());
        assert_eq!(store.next_sequence(&b).await.unwrap(), 3);
    }
}
