//! Receiver-side sequence restoration.
//!
//! Messages from one sender carry consecutive sequence numbers. Anything
//! that arrives ahead of the expected number is held back until the gap
//! fills or `wait` elapses; then the held messages are released in
//! sequence order and the expectation moves past them. Numbers below the
//! expectation (late arrivals, duplicates) pass straight through. Numbers
//! more than `max_ahead` past the expectation are refused.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use murmur_shared::constants::MAX_SEQUENCE_AHEAD;
use murmur_shared::types::PublicKey;
use tokio::time::Instant;

struct SenderQueue<T> {
    expected: u64,
    pending: BTreeMap<u64, T>,
    gap_since: Option<Instant>,
}

impl<T> SenderQueue<T> {
    fn new(expected: u64) -> Self {
        Self {
            expected,
            pending: BTreeMap::new(),
            gap_since: None,
        }
    }

    fn release_contiguous(&mut self, out: &mut Vec<T>) {
        while let Some(item) = self.pending.remove(&self.expected) {
            out.push(item);
            self.expected = self.expected.saturating_add(1);
        }
    }

    fn release_all(&mut self) -> Vec<T> {
        let pending = std::mem::take(&mut self.pending);
        if let Some(&last) = pending.keys().next_back() {
            self.expected = self.expected.max(last.saturating_add(1));
        }
        self.gap_since = None;
        pending.into_values().collect()
    }
}

/// Returned by [`ReorderBuffer::push`] for a sequence number too far ahead
/// of the expected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfWindow {
    pub expected: u64,
    pub sequence: u64,
}

pub struct ReorderBuffer<T> {
    wait: Duration,
    max_ahead: u64,
    senders: HashMap<PublicKey, SenderQueue<T>>,
}

impl<T> ReorderBuffer<T> {
    pub fn new(wait: Duration) -> Self {
        Self::with_window(wait, MAX_SEQUENCE_AHEAD)
    }

    pub fn with_window(wait: Duration, max_ahead: u64) -> Self {
        Self {
            wait,
            max_ahead,
            senders: HashMap::new(),
        }
    }

    pub fn knows(&self, sender: &PublicKey) -> bool {
        self.senders.contains_key(sender)
    }

    /// Start tracking `sender`, expecting `next` as its next sequence
    /// number. No effect when the sender is already tracked.
    pub fn track(&mut self, sender: PublicKey, next: u64) {
        self.senders
            .entry(sender)
            .or_insert_with(|| SenderQueue::new(next.max(1)));
    }

    /// Admit one item. Returns whatever became deliverable, in order; an
    /// empty result means the item is being held. Nothing is kept for an
    /// [`OutOfWindow`] sequence.
    pub fn push(
        &mut self,
        sender: PublicKey,
        sequence: u64,
        item: T,
        now: Instant,
    ) -> Result<Vec<T>, OutOfWindow> {
        let queue = self
            .senders
            .entry(sender)
            .or_insert_with(|| SenderQueue::new(1));

        if sequence < queue.expected {
            return Ok(vec![item]);
        }
        if sequence - queue.expected > self.max_ahead {
            return Err(OutOfWindow {
                expected: queue.expected,
                sequence,
            });
        }

        if sequence > queue.expected {
            queue.pending.entry(sequence).or_insert(item);
            queue.gap_since.get_or_insert(now);
            return Ok(Vec::new());
        }

        let mut out = vec![item];
        queue.expected = queue.expected.saturating_add(1);
        queue.release_contiguous(&mut out);
        // A new gap opens if anything is still held.
        queue.gap_since = if queue.pending.is_empty() {
            None
        } else {
            Some(now)
        };
        Ok(out)
    }

    fn gap_expired(&self, queue: &SenderQueue<T>, now: Instant) -> bool {
        queue
            .gap_since
            .is_some_and(|since| now.saturating_duration_since(since) >= self.wait)
    }

    /// Senders whose gap has been open for at least `wait`.
    pub fn expired(&self, now: Instant) -> Vec<PublicKey> {
        self.senders
            .iter()
            .filter(|(_, queue)| self.gap_expired(queue, now))
            .map(|(sender, _)| *sender)
            .collect()
    }

    /// Release `sender`'s held items if its gap is older than `wait`.
    pub fn flush_sender(&mut self, sender: &PublicKey, now: Instant) -> Vec<T> {
        let expired = self
            .senders
            .get(sender)
            .is_some_and(|queue| self.gap_expired(queue, now));
        match self.senders.get_mut(sender) {
            Some(queue) if expired => queue.release_all(),
            _ => Vec::new(),
        }
    }

    /// Release held items for every sender whose gap is older than `wait`.
    #[cfg(test)]
    pub fn flush_expired(&mut self, now: Instant) -> Vec<(PublicKey, Vec<T>)> {
        self.expired(now)
            .into_iter()
            .map(|sender| {
                let items = self.flush_sender(&sender, now);
                (sender, items)
            })
            .filter(|(_, items)| !items.is_empty())
            .collect()
    }

    /// Release everything held, regardless of age.
    pub fn drain_all(&mut self) -> Vec<(PublicKey, Vec<T>)> {
        self.senders
            .iter_mut()
            .map(|(sender, queue)| (*sender, queue.release_all()))
            .filter(|(_, items)| !items.is_empty())
            .collect()
    }

    #[cfg(test)]
    pub fn held(&self) -> usize {
        self.senders.values().map(|queue| queue.pending.len()).sum()
    }
}
