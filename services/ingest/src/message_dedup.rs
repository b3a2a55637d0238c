//! Per-connection message deduplication.
//!
//! Guards against broker redelivery within one connection.  Keyed by a
//! message identifier derived from transport metadata, capped at
//! [`DEFAULT_MESSAGE_DEDUP_CAPACITY`] with FIFO eviction, and reset whenever a
//! fresh connection is established.  Cross-process duplicates are the job of
//! [`crate::reading_dedup`].

use crate::bounded_set::BoundedFifoSet;
use std::fmt;

pub const DEFAULT_MESSAGE_DEDUP_CAPACITY: usize = 500;

/// Broker-level identity of one delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive an identifier from delivery metadata.
    ///
    /// - QoS > 0 with a non-zero packet id: `topic#pkid`.
    /// - Otherwise the payload's raw timestamp token: `topic-<timestamp>`.
    /// - Neither available: `None`; the message is not filtered at this layer.
    pub fn derive(topic: &str, pkid: u16, acknowledged_qos: bool, payload: &[u8]) -> Option<Self> {
        if acknowledged_qos && pkid != 0 {
            return Some(Self(format!("{topic}#{pkid}")));
        }
        wx_reading::peek_timestamp(payload).map(|ts| Self(format!("{topic}-{ts}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct MessageDeduplicator {
    seen: BoundedFifoSet<MessageId>,
}

impl MessageDeduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: BoundedFifoSet::new(capacity),
        }
    }

    pub fn seen(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }

    pub fn record(&mut self, id: MessageId) {
        self.seen.insert(id);
    }

    /// Check and record in one step.  Returns `true` when the message should
    /// be processed.  Messages without an identifier always pass.
    pub fn admit(&mut self, id: Option<&MessageId>) -> bool {
        match id {
            Some(id) => self.seen.insert(id.clone()),
            None => true,
        }
    }

    /// Forget everything; called when a new connection is established.
    pub fn reset(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for MessageDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_MESSAGE_DEDUP_CAPACITY)
    }
}
