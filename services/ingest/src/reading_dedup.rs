//! Cross-instance reading deduplication.
//!
//! Keyed by the reading's canonical timestamp.  Three layers keep sibling
//! instances in agreement:
//! 1. an in-memory [`BoundedFifoSet`] consulted on every accept,
//! 2. a durable [`DedupJournal`] so a restart resumes with a warm cache,
//! 3. the sibling fan-out, so other instances learn about a reading without
//!    touching the store.
//!
//! Losing layer 3 degrades to per-instance dedup; the store's unique
//! constraint still prevents double inserts.

use crate::BoxFuture;
use crate::bounded_set::BoundedFifoSet;
use crate::fanout::{SiblingChannel, SiblingEvent, SiblingMessage};
use crate::local_db::{LocalDb, LocalDbError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};
use wx_reading::Reading;

pub const DEFAULT_READING_DEDUP_CAPACITY: usize = 1000;

// ---------------------------------------------------------------------------
// Durable journal
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("dedup journal: {0}")]
    Storage(#[from] LocalDbError),
}

pub trait DedupJournal: Send + Sync {
    /// At most `cap` most recent keys, oldest first.
    fn load(&self, cap: usize) -> BoxFuture<'_, Result<Vec<String>, JournalError>>;
    fn append<'a>(&'a self, key: &'a str, cap: usize) -> BoxFuture<'a, Result<(), JournalError>>;
    fn clear(&self) -> BoxFuture<'_, Result<(), JournalError>>;
}

pub struct SqliteDedupJournal {
    db: Arc<Mutex<LocalDb>>,
}

impl SqliteDedupJournal {
    pub fn new(db: Arc<Mutex<LocalDb>>) -> Self {
        Self { db }
    }
}

impl DedupJournal for SqliteDedupJournal {
    fn load(&self, cap: usize) -> BoxFuture<'_, Result<Vec<String>, JournalError>> {
        Box::pin(async move { Ok(self.db.lock().await.load_processed(cap)?) })
    }

    fn append<'a>(&'a self, key: &'a str, cap: usize) -> BoxFuture<'a, Result<(), JournalError>> {
        Box::pin(async move { Ok(self.db.lock().await.append_processed(key, cap)?) })
    }

    fn clear(&self) -> BoxFuture<'_, Result<(), JournalError>> {
        Box::pin(async move { Ok(self.db.lock().await.clear_processed()?) })
    }
}

#[derive(Default)]
pub struct MemoryDedupJournal {
    keys: Mutex<Vec<String>>,
}

impl MemoryDedupJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DedupJournal for MemoryDedupJournal {
    fn load(&self, cap: usize) -> BoxFuture<'_, Result<Vec<String>, JournalError>> {
        Box::pin(async move {
            let keys = self.keys.lock().await;
            Ok(keys[keys.len().saturating_sub(cap)..].to_vec())
        })
    }

    fn append<'a>(&'a self, key: &'a str, cap: usize) -> BoxFuture<'a, Result<(), JournalError>> {
        Box::pin(async move {
            let mut keys = self.keys.lock().await;
            if !keys.iter().any(|k| k == key) {
                keys.push(key.to_owned());
            }
            let excess = keys.len().saturating_sub(cap);
            keys.drain(..excess);
            Ok(())
        })
    }

    fn clear(&self) -> BoxFuture<'_, Result<(), JournalError>> {
        Box::pin(async move {
            self.keys.lock().await.clear();
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Deduplicator
// ---------------------------------------------------------------------------

/// What applying a sibling message changed locally.
#[derive(Debug, Clone, PartialEq)]
pub enum SiblingApplied {
    /// Our own message echoed back, or nothing to do.
    Ignored,
    Processed {
        key: String,
        newly_seen: bool,
        reading: Option<Reading>,
    },
    Cleared,
}

pub struct ReadingDeduplicator {
    cache: std::sync::Mutex<BoundedFifoSet<String>>,
    capacity: usize,
    journal: Arc<dyn DedupJournal>,
    siblings: Arc<dyn SiblingChannel>,
    instance_id: String,
    fanout_degraded: AtomicBool,
}

impl ReadingDeduplicator {
    pub fn new(
        capacity: usize,
        journal: Arc<dyn DedupJournal>,
        siblings: Arc<dyn SiblingChannel>,
        instance_id: impl Into<String>,
    ) -> Self {
        let cache = BoundedFifoSet::new(capacity);
        Self {
            capacity: cache.capacity(),
            cache: std::sync::Mutex::new(cache),
            journal,
            siblings,
            instance_id: instance_id.into(),
            fanout_degraded: AtomicBool::new(false),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn with_cache<R>(&self, f: impl FnOnce(&mut BoundedFifoSet<String>) -> R) -> R {
        let mut guard = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Warm the cache from the durable journal.  Returns the number of keys
    /// loaded.
    pub async fn load_from_journal(&self) -> Result<usize, JournalError> {
        let keys = self.journal.load(self.capacity).await?;
        let n = keys.len();
        self.with_cache(|c| c.extend(keys));
        info!(loaded = n, "reading dedup cache restored");
        Ok(n)
    }

    pub fn is_processed(&self, key: &str) -> bool {
        self.with_cache(|c| c.contains(&key.to_owned()))
    }

    /// Record `reading` as processed, persist the key and tell siblings.
    ///
    /// Idempotent: a key already in the cache is neither journaled nor
    /// broadcast again.  Returns whether the key was new.
    pub async fn mark_processed(&self, reading: &Reading) -> bool {
        let key = reading.key();
        if !self.with_cache(|c| c.insert(key.clone())) {
            return false;
        }
        if let Err(e) = self.journal.append(&key, self.capacity).await {
            warn!(error = %e, timestamp = %key, "failed to journal processed reading");
        }
        self.broadcast(SiblingEvent::Processed {
            timestamp: key,
            reading: Some(reading.clone()),
        });
        true
    }

    /// Add keys to the in-memory cache only (initial bulk load from the
    /// store; the rows themselves are the durable record).
    pub fn seed<I: IntoIterator<Item = String>>(&self, keys: I) {
        self.with_cache(|c| c.extend(keys));
    }

    /// Wipe cache and journal, then tell siblings to do the same.
    pub async fn clear(&self) {
        self.with_cache(|c| c.clear());
        if let Err(e) = self.journal.clear().await {
            warn!(error = %e, "failed to clear dedup journal");
        }
        self.broadcast(SiblingEvent::Cleared);
    }

    /// Apply a message received from the sibling fan-out.
    pub fn apply_sibling(&self, msg: &SiblingMessage) -> SiblingApplied {
        if msg.origin == self.instance_id {
            return SiblingApplied::Ignored;
        }
        match &msg.event {
            SiblingEvent::Processed { timestamp, reading } => {
                let newly_seen = self.with_cache(|c| c.insert(timestamp.clone()));
                debug!(origin = %msg.origin, timestamp = %timestamp, newly_seen, "sibling processed");
                SiblingApplied::Processed {
                    key: timestamp.clone(),
                    newly_seen,
                    reading: reading.clone(),
                }
            }
            SiblingEvent::Cleared => {
                self.with_cache(|c| c.clear());
                info!(origin = %msg.origin, "sibling cleared history");
                SiblingApplied::Cleared
            }
        }
    }

    pub fn subscribe_siblings(&self) -> broadcast::Receiver<SiblingMessage> {
        self.siblings.subscribe()
    }

    pub fn len(&self) -> usize {
        self.with_cache(|c| c.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn broadcast(&self, event: SiblingEvent) {
        let msg = SiblingMessage {
            origin: self.instance_id.clone(),
            event,
        };
        match self.siblings.publish(msg) {
            Ok(()) => {
                if self.fanout_degraded.swap(false, Ordering::Relaxed) {
                    info!("sibling fan-out restored");
                }
            }
            Err(e) => {
                if !self.fanout_degraded.swap(true, Ordering::Relaxed) {
                    warn!(error = %e, "sibling fan-out unavailable; dedup is per-instance");
                } else {
                    debug!(error = %e, "sibling fan-out still unavailable");
                }
            }
        }
    }
}
