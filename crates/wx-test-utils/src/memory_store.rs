//! In-memory [`StoreAdapter`] with fault injection.
//!
//! Clones share the same rows, so several coordinators built on clones of
//! one `MemoryStore` behave like processes sharing one database.

use chrono::{DateTime, Utc};
use ingest::BoxFuture;
use ingest::store::{InsertNotice, SortOrder, StoreAdapter, StoreError, StoredRow};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use wx_reading::{Reading, Station};

#[derive(Default)]
struct Faults {
    inserts: AtomicBool,
    exists: AtomicBool,
    queries: AtomicBool,
    delete_all: AtomicBool,
    /// Insert the row but report `DuplicateKey`, as when another writer won
    /// the race between the existence check and the insert.
    lose_insert_race: AtomicBool,
}

#[derive(Default)]
struct Counters {
    inserts: AtomicU64,
    exists: AtomicU64,
    queries: AtomicU64,
}

struct Inner {
    rows: Mutex<BTreeMap<DateTime<Utc>, StoredRow>>,
    stations: Mutex<Vec<Station>>,
    faults: Faults,
    counters: Counters,
    notices: broadcast::Sender<InsertNotice>,
    notify_inserts: AtomicBool,
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (notices, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                rows: Mutex::new(BTreeMap::new()),
                stations: Mutex::new(Vec::new()),
                faults: Faults::default(),
                counters: Counters::default(),
                notices,
                notify_inserts: AtomicBool::new(false),
            }),
        }
    }

    /// Offer insert notifications through `subscribe_to_inserts`.
    pub fn with_insert_notices(self) -> Self {
        self.inner.notify_inserts.store(true, Ordering::SeqCst);
        self
    }

    pub fn fail_inserts(&self, on: bool) {
        self.inner.faults.inserts.store(on, Ordering::SeqCst);
    }

    pub fn fail_exists(&self, on: bool) {
        self.inner.faults.exists.store(on, Ordering::SeqCst);
    }

    pub fn fail_queries(&self, on: bool) {
        self.inner.faults.queries.store(on, Ordering::SeqCst);
    }

    pub fn fail_delete_all(&self, on: bool) {
        self.inner.faults.delete_all.store(on, Ordering::SeqCst);
    }

    pub fn lose_insert_race(&self, on: bool) {
        self.inner.faults.lose_insert_race.store(on, Ordering::SeqCst);
    }

    /// Insert a row as some other writer would, bypassing fault injection.
    pub fn insert_external(&self, reading: &Reading, station_id: &str) {
        let row = self.row_for(reading, station_id);
        self.rows().insert(row.reading.timestamp, row);
        let _ = self.inner.notices.send(InsertNotice {
            timestamp: reading.timestamp,
        });
    }

    pub fn insert_calls(&self) -> u64 {
        self.inner.counters.inserts.load(Ordering::SeqCst)
    }

    pub fn exists_calls(&self) -> u64 {
        self.inner.counters.exists.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> u64 {
        self.inner.counters.queries.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.rows().keys().copied().collect()
    }

    pub fn stations(&self) -> Vec<Station> {
        self.inner
            .stations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn rows(&self) -> std::sync::MutexGuard<'_, BTreeMap<DateTime<Utc>, StoredRow>> {
        self.inner.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row_for(&self, reading: &Reading, station_id: &str) -> StoredRow {
        StoredRow {
            id: uuid::Uuid::new_v4().to_string(),
            reading: reading.clone().normalized(),
            station_id: station_id.to_owned(),
            created_at: Utc::now(),
        }
    }
}

fn injected(what: &str) -> StoreError {
    StoreError::Other(format!("injected {what} failure"))
}

impl StoreAdapter for MemoryStore {
    fn exists_by_timestamp<'a>(
        &'a self,
        ts: &'a DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            self.inner.counters.exists.fetch_add(1, Ordering::SeqCst);
            if self.inner.faults.exists.load(Ordering::SeqCst) {
                return Err(injected("exists"));
            }
            Ok(self.rows().contains_key(ts))
        })
    }

    fn insert_reading<'a>(
        &'a self,
        reading: &'a Reading,
        station_id: &'a str,
    ) -> BoxFuture<'a, Result<StoredRow, StoreError>> {
        Box::pin(async move {
            self.inner.counters.inserts.fetch_add(1, Ordering::SeqCst);
            if self.inner.faults.inserts.load(Ordering::SeqCst) {
                return Err(injected("insert"));
            }
            let row = self.row_for(reading, station_id);
            let ts = row.reading.timestamp;
            {
                let mut rows = self.rows();
                if rows.contains_key(&ts) {
                    return Err(StoreError::DuplicateKey(reading.key()));
                }
                rows.insert(ts, row.clone());
            }
            let _ = self.inner.notices.send(InsertNotice { timestamp: ts });
            if self.inner.faults.lose_insert_race.load(Ordering::SeqCst) {
                return Err(StoreError::DuplicateKey(reading.key()));
            }
            Ok(row)
        })
    }

    fn query_range<'a>(
        &'a self,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
        order: SortOrder,
    ) -> BoxFuture<'a, Result<Vec<StoredRow>, StoreError>> {
        Box::pin(async move {
            self.inner.counters.queries.fetch_add(1, Ordering::SeqCst);
            if self.inner.faults.queries.load(Ordering::SeqCst) {
                return Err(injected("query"));
            }
            let mut out: Vec<StoredRow> = self
                .rows()
                .range(from..)
                .filter(|(ts, _)| to.is_none_or(|to| **ts <= to))
                .map(|(_, row)| row.clone())
                .collect();
            if order == SortOrder::Descending {
                out.reverse();
            }
            Ok(out)
        })
    }

    fn delete_all(&self) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move {
            if self.inner.faults.delete_all.load(Ordering::SeqCst) {
                return Err(injected("delete"));
            }
            let mut rows = self.rows();
            let n = rows.len() as u64;
            rows.clear();
            Ok(n)
        })
    }

    fn upsert_station<'a>(&'a self, station: &'a Station) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut stations = self
                .inner
                .stations
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            stations.retain(|s| s.id != station.id);
            stations.push(station.clone());
            Ok(())
        })
    }

    fn subscribe_to_inserts(&self) -> Option<broadcast::Receiver<InsertNotice>> {
        self.inner
            .notify_inserts
            .load(Ordering::SeqCst)
            .then(|| self.inner.notices.subscribe())
    }
}
