//! Persistence boundary for weather readings.
//!
//! The coordinator only talks to [`StoreAdapter`]; [`SqliteStore`] is the
//! production implementation and `wx-test-utils` provides an in-memory one
//! with fault injection.

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::BoxFuture;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use wx_reading::{Reading, Station};

/// A persisted reading row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRow {
    pub id: String,
    #[serde(flatten)]
    pub reading: Reading,
    pub station_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A row with the same reading timestamp already exists.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("store error: {0}")]
    Other(String),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::DuplicateKey(_))
    }
}

/// Push notification emitted after a row is inserted (by any writer the
/// adapter can observe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertNotice {
    pub timestamp: DateTime<Utc>,
}

pub trait StoreAdapter: Send + Sync {
    fn exists_by_timestamp<'a>(
        &'a self,
        ts: &'a DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Insert one reading.  A timestamp collision must surface as
    /// [`StoreError::DuplicateKey`].
    fn insert_reading<'a>(
        &'a self,
        reading: &'a Reading,
        station_id: &'a str,
    ) -> BoxFuture<'a, Result<StoredRow, StoreError>>;

    /// Rows with `from <= timestamp` and, when given, `timestamp <= to`.
    fn query_range<'a>(
        &'a self,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
        order: SortOrder,
    ) -> BoxFuture<'a, Result<Vec<StoredRow>, StoreError>>;

    /// Remove every reading.  Returns the number of rows deleted.
    fn delete_all(&self) -> BoxFuture<'_, Result<u64, StoreError>>;

    fn upsert_station<'a>(&'a self, station: &'a Station) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Optional insert hint stream.
    fn subscribe_to_inserts(&self) -> Option<broadcast::Receiver<InsertNotice>> {
        None
    }
}
