//! Two ingest processes sharing one SQLite weather database.

use chrono::{TimeDelta, Utc};
use ingest::coordinator::{CoordinatorConfig, IngestionCoordinator};
use ingest::fanout::NoopChannel;
use ingest::lease::MemoryLease;
use ingest::reading_dedup::{MemoryDedupJournal, ReadingDeduplicator};
use ingest::status_log::StatusLog;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use wx_telemetry::store::{SortOrder, SqliteStore, StoreAdapter, StoreError};
use wx_telemetry::{AcceptOutcome, SkipReason, WindowState};
use wx_test_utils::{reading_at, test_station};

async fn open(path: &Path) -> SqliteStore {
    let store = SqliteStore::open(path).unwrap();
    store.upsert_station(&test_station()).await.unwrap();
    store
}

fn coordinator(id: &str, store: SqliteStore) -> IngestionCoordinator {
    let dedup = Arc::new(ReadingDeduplicator::new(
        1000,
        Arc::new(MemoryDedupJournal::new()),
        Arc::new(NoopChannel::new()),
        id,
    ));
    IngestionCoordinator::new(
        CoordinatorConfig::new(test_station().id, id),
        Arc::new(store),
        dedup,
        Arc::new(WindowState::default()),
        Arc::new(MemoryLease::new()),
        StatusLog::detached(),
    )
}

#[tokio::test]
async fn reading_written_by_one_process_is_fetched_by_the_other() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weather.sqlite3");
    let a = coordinator("a", open(&path).await);
    let b = coordinator("b", open(&path).await);
    let now = Utc::now().timestamp();

    b.bootstrap().await.unwrap();
    let r = reading_at(now - 45);
    assert_eq!(
        a.accept(r.clone()).await.unwrap(),
        AcceptOutcome::Persisted { inserted: true }
    );

    let report = b.fetch_missed().await.unwrap();
    assert_eq!(report.applied, 1);
    assert!(b.window().contains(&r.timestamp));
    assert_eq!(
        b.accept(r).await.unwrap(),
        AcceptOutcome::Skipped(SkipReason::AlreadyInWindow)
    );
}

#[tokio::test]
async fn cold_sibling_sees_existing_row_and_does_not_insert() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weather.sqlite3");
    let a = coordinator("a", open(&path).await);
    let b_store = open(&path).await;
    let b = coordinator("b", b_store.clone());

    let r = reading_at(Utc::now().timestamp() - 20);
    a.accept(r.clone()).await.unwrap();
    assert_eq!(
        b.accept(r).await.unwrap(),
        AcceptOutcome::Persisted { inserted: false }
    );
    assert_eq!(b_store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn timestamp_collision_is_a_duplicate_key() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weather.sqlite3");
    let first = open(&path).await;
    let second = open(&path).await;
    let r = reading_at(Utc::now().timestamp() - 5);

    first.insert_reading(&r, "stn-test").await.unwrap();
    let err = second.insert_reading(&r, "stn-test").await.unwrap_err();
    assert!(matches!(err, StoreError::DuplicateKey(_)));
    assert!(err.is_duplicate());
}

#[tokio::test]
async fn clearing_through_one_handle_empties_both() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weather.sqlite3");
    let a = coordinator("a", open(&path).await);
    let other = open(&path).await;
    let now = Utc::now();

    for offset in [30, 20, 10] {
        a.accept(reading_at(now.timestamp() - offset)).await.unwrap();
    }
    let rows = other
        .query_range(now - TimeDelta::hours(1), None, SortOrder::Descending)
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows[0].reading.timestamp > rows[2].reading.timestamp);

    assert_eq!(a.clear_history().await.unwrap(), 3);
    assert_eq!(other.count().await.unwrap(), 0);
}

#[tokio::test]
async fn database_is_opened_in_wal_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weather.sqlite3");
    let _store = open(&path).await;

    let conn = Connection::open(&path).unwrap();
    let mode: String = conn
        .pragma_query_value(None, "journal_mode", |row| row.get(0))
        .unwrap();
    assert_eq!(mode.to_lowercase(), "wal");
    let stations: i64 = conn
        .query_row("SELECT COUNT(*) FROM stations", [], |row| row.get(0))
        .unwrap();
    assert_eq!(stations, 1);
}
