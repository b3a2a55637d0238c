//! Behaviour while the shared store is unreachable, and recovery after it
//! comes back.

use chrono::Utc;
use ingest::coordinator::{CoordinatorConfig, IngestionCoordinator};
use ingest::fanout::NoopChannel;
use ingest::lease::MemoryLease;
use ingest::reading_dedup::{MemoryDedupJournal, ReadingDeduplicator};
use ingest::status_log::StatusLog;
use std::sync::Arc;
use wx_telemetry::{AcceptOutcome, IngestError, SkipReason, WindowState};
use wx_test_utils::{MemoryStore, reading_at};

fn coordinator(store: &MemoryStore) -> IngestionCoordinator {
    let dedup = Arc::new(ReadingDeduplicator::new(
        1000,
        Arc::new(MemoryDedupJournal::new()),
        Arc::new(NoopChannel::new()),
        "solo",
    ));
    IngestionCoordinator::new(
        CoordinatorConfig::new("stn-test", "solo"),
        Arc::new(store.clone()),
        dedup,
        Arc::new(WindowState::default()),
        Arc::new(MemoryLease::new()),
        StatusLog::detached(),
    )
}

#[tokio::test]
async fn failed_write_stays_visible_and_is_retried() {
    let store = MemoryStore::new();
    let coord = coordinator(&store);
    let r = reading_at(Utc::now().timestamp() - 30);

    store.fail_inserts(true);
    let outcome = coord.accept(r.clone()).await.unwrap();
    assert!(matches!(outcome, AcceptOutcome::PersistFailed { .. }));
    assert!(coord.window().contains(&r.timestamp));
    assert!(coord.dedup().is_processed(&r.key()));
    assert_eq!(coord.pending_count(), 1);
    assert!(store.is_empty());

    // Redelivery while the store is still down does not queue twice.
    assert_eq!(
        coord.accept(r.clone()).await.unwrap(),
        AcceptOutcome::Skipped(SkipReason::AlreadyInWindow)
    );
    let report = coord.resync_pending().await;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.still_pending, 1);

    store.fail_inserts(false);
    let tick = coord.poll_once(Utc::now()).await;
    assert_eq!(tick.resync.persisted, 1);
    assert_eq!(tick.resync.still_pending, 0);
    assert_eq!(store.timestamps(), vec![r.timestamp]);
    assert_eq!(coord.pending_count(), 0);
}

#[tokio::test]
async fn existence_check_failure_is_a_persist_failure() {
    let store = MemoryStore::new();
    let coord = coordinator(&store);
    store.fail_exists(true);

    let outcome = coord
        .accept(reading_at(Utc::now().timestamp() - 10))
        .await
        .unwrap();
    assert!(matches!(outcome, AcceptOutcome::PersistFailed { .. }));
    assert_eq!(store.insert_calls(), 0);
    assert_eq!(coord.pending_count(), 1);
}

#[tokio::test]
async fn lost_insert_race_counts_as_persisted() {
    let store = MemoryStore::new();
    let coord = coordinator(&store);
    store.lose_insert_race(true);

    let r = reading_at(Utc::now().timestamp() - 10);
    assert_eq!(
        coord.accept(r.clone()).await.unwrap(),
        AcceptOutcome::Persisted { inserted: false }
    );
    assert_eq!(coord.pending_count(), 0);
    assert!(coord.window().contains(&r.timestamp));
}

#[tokio::test]
async fn bootstrap_fails_when_store_cannot_be_queried() {
    let store = MemoryStore::new();
    store.insert_external(&reading_at(Utc::now().timestamp() - 60), "stn-test");
    let coord = coordinator(&store);

    store.fail_queries(true);
    assert!(matches!(coord.bootstrap().await, Err(IngestError::Store(_))));
    assert!(coord.window().is_empty());

    store.fail_queries(false);
    let report = coord.bootstrap().await.unwrap();
    assert_eq!(report.window_loaded, 1);
}

#[tokio::test]
async fn failed_clear_leaves_local_state_untouched() {
    let store = MemoryStore::new();
    let coord = coordinator(&store);
    let r = reading_at(Utc::now().timestamp() - 10);
    coord.accept(r.clone()).await.unwrap();

    store.fail_delete_all(true);
    let err = coord.clear_history().await.unwrap_err();
    assert!(matches!(err, IngestError::BulkDelete(_)));
    assert!(err.to_string().contains("bulk delete"));
    assert_eq!(store.len(), 1);
    assert!(coord.window().contains(&r.timestamp));
    assert!(coord.dedup().is_processed(&r.key()));
}
