//! Multi-instance convergence: several ingest instances observing the same
//! feed, sharing one store and a sibling channel.
//!
//! # Scenarios
//! 1. A reading accepted by one instance appears in the other's window and
//!    dedup cache without the other touching the store.
//! 2. Both instances receiving the same reading produce one stored row.
//! 3. Marks from two instances in the same tick leave each cache holding the
//!    key exactly once.
//! 4. Clearing history on one instance clears every sibling's window.

use chrono::Utc;
use ingest::coordinator::{CoordinatorConfig, IngestionCoordinator};
use ingest::fanout::{InProcessChannel, SiblingChannel};
use ingest::lease::MemoryLease;
use ingest::reading_dedup::{MemoryDedupJournal, ReadingDeduplicator};
use ingest::status_log::StatusLog;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wx_telemetry::{AcceptOutcome, Reading, SkipReason, WindowState};
use wx_test_utils::{MemoryStore, reading_at};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn instance(
    id: &str,
    store: &MemoryStore,
    channel: &InProcessChannel,
    lease: &Arc<MemoryLease>,
) -> Arc<IngestionCoordinator> {
    let siblings: Arc<dyn SiblingChannel> = Arc::new(channel.clone());
    let dedup = Arc::new(ReadingDeduplicator::new(
        1000,
        Arc::new(MemoryDedupJournal::new()),
        siblings,
        id,
    ));
    Arc::new(IngestionCoordinator::new(
        CoordinatorConfig::new("stn-test", id),
        Arc::new(store.clone()),
        dedup,
        Arc::new(WindowState::default()),
        lease.clone(),
        StatusLog::detached(),
    ))
}

async fn listen(coord: &Arc<IngestionCoordinator>, shutdown: &CancellationToken) {
    tokio::spawn(Arc::clone(coord).run_sibling_listener(shutdown.clone()));
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

fn recent(offset_secs: i64) -> Reading {
    reading_at(Utc::now().timestamp() - offset_secs)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn accepted_reading_reaches_sibling_without_store_query() {
    let store = MemoryStore::new();
    let channel = InProcessChannel::new();
    let lease = Arc::new(MemoryLease::new());
    let a = instance("a", &store, &channel, &lease);
    let b = instance("b", &store, &channel, &lease);
    let shutdown = CancellationToken::new();
    listen(&b, &shutdown).await;

    let r = recent(60);
    assert_eq!(
        a.accept(r.clone()).await.unwrap(),
        AcceptOutcome::Persisted { inserted: true }
    );
    eventually(|| b.window().contains(&r.timestamp)).await;
    assert!(b.dedup().is_processed(&r.key()));

    let checks_before = store.exists_calls();
    assert_eq!(
        b.accept(r).await.unwrap(),
        AcceptOutcome::Skipped(SkipReason::AlreadyInWindow)
    );
    assert_eq!(store.exists_calls(), checks_before);
    assert_eq!(store.insert_calls(), 1);
    shutdown.cancel();
}

#[tokio::test]
async fn racing_instances_store_one_row() {
    let store = MemoryStore::new();
    let channel = InProcessChannel::new();
    let lease = Arc::new(MemoryLease::new());
    let a = instance("a", &store, &channel, &lease);
    let b = instance("b", &store, &channel, &lease);

    let r = recent(30);
    let (ra, rb) = tokio::join!(a.accept(r.clone()), b.accept(r.clone()));
    let outcomes = [ra.unwrap(), rb.unwrap()];

    assert_eq!(store.len(), 1);
    let inserted = outcomes
        .iter()
        .filter(|o| **o == AcceptOutcome::Persisted { inserted: true })
        .count();
    assert!(inserted <= 1, "at most one instance reports a fresh insert");
    assert!(a.window().contains(&r.timestamp) || b.window().contains(&r.timestamp));
}

#[tokio::test]
async fn simultaneous_marks_leave_one_entry_per_cache() {
    let store = MemoryStore::new();
    let channel = InProcessChannel::new();
    let lease = Arc::new(MemoryLease::new());
    let a = instance("a", &store, &channel, &lease);
    let b = instance("b", &store, &channel, &lease);
    let shutdown = CancellationToken::new();
    listen(&a, &shutdown).await;
    listen(&b, &shutdown).await;

    let r = recent(10);
    tokio::join!(a.dedup().mark_processed(&r), b.dedup().mark_processed(&r));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(a.dedup().len(), 1);
    assert_eq!(b.dedup().len(), 1);
    assert!(a.dedup().is_processed(&r.key()));
    assert!(b.dedup().is_processed(&r.key()));
    shutdown.cancel();
}

#[tokio::test]
async fn clear_history_propagates_to_siblings() {
    let store = MemoryStore::new();
    let channel = InProcessChannel::new();
    let lease = Arc::new(MemoryLease::new());
    let a = instance("a", &store, &channel, &lease);
    let b = instance("b", &store, &channel, &lease);
    let shutdown = CancellationToken::new();
    listen(&b, &shutdown).await;

    for offset in [90, 60, 30] {
        a.accept(recent(offset)).await.unwrap();
    }
    eventually(|| b.window().len() == 3).await;

    assert_eq!(a.clear_history().await.unwrap(), 3);
    assert!(store.is_empty());
    assert!(a.window().is_empty());
    eventually(|| b.window().is_empty()).await;
    assert!(b.dedup().is_empty());
    shutdown.cancel();
}
