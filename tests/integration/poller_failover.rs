//! Active-poller election across instances sharing one lease cell.
//!
//! # Scenarios
//! 1. Only the lease holder fetches missed readings.
//! 2. When the holder stops renewing, a sibling takes over after the lease
//!    goes stale (1.5 x poll interval) and catches up from the store.
//! 3. Store insert hints trigger an immediate fetch on the poller.
//! 4. A stopped poller releases its lease.
//! 5. The poller's own inserts do not trigger a catch-up query.

use chrono::{DateTime, TimeDelta, Utc};
use ingest::coordinator::{CoordinatorConfig, IngestionCoordinator};
use ingest::fanout::NoopChannel;
use ingest::lease::{LeaseStatus, MemoryLease, PollerLease};
use ingest::reading_dedup::{MemoryDedupJournal, ReadingDeduplicator};
use ingest::status_log::StatusLog;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wx_telemetry::WindowState;
use wx_test_utils::{MemoryStore, reading_at};

fn instance(id: &str, store: &MemoryStore, lease: &Arc<MemoryLease>) -> Arc<IngestionCoordinator> {
    let dedup = Arc::new(ReadingDeduplicator::new(
        1000,
        Arc::new(MemoryDedupJournal::new()),
        Arc::new(NoopChannel::new()),
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

fn secs(t0: DateTime<Utc>, s: i64) -> DateTime<Utc> {
    t0 + TimeDelta::seconds(s)
}

#[tokio::test]
async fn only_the_holder_fetches_and_a_sibling_takes_over_when_it_dies() {
    let store = MemoryStore::new();
    let lease = Arc::new(MemoryLease::new());
    let a = instance("a", &store, &lease);
    let b = instance("b", &store, &lease);
    let t0 = Utc::now();
    let base = t0.timestamp();

    let tick_a = a.poll_once(t0).await;
    assert_eq!(tick_a.lease, Some(LeaseStatus::Acquired));
    let tick_b = b.poll_once(t0).await;
    assert_eq!(
        tick_b.lease,
        Some(LeaseStatus::HeldElsewhere {
            holder: "a".to_owned()
        })
    );
    assert!(tick_b.fetch.is_none());
    assert!(a.is_active_poller());
    assert!(!b.is_active_poller());

    // A reading written by some other writer while nobody was live.
    store.insert_external(&reading_at(base - 120), "stn-test");
    let tick_a = a.poll_once(secs(t0, 30)).await;
    assert_eq!(tick_a.lease, Some(LeaseStatus::Renewed));
    assert_eq!(tick_a.fetch.map(|f| f.applied), Some(1));
    assert_eq!(a.window().len(), 1);

    // `a` goes silent.  Its claim at +30s is still fresh at +70s.
    store.insert_external(&reading_at(base - 60), "stn-test");
    let tick_b = b.poll_once(secs(t0, 70)).await;
    assert!(matches!(tick_b.lease, Some(LeaseStatus::HeldElsewhere { .. })));
    assert!(b.window().is_empty());

    // Stale after 45s: +76s is past +30s + 45s.
    let tick_b = b.poll_once(secs(t0, 76)).await;
    assert_eq!(tick_b.lease, Some(LeaseStatus::Acquired));
    assert_eq!(tick_b.fetch.map(|f| f.fetched), Some(2));
    assert_eq!(b.window().len(), 2);
    assert!(b.is_active_poller());

    // `a` comes back and finds the lease gone.
    let tick_a = a.poll_once(secs(t0, 80)).await;
    assert!(matches!(tick_a.lease, Some(LeaseStatus::HeldElsewhere { .. })));
    assert!(!a.is_active_poller());
}

#[tokio::test]
async fn insert_hint_triggers_immediate_fetch() {
    let store = MemoryStore::new().with_insert_notices();
    let lease = Arc::new(MemoryLease::new());
    let poller = instance("poller", &store, &lease);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&poller).run_poller(shutdown.clone()));

    for _ in 0..100 {
        if poller.is_active_poller() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(poller.is_active_poller());

    let r = reading_at(Utc::now().timestamp() - 5);
    store.insert_external(&r, "stn-test");
    // Well inside the 5s lease-check interval, so only the hint can explain it.
    for _ in 0..100 {
        if poller.window().contains(&r.timestamp) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(poller.window().contains(&r.timestamp));

    shutdown.cancel();
    task.await.unwrap();
    assert_eq!(lease.holder().await.unwrap(), None, "lease released on stop");
    assert!(!poller.is_active_poller());
}

#[tokio::test]
async fn own_accepts_do_not_trigger_hinted_fetches() {
    let store = MemoryStore::new().with_insert_notices();
    let lease = Arc::new(MemoryLease::new());
    let poller = instance("poller", &store, &lease);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&poller).run_poller(shutdown.clone()));

    for _ in 0..100 {
        if poller.is_active_poller() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(poller.is_active_poller());
    tokio::time::sleep(Duration::from_millis(50)).await;
    let queries = store.query_calls();

    let base = Utc::now().timestamp();
    for offset in [30, 20, 10] {
        poller.accept(reading_at(base - offset)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.len(), 3);
    assert_eq!(store.query_calls(), queries, "no catch-up query for own inserts");

    shutdown.cancel();
    task.await.unwrap();
}
