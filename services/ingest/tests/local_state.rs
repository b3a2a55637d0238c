/// On-disk state shared between ingest processes on one host and kept across
/// restarts: dedup journal, poller lease, client id, weather store.
use chrono::{TimeDelta, Utc};
use ingest::coordinator::{CoordinatorConfig, IngestionCoordinator};
use ingest::fanout::NoopChannel;
use ingest::lease::{LeaseStatus, PollerLease, SqliteLease};
use ingest::local_db::LocalDb;
use ingest::reading_dedup::{ReadingDeduplicator, SqliteDedupJournal};
use ingest::status_log::StatusLog;
use ingest::store::{SqliteStore, StoreAdapter};
use ingest::{AcceptOutcome, SkipReason, WindowState};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use wx_test_utils::{reading_at, test_station};

fn local(path: &Path) -> Arc<Mutex<LocalDb>> {
    Arc::new(Mutex::new(LocalDb::open(path).unwrap()))
}

async fn process(dir: &Path, instance: &str) -> Arc<IngestionCoordinator> {
    let store = SqliteStore::open(&dir.join("weather.sqlite3")).unwrap();
    store.upsert_station(&test_station()).await.unwrap();
    let db = local(&dir.join("local.sqlite3"));
    let dedup = Arc::new(ReadingDeduplicator::new(
        1000,
        Arc::new(SqliteDedupJournal::new(Arc::clone(&db))),
        Arc::new(NoopChannel::new()),
        instance,
    ));
    Arc::new(IngestionCoordinator::new(
        CoordinatorConfig::new(test_station().id, instance),
        Arc::new(store),
        dedup,
        Arc::new(WindowState::new(TimeDelta::hours(24))),
        Arc::new(SqliteLease::new(db)),
        StatusLog::detached(),
    ))
}

#[tokio::test]
async fn restart_restores_window_and_dedup_cache() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now().timestamp();
    {
        let first = process(dir.path(), "first").await;
        first.bootstrap().await.unwrap();
        for offset in [300, 200, 100] {
            first.accept(reading_at(now - offset)).await.unwrap();
        }
    }

    let second = process(dir.path(), "second").await;
    let report = second.bootstrap().await.unwrap();
    assert_eq!(report.journal_keys, 3);
    assert_eq!(report.window_loaded, 3);
    assert_eq!(
        second.accept(reading_at(now - 200)).await.unwrap(),
        AcceptOutcome::Skipped(SkipReason::AlreadyInWindow)
    );
}

#[tokio::test]
async fn journal_alone_suppresses_replayed_readings() {
    let dir = tempfile::tempdir().unwrap();
    // Old enough to fall outside the window, recent enough to be journaled.
    let stale = reading_at(Utc::now().timestamp() - 48 * 3600);
    {
        let first = process(dir.path(), "first").await;
        first.accept(stale.clone()).await.unwrap();
    }
    let second = process(dir.path(), "second").await;
    second.bootstrap().await.unwrap();
    assert!(second.window().is_empty());
    assert_eq!(
        second.accept(stale).await.unwrap(),
        AcceptOutcome::Skipped(SkipReason::AlreadyProcessed)
    );
}

#[tokio::test]
async fn lease_is_shared_through_the_local_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.sqlite3");
    let a = SqliteLease::new(local(&path));
    let b = SqliteLease::new(local(&path));
    let stale = Duration::from_secs(45);
    let t0 = Utc::now();

    assert_eq!(a.try_claim("a", t0, stale).await.unwrap(), LeaseStatus::Acquired);
    assert_eq!(
        b.try_claim("b", t0 + TimeDelta::seconds(30), stale).await.unwrap(),
        LeaseStatus::HeldElsewhere {
            holder: "a".to_owned()
        }
    );
    assert_eq!(
        b.try_claim("b", t0 + TimeDelta::seconds(46), stale).await.unwrap(),
        LeaseStatus::Acquired
    );
    assert_eq!(a.holder().await.unwrap().as_deref(), Some("b"));

    b.release("b").await.unwrap();
    assert_eq!(a.holder().await.unwrap(), None);
}

#[test]
fn client_id_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.sqlite3");
    let first = LocalDb::open(&path).unwrap().load_or_create_client_id().unwrap();
    let again = LocalDb::open(&path).unwrap().load_or_create_client_id().unwrap();
    assert!(first.starts_with("wx_ingest_"));
    assert_eq!(first, again);
}
