//! Ingestion coordinator.
//!
//! Drives one reading through dedup, persistence and the rolling window, and
//! runs the elected-poller loop that catches readings the live feed missed.
//!
//! Per-reading states:
//!
//! ```text
//! Received -> DedupChecked -> Skipped
//!                          -> PersistAttempted -> Persisted    -> WindowUpdated
//!                                              -> PersistFailed -> WindowUpdated
//! ```
//!
//! The store is written at most once per timestamp; the window is updated
//! even when persistence fails, and failed readings are retried by
//! [`IngestionCoordinator::resync_pending`].

use crate::fanout::SiblingMessage;
use crate::lease::{LeaseStatus, PollerLease, stale_after};
use crate::reading_dedup::{ReadingDeduplicator, SiblingApplied};
use crate::status_log::StatusLog;
use crate::store::{SortOrder, StoreAdapter, StoreError};
use crate::window::{WindowInsert, WindowState};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wx_reading::{Reading, in_supported_range};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_LEASE_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_PENDING_CAPACITY: usize = 1000;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub station_id: String,
    pub instance_id: String,
    pub poll_interval: Duration,
    pub lease_check_interval: Duration,
    /// Cap on readings awaiting a persistence retry.
    pub pending_capacity: usize,
}

impl CoordinatorConfig {
    pub fn new(station_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            station_id: station_id.into(),
            instance_id: instance_id.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            lease_check_interval: DEFAULT_LEASE_CHECK_INTERVAL,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyProcessed,
    AlreadyInWindow,
    /// Another accept of the same timestamp is still running in this process.
    InFlight,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AcceptOutcome {
    Skipped(SkipReason),
    /// `inserted` is false when the row already existed (sibling won the race).
    Persisted { inserted: bool },
    /// Store write failed; the reading is in the window and queued for retry.
    PersistFailed { error: StoreError },
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("reading {0} has non-finite values")]
    InvalidReading(String),
    #[error("reading {0} is outside the supported time range")]
    OutOfRange(String),
    #[error("store: {0}")]
    Store(#[source] StoreError),
    #[error("bulk delete failed: {0}")]
    BulkDelete(#[source] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub journal_keys: usize,
    pub window_loaded: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub fetched: usize,
    pub applied: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub attempted: usize,
    pub persisted: usize,
    pub still_pending: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTick {
    pub lease: Option<LeaseStatus>,
    pub fetch: Option<FetchReport>,
    pub resync: ResyncReport,
}

/// Removes the key from the in-flight set on drop.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

pub struct IngestionCoordinator {
    config: CoordinatorConfig,
    store: Arc<dyn StoreAdapter>,
    dedup: Arc<ReadingDeduplicator>,
    window: Arc<WindowState>,
    lease: Arc<dyn PollerLease>,
    status: StatusLog,
    clock: Clock,
    in_flight: Mutex<HashSet<String>>,
    pending: Mutex<BTreeMap<String, Reading>>,
    last_fetch: Mutex<Option<DateTime<Utc>>>,
    polling: AtomicBool,
}

impl IngestionCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn StoreAdapter>,
        dedup: Arc<ReadingDeduplicator>,
        window: Arc<WindowState>,
        lease: Arc<dyn PollerLease>,
        status: StatusLog,
    ) -> Self {
        Self {
            config,
            store,
            dedup,
            window,
            lease,
            status,
            clock: Arc::new(Utc::now),
            in_flight: Mutex::new(HashSet::new()),
            pending: Mutex::new(BTreeMap::new()),
            last_fetch: Mutex::new(None),
            polling: AtomicBool::new(false),
        }
    }

    /// Replace the wall clock (tests pin it near their fixture timestamps).
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn window(&self) -> &Arc<WindowState> {
        &self.window
    }

    pub fn dedup(&self) -> &Arc<ReadingDeduplicator> {
        &self.dedup
    }

    pub fn status_log(&self) -> &StatusLog {
        &self.status
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Whether this instance held the poller lease at its last check.
    pub fn is_active_poller(&self) -> bool {
        self.polling.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    // -----------------------------------------------------------------------
    // Live path
    // -----------------------------------------------------------------------

    pub async fn accept(&self, reading: Reading) -> Result<AcceptOutcome, IngestError> {
        let reading = reading.normalized();
        let key = reading.key();
        if !reading.all_finite() {
            return Err(IngestError::InvalidReading(key));
        }
        if !in_supported_range(&reading.timestamp) {
            return Err(IngestError::OutOfRange(key));
        }
        if self.window.contains(&reading.timestamp) {
            return Ok(AcceptOutcome::Skipped(SkipReason::AlreadyInWindow));
        }
        if self.dedup.is_processed(&key) {
            return Ok(AcceptOutcome::Skipped(SkipReason::AlreadyProcessed));
        }
        let Some(_guard) = self.begin(&key) else {
            return Ok(AcceptOutcome::Skipped(SkipReason::InFlight));
        };

        let persisted = self.persist(&reading).await;

        let now = self.now();
        if self.window.insert(reading.clone(), now) == WindowInsert::Expired {
            debug!(timestamp = %key, "reading older than retention; not windowed");
        }
        self.dedup.mark_processed(&reading).await;

        match persisted {
            Ok(inserted) => {
                debug!(timestamp = %key, inserted, "reading accepted");
                Ok(AcceptOutcome::Persisted { inserted })
            }
            Err(error) => {
                self.queue_pending(key.clone(), reading);
                self.status
                    .warn(format!("Reading {key} not saved ({error}); will retry"));
                Ok(AcceptOutcome::PersistFailed { error })
            }
        }
    }

    fn begin(&self, key: &str) -> Option<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(key.to_owned()) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            key: key.to_owned(),
        })
    }

    /// Existence check, then insert.  `Ok(false)` means the row was already
    /// there, either before the check or by a concurrent writer.
    async fn persist(&self, reading: &Reading) -> Result<bool, StoreError> {
        if self.store.exists_by_timestamp(&reading.timestamp).await? {
            return Ok(false);
        }
        match self
            .store
            .insert_reading(reading, &self.config.station_id)
            .await
        {
            Ok(_) => Ok(true),
            Err(StoreError::DuplicateKey(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn queue_pending(&self, key: String, reading: Reading) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.insert(key, reading);
        while pending.len() > self.config.pending_capacity {
            if let Some((dropped, _)) = pending.pop_first() {
                warn!(timestamp = %dropped, "pending retry queue full; dropping oldest");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Catch-up path
    // -----------------------------------------------------------------------

    /// Restore the dedup cache from its journal, then load the retention
    /// period from the store into the window.
    pub async fn bootstrap(&self) -> Result<BootstrapReport, IngestError> {
        let journal_keys = match self.dedup.load_from_journal().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "dedup journal unavailable; starting cold");
                0
            }
        };
        let now = self.now();
        let rows = self
            .store
            .query_range(now - self.window.retention(), None, SortOrder::Ascending)
            .await
            .map_err(IngestError::Store)?;
        let keys: Vec<String> = rows.iter().map(|r| r.reading.key()).collect();
        let window_loaded = self
            .window
            .reload(rows.into_iter().map(|r| r.reading), now);
        self.dedup.seed(keys);
        info!(journal_keys, window_loaded, "bootstrap complete");
        Ok(BootstrapReport {
            journal_keys,
            window_loaded,
        })
    }

    /// Pull rows newer than the newest windowed reading (or the whole
    /// retention period when the window is empty) and apply them.
    ///
    /// The start is clamped to `now`, so a reading stamped ahead of the
    /// wall clock cannot stall catch-up until that time arrives.
    pub async fn fetch_missed(&self) -> Result<FetchReport, IngestError> {
        let now = self.now();
        let from = match self.window.newest_timestamp() {
            Some(ts) => ts
                .checked_add_signed(TimeDelta::milliseconds(1))
                .unwrap_or(ts)
                .min(now),
            None => now - self.window.retention(),
        };
        let rows = self
            .store
            .query_range(from, None, SortOrder::Ascending)
            .await
            .map_err(IngestError::Store)?;
        let mut report = FetchReport {
            fetched: rows.len(),
            applied: 0,
        };
        for row in rows {
            if self.absorb_stored(row.reading, now).await {
                report.applied += 1;
            }
        }
        if report.applied > 0 {
            info!(fetched = report.fetched, applied = report.applied, "caught up missed readings");
        }
        Ok(report)
    }

    /// Apply a reading that is already in the store.  Never writes to the
    /// store.  Returns whether the window changed.
    async fn absorb_stored(&self, reading: Reading, now: DateTime<Utc>) -> bool {
        let key = reading.key();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        let inserted = self.window.insert(reading.clone(), now) == WindowInsert::Inserted;
        self.dedup.mark_processed(&reading).await;
        inserted
    }

    /// Retry persistence of readings whose store write failed earlier.
    pub async fn resync_pending(&self) -> ResyncReport {
        let queued: Vec<(String, Reading)> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect();
        let mut report = ResyncReport {
            attempted: queued.len(),
            ..Default::default()
        };
        for (key, reading) in queued {
            match self.persist(&reading).await {
                Ok(inserted) => {
                    self.pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&key);
                    report.persisted += 1;
                    debug!(timestamp = %key, inserted, "pending reading persisted");
                }
                Err(e) => {
                    debug!(timestamp = %key, error = %e, "pending reading still not persisted");
                }
            }
        }
        report.still_pending = self.pending_count();
        if report.persisted > 0 {
            self.status
                .info(format!("Saved {} previously unsaved reading(s)", report.persisted));
        }
        report
    }

    /// Delete every stored reading, then reset local state.
    ///
    /// On store failure local state is left untouched.
    pub async fn clear_history(&self) -> Result<u64, IngestError> {
        let deleted = match self.store.delete_all().await {
            Ok(n) => n,
            Err(e) => {
                self.status.error(format!("Clearing history failed: {e}"));
                return Err(IngestError::BulkDelete(e));
            }
        };
        self.window.clear();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.dedup.clear().await;
        self.status.info(format!("History cleared ({deleted} rows)"));
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Poller election
    // -----------------------------------------------------------------------

    /// One lease-check tick: claim or renew the lease, fetch if this
    /// instance is the poller and a poll is due, then retry pending writes.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> PollTick {
        let stale = stale_after(self.config.poll_interval);
        let lease = match self
            .lease
            .try_claim(&self.config.instance_id, now, stale)
            .await
        {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(error = %e, "poller lease check failed");
                None
            }
        };
        let holding = lease.as_ref().is_some_and(LeaseStatus::is_held);
        let was = self.polling.swap(holding, Ordering::SeqCst);
        match (&lease, was) {
            (Some(LeaseStatus::Acquired), _) | (Some(LeaseStatus::Renewed), false) => {
                info!(instance = %self.config.instance_id, "became active poller");
            }
            (Some(LeaseStatus::HeldElsewhere { holder }), true) => {
                info!(holder = %holder, "poller lease taken over by sibling");
            }
            _ => {}
        }

        let mut fetch = None;
        if holding && self.poll_due(now) {
            match self.fetch_missed().await {
                Ok(report) => {
                    *self.last_fetch.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
                    fetch = Some(report);
                }
                Err(e) => warn!(error = %e, "fetch of missed readings failed"),
            }
        }
        let resync = self.resync_pending().await;
        self.window.evict_expired(now);
        PollTick {
            lease,
            fetch,
            resync,
        }
    }

    /// Whether an insert notice names a reading this instance already has,
    /// including one its own `accept` is still writing.
    fn already_seen(&self, ts: &DateTime<Utc>) -> bool {
        if self.window.contains(ts) {
            return true;
        }
        let key = wx_reading::format_timestamp(ts);
        self.dedup.is_processed(&key)
            || self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&key)
    }

    fn poll_due(&self, now: DateTime<Utc>) -> bool {
        let last = *self.last_fetch.lock().unwrap_or_else(PoisonError::into_inner);
        match last {
            None => true,
            Some(t) => (now - t).to_std().is_ok_and(|d| d >= self.config.poll_interval),
        }
    }

    /// Lease-check loop.  Store insert notifications trigger an immediate
    /// fetch while this instance is the poller.  Releases the lease on exit.
    pub async fn run_poller(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.lease_check_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut inserts = self.store.subscribe_to_inserts();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    self.poll_once(self.now()).await;
                }
                notice = next_insert(&mut inserts) => {
                    let Some(ts) = notice else { continue };
                    if self.is_active_poller() && ts.is_none_or(|ts| !self.already_seen(&ts)) {
                        if let Err(e) = self.fetch_missed().await {
                            warn!(error = %e, "hinted fetch failed");
                        }
                    }
                }
            }
        }
        if let Err(e) = self.lease.release(&self.config.instance_id).await {
            warn!(error = %e, "failed to release poller lease");
        }
        self.polling.store(false, Ordering::SeqCst);
        info!("poller stopped");
    }

    // -----------------------------------------------------------------------
    // Siblings
    // -----------------------------------------------------------------------

    /// Apply one sibling message to the dedup cache and the window.
    pub fn apply_sibling(&self, msg: &SiblingMessage) -> SiblingApplied {
        let applied = self.dedup.apply_sibling(msg);
        match &applied {
            SiblingApplied::Processed {
                reading: Some(reading),
                ..
            } => {
                self.window.insert(reading.clone(), self.now());
            }
            SiblingApplied::Cleared => {
                self.window.clear();
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear();
            }
            _ => {}
        }
        applied
    }

    pub async fn run_sibling_listener(self: Arc<Self>, shutdown: CancellationToken) {
        let mut rx = self.dedup.subscribe_siblings();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = rx.recv() => match msg {
                    Ok(msg) => {
                        self.apply_sibling(&msg);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "sibling listener lagged; relying on poll to converge");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}

/// Next insert hint.  `Some(None)` means hints were dropped (lagged) and a
/// fetch is warranted anyway.  Pends forever when the store offers no hints.
async fn next_insert(
    rx: &mut Option<broadcast::Receiver<crate::store::InsertNotice>>,
) -> Option<Option<DateTime<Utc>>> {
    let received = match rx.as_mut() {
        Some(inner) => inner.recv().await,
        None => return std::future::pending().await,
    };
    match received {
        Ok(n) => Some(Some(n.timestamp)),
        Err(broadcast::error::RecvError::Lagged(_)) => Some(None),
        Err(broadcast::error::RecvError::Closed) => {
            *rx = None;
            None
        }
    }
}
