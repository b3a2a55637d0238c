//! Active-poller lease.
//!
//! A single named claim-with-TTL cell that elects which ingest instance polls
//! the store for missed readings.  Best effort: two pollers may briefly
//! overlap around a takeover, which only costs a redundant query.

use crate::BoxFuture;
use crate::local_db::{LocalDb, LocalDbError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const POLLER_LEASE_NAME: &str = "active_poller";

/// A lease is stale once it is older than this multiple of the poll interval.
pub const STALE_FACTOR: f64 = 1.5;

pub fn stale_after(poll_interval: Duration) -> Duration {
    poll_interval.mul_f64(STALE_FACTOR)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseStatus {
    /// Claimed from an absent or stale holder.
    Acquired,
    /// Already ours; timestamp refreshed.
    Renewed,
    HeldElsewhere { holder: String },
}

impl LeaseStatus {
    pub fn is_held(&self) -> bool {
        matches!(self, LeaseStatus::Acquired | LeaseStatus::Renewed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lease storage: {0}")]
    Storage(#[from] LocalDbError),
}

pub trait PollerLease: Send + Sync {
    /// Claim or renew the lease for `holder` at `now`.  A lease held by
    /// someone else is taken over only when older than `stale_after`.
    fn try_claim<'a>(
        &'a self,
        holder: &'a str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> BoxFuture<'a, Result<LeaseStatus, LeaseError>>;

    /// Give the lease up if `holder` has it.
    fn release<'a>(&'a self, holder: &'a str) -> BoxFuture<'a, Result<(), LeaseError>>;

    fn holder(&self) -> BoxFuture<'_, Result<Option<String>, LeaseError>>;
}

fn stale_cutoff_ms(now: DateTime<Utc>, stale_after: Duration) -> i64 {
    now.timestamp_millis() - stale_after.as_millis() as i64
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryLease {
    cell: Mutex<Option<(String, i64)>>,
}

impl MemoryLease {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PollerLease for MemoryLease {
    fn try_claim<'a>(
        &'a self,
        holder: &'a str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> BoxFuture<'a, Result<LeaseStatus, LeaseError>> {
        Box::pin(async move {
            let mut cell = self.cell.lock().await;
            let now_ms = now.timestamp_millis();
            let status = match cell.as_ref() {
                Some((h, _)) if h == holder => LeaseStatus::Renewed,
                Some((h, at)) if *at >= stale_cutoff_ms(now, stale_after) => {
                    return Ok(LeaseStatus::HeldElsewhere { holder: h.clone() });
                }
                _ => LeaseStatus::Acquired,
            };
            *cell = Some((holder.to_owned(), now_ms));
            Ok(status)
        })
    }

    fn release<'a>(&'a self, holder: &'a str) -> BoxFuture<'a, Result<(), LeaseError>> {
        Box::pin(async move {
            let mut cell = self.cell.lock().await;
            if cell.as_ref().is_some_and(|(h, _)| h == holder) {
                *cell = None;
            }
            Ok(())
        })
    }

    fn holder(&self) -> BoxFuture<'_, Result<Option<String>, LeaseError>> {
        Box::pin(async move { Ok(self.cell.lock().await.as_ref().map(|(h, _)| h.clone())) })
    }
}

// ---------------------------------------------------------------------------
// SQLite (shared by every process on the host)
// ---------------------------------------------------------------------------

pub struct SqliteLease {
    db: Arc<Mutex<LocalDb>>,
    name: String,
}

impl SqliteLease {
    pub fn new(db: Arc<Mutex<LocalDb>>) -> Self {
        Self {
            db,
            name: POLLER_LEASE_NAME.to_owned(),
        }
    }
}

impl PollerLease for SqliteLease {
    fn try_claim<'a>(
        &'a self,
        holder: &'a str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> BoxFuture<'a, Result<LeaseStatus, LeaseError>> {
        Box::pin(async move {
            let db = self.db.lock().await;
            let previous = db.lease_row(&self.name)?;
            let claimed = db.claim_lease(
                &self.name,
                holder,
                now.timestamp_millis(),
                stale_cutoff_ms(now, stale_after),
            )?;
            if claimed {
                return Ok(match previous {
                    Some(row) if row.holder == holder => LeaseStatus::Renewed,
                    _ => LeaseStatus::Acquired,
                });
            }
            // Re-read: the holder may have changed since `previous`.
            let holder = db
                .lease_row(&self.name)?
                .or(previous)
                .map(|r| r.holder)
                .unwrap_or_default();
            Ok(LeaseStatus::HeldElsewhere { holder })
        })
    }

    fn release<'a>(&'a self, holder: &'a str) -> BoxFuture<'a, Result<(), LeaseError>> {
        Box::pin(async move {
            self.db.lock().await.release_lease(&self.name, holder)?;
            Ok(())
        })
    }

    fn holder(&self) -> BoxFuture<'_, Result<Option<String>, LeaseError>> {
        Box::pin(async move { Ok(self.db.lock().await.lease_row(&self.name)?.map(|r| r.holder)) })
    }
}
