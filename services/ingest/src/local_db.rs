//! Per-host local state database.
//!
//! Plays the role a browser's local storage plays for sibling tabs: every
//! ingest process on the host opens the same SQLite file.
//!
//! # Tables
//! - `processed_readings`: durable reading-dedup journal, oldest first by `seq`.
//! - `poller_lease`: single-row-per-name lease cell for poller election.
//! - `local_settings`: small key/value settings (the broker client id).
//!
//! # SQLite settings
//! WAL, synchronous=NORMAL, busy_timeout so concurrent processes wait for the
//! write lock instead of failing immediately.

use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const SCHEMA_SQL: &str = include_str!("store/local_schema.sql");
const CLIENT_ID_KEY: &str = "mqtt_client_id";

#[derive(Debug, Error)]
pub enum LocalDbError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity: {0}")]
    IntegrityCheckFailed(String),
}

pub type LocalDbResult<T> = Result<T, LocalDbError>;

/// Current holder of a lease row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRow {
    pub holder: String,
    pub claimed_at_ms: i64,
}

pub struct LocalDb {
    conn: Connection,
}

impl LocalDb {
    pub fn open(path: &Path) -> LocalDbResult<Self> {
        let d = Self {
            conn: Connection::open(path)?,
        };
        d.apply_pragmas()?;
        d.integrity_check()?;
        d.apply_schema()?;
        Ok(d)
    }

    pub fn open_in_memory() -> LocalDbResult<Self> {
        let d = Self {
            conn: Connection::open_in_memory()?,
        };
        d.apply_pragmas()?;
        d.apply_schema()?;
        Ok(d)
    }

    pub fn integrity_check(&self) -> LocalDbResult<()> {
        let r: String = self
            .conn
            .pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if r != "ok" {
            return Err(LocalDbError::IntegrityCheckFailed(r));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dedup journal
    // -----------------------------------------------------------------------

    /// Load at most `cap` most recent keys, oldest first.
    pub fn load_processed(&self, cap: usize) -> LocalDbResult<Vec<String>> {
        let mut s = self.conn.prepare(
            "SELECT ts FROM (SELECT seq, ts FROM processed_readings ORDER BY seq DESC LIMIT ?1)
             ORDER BY seq ASC",
        )?;
        let rows = s.query_map(params![cap as i64], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Append `key` (no-op if present) and trim the journal to `cap` entries.
    pub fn append_processed(&mut self, key: &str, cap: usize) -> LocalDbResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO processed_readings (ts) VALUES (?1)",
            params![key],
        )?;
        tx.execute(
            "DELETE FROM processed_readings WHERE seq NOT IN
                 (SELECT seq FROM processed_readings ORDER BY seq DESC LIMIT ?1)",
            params![cap as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn clear_processed(&self) -> LocalDbResult<()> {
        self.conn.execute_batch("DELETE FROM processed_readings")?;
        Ok(())
    }

    pub fn processed_count(&self) -> LocalDbResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM processed_readings", [], |r| r.get(0))?)
    }

    // -----------------------------------------------------------------------
    // Lease cell
    // -----------------------------------------------------------------------

    /// Compare-and-swap claim of the lease named `name`.
    ///
    /// Succeeds when the row is absent, already held by `holder`, or was last
    /// claimed before `stale_before_ms`.  The single upsert statement is
    /// atomic under SQLite's write lock.
    pub fn claim_lease(
        &self,
        name: &str,
        holder: &str,
        now_ms: i64,
        stale_before_ms: i64,
    ) -> LocalDbResult<bool> {
        let changed = self.conn.execute(
            "INSERT INTO poller_lease (name, holder, claimed_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET holder = excluded.holder,
                                             claimed_at_ms = excluded.claimed_at_ms
             WHERE poller_lease.holder = excluded.holder
                OR poller_lease.claimed_at_ms < ?4",
            params![name, holder, now_ms, stale_before_ms],
        )?;
        Ok(changed == 1)
    }

    pub fn release_lease(&self, name: &str, holder: &str) -> LocalDbResult<()> {
        self.conn.execute(
            "DELETE FROM poller_lease WHERE name = ?1 AND holder = ?2",
            params![name, holder],
        )?;
        Ok(())
    }

    pub fn lease_row(&self, name: &str) -> LocalDbResult<Option<LeaseRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT holder, claimed_at_ms FROM poller_lease WHERE name = ?1",
                params![name],
                |r| {
                    Ok(LeaseRow {
                        holder: r.get(0)?,
                        claimed_at_ms: r.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub fn setting(&self, key: &str) -> LocalDbResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM local_settings WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?)
    }

    /// Return the installation's broker client id, generating it on first use.
    ///
    /// Concurrent first calls from sibling processes converge on one value:
    /// the insert is `OR IGNORE` and the stored value is re-read.
    pub fn load_or_create_client_id(&self) -> LocalDbResult<String> {
        if let Some(id) = self.setting(CLIENT_ID_KEY)? {
            return Ok(id);
        }
        let random = uuid::Uuid::new_v4().simple().to_string();
        let candidate = format!(
            "wx_ingest_{}_{}",
            &random[..6],
            chrono::Utc::now().timestamp_millis()
        );
        self.conn.execute(
            "INSERT OR IGNORE INTO local_settings (key, value) VALUES (?1, ?2)",
            params![CLIENT_ID_KEY, candidate],
        )?;
        Ok(self.setting(CLIENT_ID_KEY)?.unwrap_or(candidate))
    }

    fn apply_pragmas(&self) -> LocalDbResult<()> {
        self.conn.busy_timeout(Duration::from_secs(5))?;
        self.conn
            .execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Ok(())
    }

    fn apply_schema(&self) -> LocalDbResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }
}
