//! Rolling window of recent readings.
//!
//! [`RollingWindow`] is the plain sorted collection.  [`WindowState`] is the
//! shared handle consumers read: it keeps the window, the current reading and
//! the last-updated marker behind one lock so they always change together.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;
use wx_reading::Reading;

pub const DEFAULT_RETENTION_HOURS: i64 = 24;

/// Ascending by timestamp, unique timestamps.
#[derive(Debug, Clone, Default)]
pub struct RollingWindow {
    readings: Vec<Reading>,
}

impl RollingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the sorted position.  Returns `false` if a reading with the
    /// same timestamp is already present.
    pub fn insert(&mut self, reading: Reading) -> bool {
        match self.readings.last() {
            None => {
                self.readings.push(reading);
                true
            }
            Some(last) if last.timestamp < reading.timestamp => {
                self.readings.push(reading);
                true
            }
            Some(_) => match self
                .readings
                .binary_search_by_key(&reading.timestamp, |r| r.timestamp)
            {
                Ok(_) => false,
                Err(idx) => {
                    self.readings.insert(idx, reading);
                    true
                }
            },
        }
    }

    /// Drop every reading strictly older than `cutoff`.
    pub fn evict_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let idx = self.readings.partition_point(|r| r.timestamp < cutoff);
        self.readings.drain(..idx);
        idx
    }

    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        self.readings
            .binary_search_by_key(ts, |r| r.timestamp)
            .is_ok()
    }

    pub fn snapshot(&self) -> Vec<Reading> {
        self.readings.clone()
    }

    pub fn newest(&self) -> Option<&Reading> {
        self.readings.last()
    }

    pub fn newest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.newest().map(|r| r.timestamp)
    }

    pub fn clear(&mut self) {
        self.readings.clear();
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Live notifications for window consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WindowUpdate {
    Inserted { reading: Reading },
    Cleared,
    Reloaded { count: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowInsert {
    Inserted,
    AlreadyPresent,
    /// Older than the retention cutoff; not kept.
    Expired,
}

/// Consistent read of the whole state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowView {
    pub readings: Vec<Reading>,
    pub current: Option<Reading>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    window: RollingWindow,
    last_updated: Option<DateTime<Utc>>,
}

pub struct WindowState {
    inner: RwLock<Inner>,
    retention: TimeDelta,
    updates: broadcast::Sender<WindowUpdate>,
}

impl WindowState {
    pub fn new(retention: TimeDelta) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            inner: RwLock::new(Inner::default()),
            retention,
            updates,
        }
    }

    pub fn retention(&self) -> TimeDelta {
        self.retention
    }

    fn read<R>(&self, f: impl FnOnce(&Inner) -> R) -> R {
        f(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        f(&mut self.inner.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Insert `reading`, then evict everything older than `now - retention`.
    pub fn insert(&self, reading: Reading, now: DateTime<Utc>) -> WindowInsert {
        let cutoff = now - self.retention;
        if reading.timestamp < cutoff {
            self.write(|s| s.window.evict_older_than(cutoff));
            return WindowInsert::Expired;
        }
        let inserted = self.write(|s| {
            let inserted = s.window.insert(reading.clone());
            if inserted {
                s.last_updated = Some(now);
            }
            s.window.evict_older_than(cutoff);
            inserted
        });
        if !inserted {
            return WindowInsert::AlreadyPresent;
        }
        let _ = self.updates.send(WindowUpdate::Inserted { reading });
        WindowInsert::Inserted
    }

    /// Replace the whole window (initial bulk load).
    pub fn reload<I: IntoIterator<Item = Reading>>(&self, readings: I, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let count = self.write(|s| {
            let mut window = RollingWindow::new();
            for r in readings {
                window.insert(r);
            }
            window.evict_older_than(cutoff);
            s.window = window;
            if !s.window.is_empty() {
                s.last_updated = Some(now);
            }
            s.window.len()
        });
        let _ = self.updates.send(WindowUpdate::Reloaded { count });
        count
    }

    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        self.write(|s| s.window.evict_older_than(cutoff))
    }

    /// Reset window, current reading and last-updated together.
    pub fn clear(&self) {
        self.write(|s| {
            s.window.clear();
            s.last_updated = None;
        });
        let _ = self.updates.send(WindowUpdate::Cleared);
    }

    pub fn view(&self) -> WindowView {
        self.read(|s| WindowView {
            readings: s.window.snapshot(),
            current: s.window.newest().cloned(),
            last_updated: s.last_updated,
        })
    }

    pub fn snapshot(&self) -> Vec<Reading> {
        self.read(|s| s.window.snapshot())
    }

    pub fn current(&self) -> Option<Reading> {
        self.read(|s| s.window.newest().cloned())
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.read(|s| s.last_updated)
    }

    pub fn newest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.read(|s| s.window.newest_timestamp())
    }

    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        self.read(|s| s.window.contains(ts))
    }

    pub fn len(&self) -> usize {
        self.read(|s| s.window.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WindowUpdate> {
        self.updates.subscribe()
    }
}

impl Default for WindowState {
    fn default() -> Self {
        Self::new(TimeDelta::hours(DEFAULT_RETENTION_HOURS))
    }
}
