use crate::ui_events::IngestUiEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

pub const DEFAULT_MAX_BANNERS: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BannerLevel {
    Info,
    Warning,
    Error,
}

/// A transient, user-facing status message.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Banner {
    pub at: DateTime<Utc>,
    pub level: BannerLevel,
    pub message: String,
}

/// Status logger: prints to tracing, broadcasts to SSE subscribers and keeps
/// the most recent banners for REST retrieval.
#[derive(Clone)]
pub struct StatusLog {
    tx: broadcast::Sender<IngestUiEvent>,
    buffer: Arc<RwLock<VecDeque<Banner>>>,
    max_entries: usize,
}

impl StatusLog {
    pub fn new(tx: broadcast::Sender<IngestUiEvent>, max_entries: usize) -> Self {
        Self {
            tx,
            buffer: Arc::new(RwLock::new(VecDeque::with_capacity(max_entries))),
            max_entries,
        }
    }

    /// A logger whose events nobody listens to.
    pub fn detached() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self::new(tx, DEFAULT_MAX_BANNERS)
    }

    pub fn info(&self, msg: impl Display) {
        self.log(BannerLevel::Info, msg);
    }

    pub fn warn(&self, msg: impl Display) {
        self.log(BannerLevel::Warning, msg);
    }

    pub fn error(&self, msg: impl Display) {
        self.log(BannerLevel::Error, msg);
    }

    pub fn log(&self, level: BannerLevel, msg: impl Display) {
        let banner = Banner {
            at: Utc::now(),
            level,
            message: msg.to_string(),
        };
        match level {
            BannerLevel::Info => tracing::info!("{}", banner.message),
            BannerLevel::Warning => tracing::warn!("{}", banner.message),
            BannerLevel::Error => tracing::error!("{}", banner.message),
        }
        if let Ok(mut entries) = self.buffer.write() {
            entries.push_back(banner.clone());
            while entries.len() > self.max_entries {
                entries.pop_front();
            }
        }
        let _ = self.tx.send(IngestUiEvent::Banner { banner });
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<Banner> {
        self.buffer
            .read()
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn sender(&self) -> broadcast::Sender<IngestUiEvent> {
        self.tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IngestUiEvent> {
        self.tx.subscribe()
    }
}
