// ingest: real-time weather telemetry ingestion.
//
// Exposes modules for integration testing and for the `wx-ingest` binary.

use std::future::Future;
use std::pin::Pin;

pub mod bounded_set;
pub mod config;
pub mod coordinator;
pub mod fanout;
pub mod lease;
pub mod local_db;
pub mod message_dedup;
pub mod pipeline;
pub mod reading_dedup;
pub mod status_http;
pub mod status_log;
pub mod store;
pub mod transport;
pub mod ui_events;
pub mod window;

/// Boxed, sendable future used at the async trait seams (store, lease,
/// journal, broker link) so they stay object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use coordinator::{AcceptOutcome, IngestError, IngestionCoordinator, SkipReason};
pub use pipeline::IngestPipeline;
pub use reading_dedup::ReadingDeduplicator;
pub use store::{SortOrder, StoreAdapter, StoreError, StoredRow};
pub use transport::{TransportClient, TransportConfig, TransportError, TransportHandler};
pub use window::WindowState;
