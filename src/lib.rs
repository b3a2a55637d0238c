//! wx-telemetry: real-time weather station telemetry ingestion.
//!
//! Facade over the workspace crates.  The reading model and payload decoder
//! live in `wx-reading`; the transport, deduplication, persistence and
//! rolling-window machinery live in the `ingest` service crate.

pub use ingest::{
    AcceptOutcome, IngestError, IngestPipeline, IngestionCoordinator, ReadingDeduplicator,
    SkipReason, SortOrder, StoreAdapter, StoreError, StoredRow, TransportClient, TransportConfig,
    TransportError, TransportHandler, WindowState,
};
pub use wx_reading::{DecodeError, Reading, Station, decode};

pub mod config {
    pub use ingest::config::*;
}

pub mod store {
    pub use ingest::store::*;
}

pub mod transport {
    pub use ingest::transport::*;
}
