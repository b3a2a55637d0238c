// wx-reading: weather reading model and broker payload decoding.
//
// Shared by the ingest service and its test utilities.  Everything that
// touches a reading's identity (dedup keys, store unique column, window
// ordering) goes through the canonical timestamp helpers in `reading`.

pub mod decode;
pub mod reading;

pub use decode::{DecodeError, decode, peek_timestamp};
pub use reading::{
    Reading, Station, format_timestamp, in_supported_range, normalize_timestamp, parse_timestamp,
};
