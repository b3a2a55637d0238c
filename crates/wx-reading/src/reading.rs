//! Canonical weather reading and station records.
//!
//! # Timestamp identity
//!
//! A reading is identified by its timestamp.  Timestamps are held in UTC and
//! truncated to millisecond precision, so `2024-01-01T00:00:00Z` and
//! `2024-01-01T00:00:00.000Z` name the same reading.  The canonical text form
//! is `YYYY-MM-DDTHH:MM:SS.mmmZ`.

use chrono::{DateTime, Datelike, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Timestamp helpers
// ---------------------------------------------------------------------------

/// Truncate to millisecond precision.
pub fn normalize_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(3)
}

/// Render the canonical `YYYY-MM-DDTHH:MM:SS.mmmZ` form.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Earliest and latest calendar years a reading may carry.  The canonical
/// text form is fixed-width only inside this range, and the store orders
/// rows by that text.
pub const MIN_YEAR: i32 = 1970;
pub const MAX_YEAR: i32 = 9999;

pub fn in_supported_range(ts: &DateTime<Utc>) -> bool {
    (MIN_YEAR..=MAX_YEAR).contains(&ts.year())
}

/// Parse an RFC 3339 instant (any offset) into a normalized UTC timestamp.
/// Instants outside [`MIN_YEAR`]..=[`MAX_YEAR`] are rejected.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| normalize_timestamp(dt.with_timezone(&Utc)))
        .filter(in_supported_range)
}

mod canonical_ts {
    use super::{format_timestamp, parse_timestamp};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse_timestamp(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{raw}'")))
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// A single weather observation.
///
/// All numeric fields are finite once a reading has been decoded or loaded
/// from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    #[serde(with = "canonical_ts")]
    pub timestamp: DateTime<Utc>,
    /// °C
    pub temperature: f64,
    /// Relative humidity, %.
    pub humidity: f64,
    /// hPa
    pub pressure: f64,
    /// W/m²
    pub radiation: f64,
    /// m/s
    pub wind_speed: f64,
    /// Degrees, 0–359.
    pub wind_direction: f64,
    /// mm/h
    pub rainfall: f64,
}

impl Reading {
    /// Canonical text key for this reading.
    pub fn key(&self) -> String {
        format_timestamp(&self.timestamp)
    }

    /// Return a copy whose timestamp has been normalized.
    pub fn normalized(mut self) -> Self {
        self.timestamp = normalize_timestamp(self.timestamp);
        self
    }

    pub fn all_finite(&self) -> bool {
        [
            self.temperature,
            self.humidity,
            self.pressure,
            self.radiation,
            self.wind_speed,
            self.wind_direction,
            self.rainfall,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

// ---------------------------------------------------------------------------
// Station
// ---------------------------------------------------------------------------

/// Metadata for the weather station that owns the readings.
///
/// Ingestion only uses `id` as a foreign key at persist time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Station {
    pub id: String,
    pub name: String,
    pub wmo_number: String,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
}
