//! Broker payload decoding.
//!
//! The weather station publishes one flat JSON object per observation:
//!
//! ```json
//! {"Temp": 27.4, "Rh": 81, "pressure": 1009.2, "radiation": 412,
//!  "wind.Speed": 3.1, "wind.Direction": 225, "precipitation": 0,
//!  "timestamp": 1704067200}
//! ```
//!
//! Every field is required.  Numbers may arrive as JSON numbers or as numeric
//! strings.  `timestamp` is either an epoch number (seconds, or milliseconds
//! when `>= 10_000_000_000`) or an RFC 3339 string.  A payload that fails any
//! of these rules is rejected whole; no partial reading is ever produced.

use crate::reading::{Reading, in_supported_range, normalize_timestamp, parse_timestamp};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

/// Epoch values at or above this are milliseconds, below are seconds.
pub const EPOCH_MILLIS_THRESHOLD: f64 = 10_000_000_000.0;

pub const FIELD_TEMPERATURE: &str = "Temp";
pub const FIELD_HUMIDITY: &str = "Rh";
pub const FIELD_PRESSURE: &str = "pressure";
pub const FIELD_RADIATION: &str = "radiation";
pub const FIELD_WIND_SPEED: &str = "wind.Speed";
pub const FIELD_WIND_DIRECTION: &str = "wind.Direction";
pub const FIELD_RAINFALL: &str = "precipitation";
pub const FIELD_TIMESTAMP: &str = "timestamp";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not a JSON object: {0}")]
    InvalidJson(String),
    #[error("malformed payload: field '{field}' {reason}")]
    MalformedPayload { field: &'static str, reason: String },
}

fn malformed(field: &'static str, reason: impl Into<String>) -> DecodeError {
    DecodeError::MalformedPayload {
        field,
        reason: reason.into(),
    }
}

/// Decode a raw broker payload into a [`Reading`].
pub fn decode(raw: &[u8]) -> Result<Reading, DecodeError> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    let Value::Object(obj) = value else {
        return Err(DecodeError::InvalidJson("top-level value is not an object".to_owned()));
    };

    Ok(Reading {
        timestamp: timestamp_field(&obj)?,
        temperature: number_field(&obj, FIELD_TEMPERATURE)?,
        humidity: number_field(&obj, FIELD_HUMIDITY)?,
        pressure: number_field(&obj, FIELD_PRESSURE)?,
        radiation: number_field(&obj, FIELD_RADIATION)?,
        wind_speed: number_field(&obj, FIELD_WIND_SPEED)?,
        wind_direction: number_field(&obj, FIELD_WIND_DIRECTION)?,
        rainfall: number_field(&obj, FIELD_RAINFALL)?,
    })
}

/// Extract the raw `timestamp` token without validating the rest of the
/// payload.  Used to build a message identifier when the broker supplies none.
pub fn peek_timestamp(raw: &[u8]) -> Option<String> {
    #[derive(serde::Deserialize)]
    struct Peek {
        timestamp: Option<Value>,
    }
    match serde_json::from_slice::<Peek>(raw).ok()?.timestamp? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number_field(obj: &Map<String, Value>, field: &'static str) -> Result<f64, DecodeError> {
    let v = obj.get(field).ok_or_else(|| malformed(field, "is missing"))?;
    let n = coerce_number(v).ok_or_else(|| malformed(field, format!("is not numeric: {v}")))?;
    if !n.is_finite() {
        return Err(malformed(field, "is not finite"));
    }
    Ok(n)
}

fn coerce_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let t = s.trim();
            if t.is_empty() { None } else { t.parse::<f64>().ok() }
        }
        _ => None,
    }
}

fn timestamp_field(obj: &Map<String, Value>) -> Result<DateTime<Utc>, DecodeError> {
    let v = obj
        .get(FIELD_TIMESTAMP)
        .ok_or_else(|| malformed(FIELD_TIMESTAMP, "is missing"))?;
    match v {
        Value::Number(n) => {
            let epoch = n
                .as_f64()
                .ok_or_else(|| malformed(FIELD_TIMESTAMP, "is not representable"))?;
            from_epoch(epoch).ok_or_else(|| malformed(FIELD_TIMESTAMP, "is out of range"))
        }
        Value::String(s) => parse_timestamp(s)
            .or_else(|| s.trim().parse::<f64>().ok().and_then(from_epoch))
            .ok_or_else(|| malformed(FIELD_TIMESTAMP, format!("is not an instant: '{s}'"))),
        other => Err(malformed(
            FIELD_TIMESTAMP,
            format!("has unsupported type: {other}"),
        )),
    }
}

/// Convert an epoch value in seconds or milliseconds into a UTC timestamp.
/// Results past year 9999 are rejected.
pub fn from_epoch(epoch: f64) -> Option<DateTime<Utc>> {
    if !epoch.is_finite() || epoch < 0.0 {
        return None;
    }
    let millis = if epoch >= EPOCH_MILLIS_THRESHOLD {
        epoch
    } else {
        epoch * 1000.0
    };
    Utc.timestamp_millis_opt(millis.trunc() as i64)
        .single()
        .map(normalize_timestamp)
        .filter(in_supported_range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::format_timestamp;

    const FULL: &str = r#"{"Temp":27.4,"Rh":81,"pressure":1009.2,"radiation":412,
        "wind.Speed":3.1,"wind.Direction":225,"precipitation":0.2,"timestamp":1704067200}"#;

    #[test]
    fn decodes_full_payload_with_epoch_seconds() {
        let r = decode(FULL.as_bytes()).unwrap();
        assert_eq!(format_timestamp(&r.timestamp), "2024-01-01T00:00:00.000Z");
        assert_eq!(r.temperature, 27.4);
        assert_eq!(r.humidity, 81.0);
        assert_eq!(r.wind_speed, 3.1);
        assert_eq!(r.wind_direction, 225.0);
        assert_eq!(r.rainfall, 0.2);
    }

    #[test]
    fn epoch_at_threshold_is_milliseconds() {
        let ts = from_epoch(EPOCH_MILLIS_THRESHOLD).unwrap();
        assert_eq!(ts.timestamp_millis(), 10_000_000_000);
        let just_below = from_epoch(9_999_999_999.0).unwrap();
        assert_eq!(just_below.timestamp(), 9_999_999_999);
    }

    #[test]
    fn epoch_past_year_9999_is_malformed() {
        // 9999-12-31T23:59:59.999Z is the last accepted instant.
        let last = from_epoch(253_402_300_799_999.0).unwrap();
        assert_eq!(format_timestamp(&last), "9999-12-31T23:59:59.999Z");
        assert!(from_epoch(253_402_300_800_000.0).is_none());

        let raw = FULL.replace("1704067200", "8210266876799999");
        assert_eq!(
            decode(raw.as_bytes()).unwrap_err(),
            DecodeError::MalformedPayload {
                field: FIELD_TIMESTAMP,
                reason: "is out of range".to_owned()
            }
        );
        let raw = FULL.replace("1704067200", r#""+262142-12-31T23:59:59.999Z""#);
        assert!(matches!(
            decode(raw.as_bytes()),
            Err(DecodeError::MalformedPayload { field: FIELD_TIMESTAMP, .. })
        ));
    }

    #[test]
    fn epoch_zero_is_the_earliest_instant() {
        let first = from_epoch(0.0).unwrap();
        assert_eq!(format_timestamp(&first), "1970-01-01T00:00:00.000Z");
        assert!(from_epoch(-1.0).is_none());
    }

    #[test]
    fn epoch_millis_payload() {
        let raw = FULL.replace("1704067200", "1704067200123");
        let r = decode(raw.as_bytes()).unwrap();
        assert_eq!(format_timestamp(&r.timestamp), "2024-01-01T00:00:00.123Z");
    }

    #[test]
    fn iso_string_timestamp_is_normalized() {
        let raw = FULL.replace("1704067200", r#""2024-01-01T07:00:00+07:00""#);
        let r = decode(raw.as_bytes()).unwrap();
        assert_eq!(format_timestamp(&r.timestamp), "2024-01-01T00:00:00.000Z");
    }

    #[test]
    fn numeric_strings_are_coerced() {
        let raw = FULL.replace("27.4", r#""27.4""#);
        assert_eq!(decode(raw.as_bytes()).unwrap().temperature, 27.4);
    }

    #[test]
    fn missing_field_is_malformed() {
        let raw = FULL.replace(r#""Rh":81,"#, "");
        assert_eq!(
            decode(raw.as_bytes()).unwrap_err(),
            DecodeError::MalformedPayload {
                field: FIELD_HUMIDITY,
                reason: "is missing".to_owned()
            }
        );
    }

    #[test]
    fn non_numeric_field_is_malformed() {
        let raw = FULL.replace("1009.2", r#""high""#);
        assert!(matches!(
            decode(raw.as_bytes()),
            Err(DecodeError::MalformedPayload { field: FIELD_PRESSURE, .. })
        ));
        let raw = FULL.replace("1009.2", "null");
        assert!(matches!(
            decode(raw.as_bytes()),
            Err(DecodeError::MalformedPayload { field: FIELD_PRESSURE, .. })
        ));
    }

    #[test]
    fn bad_timestamp_is_malformed() {
        let raw = FULL.replace("1704067200", r#""not a time""#);
        assert!(matches!(
            decode(raw.as_bytes()),
            Err(DecodeError::MalformedPayload { field: FIELD_TIMESTAMP, .. })
        ));
        let raw = FULL.replace("1704067200", "true");
        assert!(matches!(
            decode(raw.as_bytes()),
            Err(DecodeError::MalformedPayload { field: FIELD_TIMESTAMP, .. })
        ));
    }

    #[test]
    fn non_object_is_invalid_json() {
        assert!(matches!(decode(b"[1,2]"), Err(DecodeError::InvalidJson(_))));
        assert!(matches!(decode(b"{oops"), Err(DecodeError::InvalidJson(_))));
    }

    #[test]
    fn peek_timestamp_reads_number_and_string() {
        assert_eq!(peek_timestamp(FULL.as_bytes()).as_deref(), Some("1704067200"));
        assert_eq!(
            peek_timestamp(br#"{"timestamp":"2024-01-01T00:00:00Z"}"#).as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert_eq!(peek_timestamp(br#"{"Temp":1}"#), None);
        assert_eq!(peek_timestamp(b"garbage"), None);
    }
}
