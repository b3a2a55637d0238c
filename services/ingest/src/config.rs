//! Ingest service configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/wx-telemetry/ingest.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `broker.endpoint`
//! - `station.id`
//!
//! # Password file format
//! `broker.password_file` holds the raw password on a single line; trimmed on
//! read.  An inline `broker.password` wins when both are set.

use crate::transport::{
    BrokerScheme, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_MAX_RAPID_RETRIES,
    DEFAULT_RECONNECT_BACKOFF, TransportConfig, TransportTimings,
};
use chrono::TimeDelta;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use wx_reading::Station;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/wx-telemetry/ingest.toml";
const DEFAULT_STORE_PATH: &str = "/var/lib/wx-telemetry/weather.sqlite3";
const DEFAULT_LOCAL_PATH: &str = "/var/lib/wx-telemetry/ingest-local.sqlite3";
const DEFAULT_BROKER_PORT: u16 = 8884;
const DEFAULT_TOPIC: &str = "awsData";
const DEFAULT_FANOUT_BIND: &str = "127.0.0.1:47110";
const DEFAULT_STATUS_BIND: &str = "127.0.0.1:9190";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub schema_version: u32,
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub station: Station,
    pub ingest: IngestSettings,
    pub fanout: FanoutConfig,
    pub status_http: StatusHttpConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub endpoint: String,
    pub port: u16,
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub active: bool,
    pub scheme: BrokerScheme,
}

impl BrokerConfig {
    pub fn transport_config(&self, client_id: impl Into<String>) -> TransportConfig {
        TransportConfig {
            endpoint: self.endpoint.clone(),
            port: self.port,
            topic: self.topic.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            active: self.active,
            scheme: self.scheme,
            client_id: client_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Weather data shared by every ingest process.
    pub sqlite_path: PathBuf,
    /// Per-host state: dedup journal, poller lease, client id.
    pub local_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSettings {
    pub poll_interval: Duration,
    pub lease_check_interval: Duration,
    pub retention_hours: i64,
    pub dedup_capacity: usize,
    pub message_dedup_capacity: usize,
    pub pending_capacity: usize,
    pub reconnect_backoff: Duration,
    pub keepalive_interval: Duration,
    pub max_rapid_retries: u32,
}

impl IngestSettings {
    pub fn retention(&self) -> TimeDelta {
        TimeDelta::hours(self.retention_hours)
    }

    pub fn timings(&self) -> TransportTimings {
        TransportTimings {
            reconnect_backoff: self.reconnect_backoff,
            keepalive_interval: self.keepalive_interval,
            max_rapid_retries: self.max_rapid_retries,
        }
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            poll_interval: crate::coordinator::DEFAULT_POLL_INTERVAL,
            lease_check_interval: crate::coordinator::DEFAULT_LEASE_CHECK_INTERVAL,
            retention_hours: crate::window::DEFAULT_RETENTION_HOURS,
            dedup_capacity: crate::reading_dedup::DEFAULT_READING_DEDUP_CAPACITY,
            message_dedup_capacity: crate::message_dedup::DEFAULT_MESSAGE_DEDUP_CAPACITY,
            pending_capacity: crate::coordinator::DEFAULT_PENDING_CAPACITY,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            max_rapid_retries: DEFAULT_MAX_RAPID_RETRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusHttpConfig {
    pub bind: String,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    broker: Option<RawBrokerConfig>,
    store: Option<RawStoreConfig>,
    station: Option<RawStationConfig>,
    ingest: Option<RawIngestConfig>,
    fanout: Option<RawFanoutConfig>,
    status_http: Option<RawStatusHttpConfig>,
}

#[derive(Debug, Deserialize)]
struct RawBrokerConfig {
    endpoint: Option<String>,
    port: Option<u16>,
    topic: Option<String>,
    username: Option<String>,
    password: Option<String>,
    password_file: Option<String>,
    active: Option<bool>,
    scheme: Option<BrokerScheme>,
}

#[derive(Debug, Deserialize)]
struct RawStoreConfig {
    sqlite_path: Option<String>,
    local_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStationConfig {
    id: Option<String>,
    name: Option<String>,
    wmo_number: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    elevation: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawIngestConfig {
    poll_interval_secs: Option<u64>,
    lease_check_secs: Option<u64>,
    retention_hours: Option<i64>,
    dedup_capacity: Option<usize>,
    message_dedup_capacity: Option<usize>,
    pending_capacity: Option<usize>,
    reconnect_backoff_secs: Option<u64>,
    keepalive_secs: Option<u64>,
    max_rapid_retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawFanoutConfig {
    enabled: Option<bool>,
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStatusHttpConfig {
    bind: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<IngestConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<IngestConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let broker = broker_config(
        raw.broker
            .ok_or_else(|| ConfigError::MissingField("broker".to_owned()))?,
    )?;

    let store = match raw.store {
        Some(s) => StoreConfig {
            sqlite_path: s
                .sqlite_path
                .unwrap_or_else(|| DEFAULT_STORE_PATH.to_owned())
                .into(),
            local_path: s
                .local_path
                .unwrap_or_else(|| DEFAULT_LOCAL_PATH.to_owned())
                .into(),
        },
        None => StoreConfig {
            sqlite_path: DEFAULT_STORE_PATH.into(),
            local_path: DEFAULT_LOCAL_PATH.into(),
        },
    };
    if store.sqlite_path == store.local_path {
        return Err(ConfigError::InvalidValue(
            "store.sqlite_path and store.local_path must differ".to_owned(),
        ));
    }

    let raw_station = raw
        .station
        .ok_or_else(|| ConfigError::MissingField("station".to_owned()))?;
    let station_id = raw_station
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingField("station.id".to_owned()))?;
    let station = Station {
        name: raw_station.name.unwrap_or_else(|| station_id.clone()),
        id: station_id,
        wmo_number: raw_station.wmo_number.unwrap_or_default(),
        latitude: raw_station.latitude.unwrap_or(0.0),
        longitude: raw_station.longitude.unwrap_or(0.0),
        elevation: raw_station.elevation.unwrap_or(0.0),
    };

    let ingest = ingest_settings(raw.ingest.unwrap_or_default())?;

    let (fanout_enabled, fanout_bind) = match raw.fanout {
        Some(f) => (
            f.enabled.unwrap_or(true),
            f.bind.unwrap_or_else(|| DEFAULT_FANOUT_BIND.to_owned()),
        ),
        None => (true, DEFAULT_FANOUT_BIND.to_owned()),
    };
    let fanout = FanoutConfig {
        enabled: fanout_enabled,
        bind: fanout_bind.parse().map_err(|_| {
            ConfigError::InvalidValue(format!("fanout.bind is not a socket address: {fanout_bind}"))
        })?,
    };

    let status_http = StatusHttpConfig {
        bind: raw
            .status_http
            .and_then(|s| s.bind)
            .unwrap_or_else(|| DEFAULT_STATUS_BIND.to_owned()),
    };

    Ok(IngestConfig {
        schema_version,
        broker,
        store,
        station,
        ingest,
        fanout,
        status_http,
    })
}

fn broker_config(raw: RawBrokerConfig) -> Result<BrokerConfig, ConfigError> {
    let endpoint = raw
        .endpoint
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingField("broker.endpoint".to_owned()))?;
    let port = raw.port.unwrap_or(DEFAULT_BROKER_PORT);
    let topic = raw.topic.unwrap_or_else(|| DEFAULT_TOPIC.to_owned());
    if topic.is_empty() {
        return Err(ConfigError::InvalidValue("broker.topic must not be empty".to_owned()));
    }
    let password = match (raw.password, raw.password_file) {
        (Some(p), _) => Some(p),
        (None, Some(file)) => Some(read_password_file(&file)?),
        (None, None) => None,
    };
    Ok(BrokerConfig {
        endpoint,
        port,
        topic,
        username: raw.username,
        password,
        active: raw.active.unwrap_or(true),
        scheme: raw.scheme.unwrap_or_else(|| BrokerScheme::for_port(port)),
    })
}

fn ingest_settings(raw: RawIngestConfig) -> Result<IngestSettings, ConfigError> {
    let d = IngestSettings::default();
    let secs = |v: Option<u64>, default: Duration, field: &str| match v {
        Some(0) => Err(ConfigError::InvalidValue(format!("ingest.{field} must be > 0"))),
        Some(n) => Ok(Duration::from_secs(n)),
        None => Ok(default),
    };
    let count = |v: Option<usize>, default: usize, field: &str| match v {
        Some(0) => Err(ConfigError::InvalidValue(format!("ingest.{field} must be > 0"))),
        Some(n) => Ok(n),
        None => Ok(default),
    };
    let retention_hours = raw.retention_hours.unwrap_or(d.retention_hours);
    if retention_hours <= 0 {
        return Err(ConfigError::InvalidValue(
            "ingest.retention_hours must be > 0".to_owned(),
        ));
    }
    Ok(IngestSettings {
        poll_interval: secs(raw.poll_interval_secs, d.poll_interval, "poll_interval_secs")?,
        lease_check_interval: secs(raw.lease_check_secs, d.lease_check_interval, "lease_check_secs")?,
        retention_hours,
        dedup_capacity: count(raw.dedup_capacity, d.dedup_capacity, "dedup_capacity")?,
        message_dedup_capacity: count(
            raw.message_dedup_capacity,
            d.message_dedup_capacity,
            "message_dedup_capacity",
        )?,
        pending_capacity: count(raw.pending_capacity, d.pending_capacity, "pending_capacity")?,
        reconnect_backoff: secs(
            raw.reconnect_backoff_secs,
            d.reconnect_backoff,
            "reconnect_backoff_secs",
        )?,
        keepalive_interval: secs(raw.keepalive_secs, d.keepalive_interval, "keepalive_secs")?,
        max_rapid_retries: raw.max_rapid_retries.unwrap_or(d.max_rapid_retries).max(1),
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

fn read_password_file(path: &str) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading password file '{}': {}", path, e)))?;
    Ok(content.trim().to_owned())
}
