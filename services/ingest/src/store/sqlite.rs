//! SQLite-backed [`StoreAdapter`].
//!
//! Several ingest processes may open the same database file; uniqueness of
//! `weather_data.timestamp` is the final guard against double inserts.

use super::{InsertNotice, SortOrder, StoreAdapter, StoreError, StoredRow};
use crate::BoxFuture;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};
use wx_reading::{Reading, Station, format_timestamp, parse_timestamp};

const SCHEMA_SQL: &str = include_str!("weather_schema.sql");

const SELECT_COLUMNS: &str = "id, timestamp, temperature, humidity, pressure, radiation, \
     wind_speed, wind_direction, rainfall, station_id, created_at";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    inserts: broadcast::Sender<InsertNotice>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(other)?;
        let r: String = conn
            .pragma_query_value(None, "integrity_check", |row| row.get(0))
            .map_err(other)?;
        if r != "ok" {
            return Err(StoreError::Other(format!("integrity check failed: {r}")));
        }
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(other)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(other)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )
        .map_err(other)?;
        conn.execute_batch(SCHEMA_SQL).map_err(other)?;
        let (inserts, _) = broadcast::channel(256);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            inserts,
        })
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM weather_data", [], |r| r.get(0))
            .map_err(other)?;
        Ok(n as u64)
    }

    fn delete_bulk(conn: &mut Connection) -> rusqlite::Result<u64> {
        let tx = conn.transaction()?;
        let n = tx.execute("DELETE FROM weather_data", [])?;
        tx.commit()?;
        Ok(n as u64)
    }

    fn delete_row_by_row(conn: &Connection) -> rusqlite::Result<u64> {
        let ids: Vec<String> = {
            let mut s = conn.prepare("SELECT id FROM weather_data")?;
            let rows = s.query_map([], |r| r.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        let mut deleted = 0;
        for id in ids {
            deleted += conn.execute("DELETE FROM weather_data WHERE id = ?1", params![id])? as u64;
        }
        Ok(deleted)
    }
}

fn other(e: impl std::fmt::Display) -> StoreError {
    StoreError::Other(e.to_string())
}

fn map_insert_error(e: rusqlite::Error, key: &str) -> StoreError {
    if let rusqlite::Error::SqliteFailure(f, _) = &e {
        if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            || f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        {
            return StoreError::DuplicateKey(key.to_owned());
        }
    }
    other(e)
}

fn conversion_error(idx: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("invalid timestamp '{raw}'").into(),
    )
}

fn row_to_stored(r: &Row<'_>) -> rusqlite::Result<StoredRow> {
    let ts_raw: String = r.get(1)?;
    let created_raw: String = r.get(10)?;
    Ok(StoredRow {
        id: r.get(0)?,
        reading: Reading {
            timestamp: parse_timestamp(&ts_raw).ok_or_else(|| conversion_error(1, &ts_raw))?,
            temperature: r.get(2)?,
            humidity: r.get(3)?,
            pressure: r.get(4)?,
            radiation: r.get(5)?,
            wind_speed: r.get(6)?,
            wind_direction: r.get(7)?,
            rainfall: r.get(8)?,
        },
        station_id: r.get(9)?,
        created_at: parse_timestamp(&created_raw)
            .ok_or_else(|| conversion_error(10, &created_raw))?,
    })
}

impl StoreAdapter for SqliteStore {
    fn exists_by_timestamp<'a>(
        &'a self,
        ts: &'a DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            let conn = self.conn.lock().await;
            let found: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM weather_data WHERE timestamp = ?1)",
                    params![format_timestamp(ts)],
                    |r| r.get(0),
                )
                .map_err(other)?;
            Ok(found)
        })
    }

    fn insert_reading<'a>(
        &'a self,
        reading: &'a Reading,
        station_id: &'a str,
    ) -> BoxFuture<'a, Result<StoredRow, StoreError>> {
        Box::pin(async move {
            let row = StoredRow {
                id: uuid::Uuid::new_v4().to_string(),
                reading: reading.clone().normalized(),
                station_id: station_id.to_owned(),
                created_at: wx_reading::normalize_timestamp(Utc::now()),
            };
            let key = row.reading.key();
            {
                let conn = self.conn.lock().await;
                conn.execute(
                    "INSERT INTO weather_data (id, timestamp, temperature, humidity, pressure,
                         radiation, wind_speed, wind_direction, rainfall, station_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        row.id,
                        key,
                        row.reading.temperature,
                        row.reading.humidity,
                        row.reading.pressure,
                        row.reading.radiation,
                        row.reading.wind_speed,
                        row.reading.wind_direction,
                        row.reading.rainfall,
                        row.station_id,
                        format_timestamp(&row.created_at),
                    ],
                )
                .map_err(|e| map_insert_error(e, &key))?;
            }
            debug!(timestamp = %key, "reading row inserted");
            let _ = self.inserts.send(InsertNotice {
                timestamp: row.reading.timestamp,
            });
            Ok(row)
        })
    }

    fn query_range<'a>(
        &'a self,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
        order: SortOrder,
    ) -> BoxFuture<'a, Result<Vec<StoredRow>, StoreError>> {
        Box::pin(async move {
            let dir = match order {
                SortOrder::Ascending => "ASC",
                SortOrder::Descending => "DESC",
            };
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM weather_data
                 WHERE timestamp >= ?1 AND (?2 IS NULL OR timestamp <= ?2)
                 ORDER BY timestamp {dir}"
            );
            let conn = self.conn.lock().await;
            let mut s = conn.prepare(&sql).map_err(other)?;
            let rows = s
                .query_map(
                    params![format_timestamp(&from), to.as_ref().map(format_timestamp)],
                    row_to_stored,
                )
                .map_err(other)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(other)
        })
    }

    fn delete_all(&self) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn.lock().await;
            match Self::delete_bulk(&mut conn) {
                Ok(n) => Ok(n),
                Err(e) => {
                    warn!(error = %e, "bulk delete failed, falling back to row-by-row");
                    Self::delete_row_by_row(&conn).map_err(other)
                }
            }
        })
    }

    fn upsert_station<'a>(&'a self, station: &'a Station) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let conn = self.conn.lock().await;
            conn.execute(
                "INSERT INTO stations (id, name, wmo_number, latitude, longitude, elevation, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name,
                     wmo_number = excluded.wmo_number, latitude = excluded.latitude,
                     longitude = excluded.longitude, elevation = excluded.elevation",
                params![
                    station.id,
                    station.name,
                    station.wmo_number,
                    station.latitude,
                    station.longitude,
                    station.elevation,
                    format_timestamp(&Utc::now()),
                ],
            )
            .map_err(other)?;
            Ok(())
        })
    }

    fn subscribe_to_inserts(&self) -> Option<broadcast::Receiver<InsertNotice>> {
        Some(self.inserts.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn station() -> Station {
        Station {
            id: "stn-1".to_owned(),
            name: "Rooftop".to_owned(),
            wmo_number: "48900".to_owned(),
            latitude: 10.77,
            longitude: 106.7,
            elevation: 12.0,
        }
    }

    fn reading(secs: i64) -> Reading {
        Reading {
            timestamp: Utc.timestamp_opt(1_704_067_200 + secs, 0).unwrap(),
            temperature: 27.0,
            humidity: 80.0,
            pressure: 1009.0,
            radiation: 400.0,
            wind_speed: 3.0,
            wind_direction: 180.0,
            rainfall: 0.0,
        }
    }

    async fn store() -> SqliteStore {
        let s = SqliteStore::open_in_memory().unwrap();
        s.upsert_station(&station()).await.unwrap();
        s
    }

    #[tokio::test]
    async fn insert_then_exists() {
        let s = store().await;
        let r = reading(0);
        assert!(!s.exists_by_timestamp(&r.timestamp).await.unwrap());
        let row = s.insert_reading(&r, "stn-1").await.unwrap();
        assert_eq!(row.reading, r);
        assert!(s.exists_by_timestamp(&r.timestamp).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_timestamp_is_duplicate_key() {
        let s = store().await;
        s.insert_reading(&reading(0), "stn-1").await.unwrap();
        let err = s.insert_reading(&reading(0), "stn-1").await.unwrap_err();
        assert!(err.is_duplicate(), "got {err:?}");
        assert_eq!(s.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_station_is_other_error() {
        let s = store().await;
        let err = s.insert_reading(&reading(0), "nope").await.unwrap_err();
        assert!(matches!(err, StoreError::Other(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn query_range_is_inclusive_and_ordered() {
        let s = store().await;
        for secs in [20, 0, 10, 30] {
            s.insert_reading(&reading(secs), "stn-1").await.unwrap();
        }
        let rows = s
            .query_range(reading(10).timestamp, Some(reading(20).timestamp), SortOrder::Ascending)
            .await
            .unwrap();
        let got: Vec<_> = rows.iter().map(|r| r.reading.timestamp).collect();
        assert_eq!(got, vec![reading(10).timestamp, reading(20).timestamp]);

        let rows = s
            .query_range(reading(0).timestamp, None, SortOrder::Descending)
            .await
            .unwrap();
        assert_eq!(rows.first().unwrap().reading.timestamp, reading(30).timestamp);
        assert_eq!(rows.len(), 4);
    }

    #[tokio::test]
    async fn delete_all_empties_table() {
        let s = store().await;
        for secs in 0..5 {
            s.insert_reading(&reading(secs), "stn-1").await.unwrap();
        }
        assert_eq!(s.delete_all().await.unwrap(), 5);
        assert_eq!(s.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn row_by_row_delete_matches_bulk() {
        let s = store().await;
        for secs in 0..3 {
            s.insert_reading(&reading(secs), "stn-1").await.unwrap();
        }
        let conn = s.conn.lock().await;
        assert_eq!(SqliteStore::delete_row_by_row(&conn).unwrap(), 3);
    }

    #[tokio::test]
    async fn insert_emits_notice() {
        let s = store().await;
        let mut rx = s.subscribe_to_inserts().unwrap();
        s.insert_reading(&reading(5), "stn-1").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().timestamp, reading(5).timestamp);
    }

    #[tokio::test]
    async fn upsert_station_is_idempotent() {
        let s = store().await;
        let mut st = station();
        st.name = "Renamed".to_owned();
        s.upsert_station(&st).await.unwrap();
        s.insert_reading(&reading(0), "stn-1").await.unwrap();
    }

    #[tokio::test]
    async fn two_handles_on_one_file_share_rows() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("weather.sqlite3");
        let a = SqliteStore::open(&p).unwrap();
        a.upsert_station(&station()).await.unwrap();
        let b = SqliteStore::open(&p).unwrap();
        a.insert_reading(&reading(0), "stn-1").await.unwrap();
        assert!(b.exists_by_timestamp(&reading(0).timestamp).await.unwrap());
        assert!(b.insert_reading(&reading(0), "stn-1").await.unwrap_err().is_duplicate());
    }
}
