// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite persistence backend
//!
//! Thread-safe via internal Mutex (SQLite Connection is not Sync). Writes
//! run on the blocking thread pool so a slow disk never stalls the runtime.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE sensor_readings (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     sensor_id TEXT NOT NULL,
//!     co2_ppm REAL NOT NULL,
//!     temperature_celsius REAL NOT NULL,
//!     received_at TEXT NOT NULL
//! );
//! CREATE INDEX idx_sensor_time ON sensor_readings(sensor_id, received_at);
//! ```
//!
//! `received_at` is RFC 3339 UTC with fixed millisecond precision, so text
//! order is time order. It is the same string the push frame carries.

use crate::reading::Reading;
use crate::store::{PersistenceSink, WriteError};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// SQLite-backed persistence sink.
#[derive(Clone)]
pub struct SqliteSink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSink {
    /// Open (or create) a file-based database.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;
        Self::with_connection(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to create in-memory SQLite database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let sink = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        sink.init_schema()?;
        Ok(sink)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = lock(&self.conn).map_err(|e| anyhow!(e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sensor_readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sensor_id TEXT NOT NULL,
                co2_ppm REAL NOT NULL,
                temperature_celsius REAL NOT NULL,
                received_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sensor_time
             ON sensor_readings(sensor_id, received_at)",
            [],
        )?;

        Ok(())
    }

    /// Insert one reading (blocking).
    pub fn insert(&self, reading: &Reading) -> Result<(), WriteError> {
        insert_blocking(&self.conn, reading)
    }

    /// Total number of stored readings.
    pub fn count(&self) -> Result<usize> {
        let conn = lock(&self.conn).map_err(|e| anyhow!(e))?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM sensor_readings", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Most recent readings, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<Reading>> {
        let conn = lock(&self.conn).map_err(|e| anyhow!(e))?;
        let mut stmt = conn.prepare(
            "SELECT sensor_id, co2_ppm, temperature_celsius, received_at
             FROM sensor_readings
             ORDER BY received_at DESC, id DESC
             LIMIT ?1",
        )?;

        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(sensor_id, co2_ppm, temperature_celsius, received_at)| {
                let received_at = DateTime::parse_from_rfc3339(&received_at)
                    .with_context(|| format!("Bad timestamp in store: {}", received_at))?
                    .with_timezone(&Utc);
                Ok(Reading {
                    sensor_id,
                    co2_ppm,
                    temperature_celsius,
                    received_at,
                })
            })
            .collect()
    }

    /// Per-sensor reading counts, sorted by sensor id.
    pub fn sensors(&self) -> Result<Vec<(String, usize)>> {
        let conn = lock(&self.conn).map_err(|e| anyhow!(e))?;
        let mut stmt = conn.prepare(
            "SELECT sensor_id, COUNT(*) FROM sensor_readings
             GROUP BY sensor_id ORDER BY sensor_id",
        )?;
        let sensors = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sensors)
    }
}

impl PersistenceSink for SqliteSink {
    fn write(&self, reading: &Reading) -> impl Future<Output = Result<(), WriteError>> + Send {
        let conn = Arc::clone(&self.conn);
        let reading = reading.clone();

        async move {
            tokio::task::spawn_blocking(move || insert_blocking(&conn, &reading))
                .await
                .map_err(|e| WriteError::Store(format!("write task failed: {}", e)))?
        }
    }
}

fn insert_blocking(conn: &Mutex<Connection>, reading: &Reading) -> Result<(), WriteError> {
    let conn = lock(conn).map_err(WriteError::Store)?;
    conn.execute(
        "INSERT INTO sensor_readings (sensor_id, co2_ppm, temperature_celsius, received_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            reading.sensor_id,
            reading.co2_ppm,
            reading.temperature_celsius,
            reading.timestamp(),
        ],
    )?;
    Ok(())
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, String> {
    conn.lock()
        .map_err(|_| "SQLite connection mutex poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn reading(id: &str, co2: f64, secs: i64) -> Reading {
        Reading {
            sensor_id: id.into(),
            co2_ppm: co2,
            temperature_celsius: 28.1,
            received_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
                + Duration::seconds(secs),
        }
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let sink = SqliteSink::open_in_memory().unwrap();
        let stored = reading("INDUSTRY-001", 415.2, 0);

        sink.write(&stored).await.unwrap();

        assert_eq!(sink.count().unwrap(), 1);
        let recent = sink.recent(10).unwrap();
        assert_eq!(recent, vec![stored]);
    }

    #[test]
    fn test_stored_timestamp_matches_push_frame() {
        use chrono::Timelike;

        let sink = SqliteSink::open_in_memory().unwrap();
        let mut stamped = reading("s1", 415.2, 0);
        stamped.received_at = stamped.received_at.with_nanosecond(123_456_789).unwrap();
        sink.insert(&stamped).unwrap();

        let conn = lock(&sink.conn).unwrap();
        let column: String = conn
            .query_row("SELECT received_at FROM sensor_readings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(column, "2026-03-01T12:00:00.123Z");
        assert_eq!(column, stamped.frame().timestamp);
    }

    #[test]
    fn test_recent_is_newest_first_and_limited() {
        let sink = SqliteSink::open_in_memory().unwrap();
        for i in 0..5 {
            sink.insert(&reading("s1", 400.0 + i as f64, i)).unwrap();
        }

        let recent = sink.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].co2_ppm, 404.0);
        assert_eq!(recent[1].co2_ppm, 403.0);
    }

    #[test]
    fn test_sensor_counts() {
        let sink = SqliteSink::open_in_memory().unwrap();
        sink.insert(&reading("b", 1.0, 0)).unwrap();
        sink.insert(&reading("a", 1.0, 1)).unwrap();
        sink.insert(&reading("b", 1.0, 2)).unwrap();

        assert_eq!(
            sink.sensors().unwrap(),
            vec![("a".to_string(), 1), ("b".to_string(), 2)]
        );
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readings.db");

        {
            let sink = SqliteSink::open(&path).unwrap();
            sink.insert(&reading("s1", 415.0, 0)).unwrap();
        }

        let reopened = SqliteSink::open(&path).unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writes() {
        let sink = SqliteSink::open_in_memory().unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let sink = sink.clone();
            tasks.spawn(async move { sink.write(&reading("s", i as f64, i)).await });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        assert_eq!(sink.count().unwrap(), 16);
    }
}
