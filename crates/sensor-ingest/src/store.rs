// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Persistence sink abstraction.
//!
//! The pipeline only needs `write`. Backends must tolerate concurrent calls;
//! the pipeline wraps every call in a deadline (see [`crate::writer`]).
//!
//! # Implementations
//!
//! - `SqliteSink` -- Default, bundled SQLite
//! - `MemorySink` -- In-process, for tests and dry runs

use crate::reading::Reading;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a persistence sink or by the writer around it.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("store error: {0}")]
    Store(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("write timed out after {0:?}")]
    Timeout(Duration),

    #[error("write queue full, reading dropped")]
    Backlogged,

    #[error("writer stopped")]
    Closed,
}

/// Durable destination for accepted readings.
pub trait PersistenceSink: Send + Sync + 'static {
    /// Write one reading durably.
    fn write(&self, reading: &Reading) -> impl Future<Output = Result<(), WriteError>> + Send;
}

/// In-memory sink.
///
/// Records every accepted reading. Can be switched to fail every write,
/// which is how the pipeline's sink isolation is exercised.
#[derive(Debug, Default)]
pub struct MemorySink {
    readings: Mutex<Vec<Reading>>,
    failing: AtomicBool,
    attempts: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose writes always fail.
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.set_failing(true);
        sink
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Readings stored so far.
    pub fn readings(&self) -> Vec<Reading> {
        self.lock().clone()
    }

    /// Number of `write` calls, failed ones included.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Reading>> {
        self.readings.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PersistenceSink for MemorySink {
    fn write(&self, reading: &Reading) -> impl Future<Output = Result<(), WriteError>> + Send {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let result = if self.failing.load(Ordering::SeqCst) {
            Err(WriteError::Store("store unavailable".into()))
        } else {
            self.lock().push(reading.clone());
            Ok(())
        };

        std::future::ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reading(id: &str) -> Reading {
        Reading {
            sensor_id: id.into(),
            co2_ppm: 410.0,
            temperature_celsius: 21.0,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_sink_records() {
        let sink = MemorySink::new();
        sink.write(&reading("a")).await.unwrap();
        sink.write(&reading("b")).await.unwrap();

        let ids: Vec<_> = sink.readings().into_iter().map(|r| r.sensor_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(sink.attempts(), 2);
    }

    #[tokio::test]
    async fn test_failing_sink() {
        let sink = MemorySink::failing();
        assert!(matches!(
            sink.write(&reading("a")).await,
            Err(WriteError::Store(_))
        ));
        assert!(sink.readings().is_empty());
        assert_eq!(sink.attempts(), 1);

        sink.set_failing(false);
        sink.write(&reading("a")).await.unwrap();
        assert_eq!(sink.readings().len(), 1);
    }
}
