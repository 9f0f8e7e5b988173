// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Persistence writer.
//!
//! Sits between the pipeline worker and a [`PersistenceSink`]:
//!
//! ```text
//! pipeline --try_send--> [bounded queue] --> writer task --(semaphore)--> sink.write()
//!                                                          deadline + retry
//! ```
//!
//! The pipeline never awaits a write. A full queue drops the reading with
//! [`WriteError::Backlogged`]. Writes for the same sensor are not ordered
//! relative to each other.

use crate::backoff::Backoff;
use crate::config::StoreConfig;
use crate::reading::Reading;
use crate::stats::PipelineStats;
use crate::store::{PersistenceSink, WriteError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Write hardening settings.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub queue_capacity: usize,
    pub max_concurrent_writes: usize,
    pub write_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl From<&StoreConfig> for WriterConfig {
    fn from(config: &StoreConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            max_concurrent_writes: config.max_concurrent_writes,
            write_timeout: config.write_timeout(),
            retry_attempts: config.retry_attempts,
            retry_delay: config.retry_delay(),
        }
    }
}

/// Sending side of the writer queue. Cheap to clone.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<Arc<Reading>>,
}

impl WriteQueue {
    /// Hand a reading to the writer without waiting.
    pub fn submit(&self, reading: Arc<Reading>) -> Result<(), WriteError> {
        self.tx.try_send(reading).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => WriteError::Backlogged,
            mpsc::error::TrySendError::Closed(_) => WriteError::Closed,
        })
    }
}

/// Spawns and owns the writer task.
pub struct PersistenceWriter;

impl PersistenceWriter {
    /// Start the writer. It runs until every [`WriteQueue`] clone is dropped,
    /// then finishes (or times out) in-flight writes and exits.
    pub fn spawn<S: PersistenceSink>(
        sink: Arc<S>,
        config: WriterConfig,
        stats: Arc<PipelineStats>,
    ) -> (WriteQueue, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let task = tokio::spawn(Self::run(rx, sink, config, stats));
        (WriteQueue { tx }, task)
    }

    async fn run<S: PersistenceSink>(
        mut rx: mpsc::Receiver<Arc<Reading>>,
        sink: Arc<S>,
        config: WriterConfig,
        stats: Arc<PipelineStats>,
    ) {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_writes.max(1)));
        let mut in_flight = JoinSet::new();

        while let Some(reading) = rx.recv().await {
            // Only fails if the semaphore is closed, which never happens here.
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };

            let sink = Arc::clone(&sink);
            let config = config.clone();
            let stats = Arc::clone(&stats);
            in_flight.spawn(async move {
                match write_with_retry(sink.as_ref(), &reading, &config).await {
                    Ok(()) => PipelineStats::incr(&stats.readings_persisted),
                    Err(e) => {
                        PipelineStats::incr(&stats.write_errors);
                        warn!(
                            "Failed to persist reading from '{}': {}",
                            reading.sensor_id, e
                        );
                    }
                }
                drop(permit);
            });

            // Reap finished writes so the set does not grow unbounded.
            while in_flight.try_join_next().is_some() {}
        }

        let pending = in_flight.len();
        if pending > 0 {
            info!("Writer draining {} in-flight writes", pending);
        }
        while in_flight.join_next().await.is_some() {}
        debug!("Writer stopped");
    }
}

/// One write with a deadline per attempt and optional retries.
pub async fn write_with_retry<S: PersistenceSink>(
    sink: &S,
    reading: &Reading,
    config: &WriterConfig,
) -> Result<(), WriteError> {
    let mut backoff = Backoff::new(
        config.retry_delay,
        config.retry_delay.saturating_mul(32),
        reading.sensor_id.len() as u32,
    );

    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(config.write_timeout, sink.write(reading)).await {
            Ok(result) => result,
            Err(_) => Err(WriteError::Timeout(config.write_timeout)),
        };

        match result {
            Ok(()) => return Ok(()),
            Err(e) if attempt < config.retry_attempts => {
                attempt += 1;
                let delay = backoff.next_delay();
                debug!(
                    "Write for '{}' failed ({}), retry {}/{} in {:?}",
                    reading.sensor_id, e, attempt, config.retry_attempts, delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySink;
    use chrono::Utc;
    use std::future::Future;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn reading(id: &str) -> Arc<Reading> {
        Arc::new(Reading {
            sensor_id: id.into(),
            co2_ppm: 415.2,
            temperature_celsius: 28.1,
            received_at: Utc::now(),
        })
    }

    fn config() -> WriterConfig {
        WriterConfig {
            queue_capacity: 8,
            max_concurrent_writes: 2,
            write_timeout: Duration::from_millis(200),
            retry_attempts: 0,
            retry_delay: Duration::from_millis(1),
        }
    }

    /// Never completes a write.
    struct HungSink;

    impl PersistenceSink for HungSink {
        fn write(&self, _: &Reading) -> impl Future<Output = Result<(), WriteError>> + Send {
            std::future::pending()
        }
    }

    /// Fails the first `n` writes.
    struct FlakySink {
        failures_left: AtomicU32,
        inner: MemorySink,
    }

    impl PersistenceSink for FlakySink {
        async fn write(&self, reading: &Reading) -> Result<(), WriteError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(WriteError::Store("transient".into()));
            }
            self.inner.write(reading).await
        }
    }

    #[tokio::test]
    async fn test_writes_reach_sink() {
        let sink = Arc::new(MemorySink::new());
        let stats = Arc::new(PipelineStats::new());
        let (queue, task) = PersistenceWriter::spawn(Arc::clone(&sink), config(), Arc::clone(&stats));

        queue.submit(reading("a")).unwrap();
        queue.submit(reading("b")).unwrap();
        drop(queue);
        task.await.unwrap();

        assert_eq!(sink.readings().len(), 2);
        assert_eq!(stats.snapshot().readings_persisted, 2);
    }

    #[tokio::test]
    async fn test_failed_write_is_counted_not_retried() {
        let sink = Arc::new(MemorySink::failing());
        let stats = Arc::new(PipelineStats::new());
        let (queue, task) = PersistenceWriter::spawn(Arc::clone(&sink), config(), Arc::clone(&stats));

        queue.submit(reading("a")).unwrap();
        drop(queue);
        task.await.unwrap();

        assert_eq!(sink.attempts(), 1);
        assert_eq!(stats.snapshot().write_errors, 1);
    }

    #[tokio::test]
    async fn test_hung_sink_times_out() {
        let result = write_with_retry(&HungSink, &reading("a"), &config()).await;
        assert!(matches!(result, Err(WriteError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_retry_recovers_transient_failure() {
        let sink = FlakySink {
            failures_left: AtomicU32::new(2),
            inner: MemorySink::new(),
        };
        let config = WriterConfig {
            retry_attempts: 2,
            ..config()
        };

        write_with_retry(&sink, &reading("a"), &config).await.unwrap();
        assert_eq!(sink.inner.readings().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let sink = MemorySink::failing();
        let config = WriterConfig {
            retry_attempts: 3,
            ..config()
        };

        assert!(write_with_retry(&sink, &reading("a"), &config).await.is_err());
        assert_eq!(sink.attempts(), 4);
    }

    #[tokio::test]
    async fn test_full_queue_reports_backlog() {
        let stats = Arc::new(PipelineStats::new());
        let config = WriterConfig {
            queue_capacity: 1,
            max_concurrent_writes: 1,
            ..config()
        };
        let (queue, _task) = PersistenceWriter::spawn(Arc::new(HungSink), config, stats);

        // One write parks in the sink, one waits for a permit, one fills the queue.
        let mut backlogged = false;
        for _ in 0..8 {
            if matches!(queue.submit(reading("a")), Err(WriteError::Backlogged)) {
                backlogged = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(backlogged);
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let stats = Arc::new(PipelineStats::new());
        let (queue, task) = PersistenceWriter::spawn(Arc::new(MemorySink::new()), config(), stats);
        task.abort();
        let _ = task.await;

        assert!(matches!(queue.submit(reading("a")), Err(WriteError::Closed)));
    }
}
