// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pipeline statistics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters shared by the coordinator, the pipeline worker, the store
/// writer and the hub.
#[derive(Debug)]
pub struct PipelineStats {
    /// Messages taken off the broker connection.
    pub messages_received: AtomicU64,

    /// Messages dropped because the pipeline queue was full.
    pub messages_overflowed: AtomicU64,

    /// Messages rejected by the decoder.
    pub decode_errors: AtomicU64,

    /// Readings written to the store.
    pub readings_persisted: AtomicU64,

    /// Readings the store failed to accept (after retries).
    pub write_errors: AtomicU64,

    /// Readings offered to the broadcast hub.
    pub readings_broadcast: AtomicU64,

    /// Individual session deliveries.
    pub deliveries: AtomicU64,

    /// Sessions evicted after a failed send.
    pub sessions_evicted: AtomicU64,

    /// Broker connection losses.
    pub disconnects: AtomicU64,

    /// Service start time.
    pub started: Instant,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_overflowed: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            readings_persisted: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            readings_broadcast: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            sessions_evicted: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_overflowed: self.messages_overflowed.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            readings_persisted: self.readings_persisted.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            readings_broadcast: self.readings_broadcast.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            sessions_evicted: self.sessions_evicted.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs_f64(),
        }
    }
}

/// Snapshot of pipeline statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub messages_received: u64,
    pub messages_overflowed: u64,
    pub decode_errors: u64,
    pub readings_persisted: u64,
    pub write_errors: u64,
    pub readings_broadcast: u64,
    pub deliveries: u64,
    pub sessions_evicted: u64,
    pub disconnects: u64,
    pub uptime_secs: f64,
}

impl StatsSnapshot {
    /// Calculate messages per second.
    pub fn messages_per_second(&self) -> f64 {
        if self.uptime_secs > 0.0 {
            self.messages_received as f64 / self.uptime_secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} msgs ({:.1} msg/s), {} stored, {} broadcast ({} deliveries), \
             {} decode errors, {} write errors, {} overflowed, {} evicted, {} disconnects",
            self.messages_received,
            self.messages_per_second(),
            self.readings_persisted,
            self.readings_broadcast,
            self.deliveries,
            self.decode_errors,
            self.write_errors,
            self.messages_overflowed,
            self.sessions_evicted,
            self.disconnects
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = PipelineStats::new();
        PipelineStats::incr(&stats.messages_received);
        PipelineStats::incr(&stats.messages_received);
        PipelineStats::incr(&stats.decode_errors);
        PipelineStats::add(&stats.deliveries, 3);

        let snap = stats.snapshot();
        assert_eq!(snap.messages_received, 2);
        assert_eq!(snap.decode_errors, 1);
        assert_eq!(snap.deliveries, 3);
        assert_eq!(snap.write_errors, 0);
    }

    #[test]
    fn test_rate_with_zero_uptime() {
        let snap = StatsSnapshot {
            messages_received: 10,
            ..Default::default()
        };
        assert_eq!(snap.messages_per_second(), 0.0);
    }
}
