// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-message pipeline worker.
//!
//! Runs serially, one message at a time in broker delivery order:
//!
//! 1. decode (malformed messages are counted and dropped)
//! 2. hand the reading to the persistence writer (never awaited)
//! 3. broadcast the reading to live subscribers, whatever step 2 did

use crate::decoder::decode;
use crate::hub::BroadcastHub;
use crate::reading::Reading;
use crate::stats::PipelineStats;
use crate::writer::WriteQueue;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Raw broker message, stamped at receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Decoder -> writer -> hub.
pub struct Pipeline {
    writer: WriteQueue,
    hub: BroadcastHub,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub fn new(writer: WriteQueue, hub: BroadcastHub, stats: Arc<PipelineStats>) -> Self {
        Self { writer, hub, stats }
    }

    /// Consume messages until every sender is gone.
    pub async fn run(self, mut rx: mpsc::Receiver<InboundMessage>) {
        while let Some(message) = rx.recv().await {
            self.process(message);
        }
        debug!("Pipeline drained");
    }

    /// Handle one message. Returns the accepted reading, if any.
    pub fn process(&self, message: InboundMessage) -> Option<Arc<Reading>> {
        let reading = match decode(&message.topic, &message.payload, message.received_at) {
            Ok(reading) => Arc::new(reading),
            Err(e) => {
                PipelineStats::incr(&self.stats.decode_errors);
                warn!("Dropping message on '{}': {}", message.topic, e);
                return None;
            }
        };

        if let Err(e) = self.writer.submit(Arc::clone(&reading)) {
            PipelineStats::incr(&self.stats.write_errors);
            warn!("Reading from '{}' not persisted: {}", reading.sensor_id, e);
        }

        let outcome = self.hub.broadcast(&reading);
        trace!(
            "[{}] co2={} temp={} -> {} sessions",
            reading.sensor_id,
            reading.co2_ppm,
            reading.temperature_celsius,
            outcome.delivered
        );

        Some(reading)
    }
}
