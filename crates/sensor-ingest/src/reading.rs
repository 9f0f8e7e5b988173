// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sensor reading and its live push frame.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// One sensor measurement, as accepted by the pipeline.
///
/// Built once per inbound message and then shared read-only
/// (`Arc<Reading>`) between the store and the live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Sensor identifier (second segment of `sensors/<id>/data`)
    pub sensor_id: String,

    /// CO2 concentration in ppm
    pub co2_ppm: f64,

    /// Temperature in degrees Celsius
    pub temperature_celsius: f64,

    /// Receipt time, stamped by the coordinator
    pub received_at: DateTime<Utc>,
}

/// Receipt time for a message arriving now, at the precision every sink keeps.
pub fn received_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

impl Reading {
    /// `received_at` as RFC 3339 UTC with millisecond precision.
    ///
    /// The store column and the push frame both carry this exact string.
    pub fn timestamp(&self) -> String {
        self.received_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Live push frame for this reading.
    pub fn frame(&self) -> LiveFrame<'_> {
        LiveFrame {
            sensor_id: &self.sensor_id,
            co2_ppm: self.co2_ppm,
            temperature: self.temperature_celsius,
            timestamp: self.timestamp(),
        }
    }
}

/// JSON frame pushed to dashboards, one per reading.
///
/// ```json
/// {"sensor_id": "INDUSTRY-001", "co2_ppm": 415.2, "temperature": 28.1,
///  "timestamp": "2026-01-05T10:00:00.000Z"}
/// ```
#[derive(Debug, Serialize)]
pub struct LiveFrame<'a> {
    pub sensor_id: &'a str,
    pub co2_ppm: f64,
    pub temperature: f64,
    pub timestamp: String,
}

impl LiveFrame<'_> {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
