// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message decoder.
//!
//! Turns a broker topic plus raw payload into a [`Reading`]:
//!
//! ```text
//! topic:   sensors/INDUSTRY-001/data
//! payload: {"co2_ppm": 415.2, "temperature": 28.1}
//! ```
//!
//! Decoding is a pure function. The receipt timestamp is passed in by the
//! caller so every sink observes the same value.

use crate::reading::Reading;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// First topic segment of every reading topic.
pub const TOPIC_PREFIX: &str = "sensors";

/// Last topic segment of every reading topic.
pub const TOPIC_SUFFIX: &str = "data";

/// Decoding errors. Both are local: the message is dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed topic '{topic}' (expected sensors/<sensor_id>/data)")]
    MalformedTopic { topic: String },

    #[error("malformed payload: {reason}")]
    MalformedPayload { reason: String },
}

#[derive(Deserialize)]
struct Payload {
    co2_ppm: f64,
    temperature: f64,
}

/// Decode a broker message into a reading stamped with `received_at`.
pub fn decode(
    topic: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<Reading, DecodeError> {
    let sensor_id = sensor_id_from_topic(topic)?;

    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::MalformedPayload {
            reason: "empty body".into(),
        });
    }

    let malformed = |e: serde_json::Error| DecodeError::MalformedPayload {
        reason: e.to_string(),
    };

    // Serde's derived visitor also takes a positional array; only objects are readings.
    let value: Value = serde_json::from_slice(payload).map_err(malformed)?;
    if !value.is_object() {
        return Err(DecodeError::MalformedPayload {
            reason: "expected a JSON object".into(),
        });
    }
    let body = Payload::deserialize(value).map_err(malformed)?;

    Ok(Reading {
        sensor_id: sensor_id.to_string(),
        co2_ppm: body.co2_ppm,
        temperature_celsius: body.temperature,
        received_at,
    })
}

/// Extract `<sensor_id>` from `sensors/<sensor_id>/data`.
pub fn sensor_id_from_topic(topic: &str) -> Result<&str, DecodeError> {
    let malformed = || DecodeError::MalformedTopic {
        topic: topic.to_string(),
    };

    let mut segments = topic.split('/');
    let (Some(prefix), Some(sensor_id), Some(suffix), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(malformed());
    };

    if prefix != TOPIC_PREFIX || suffix != TOPIC_SUFFIX || sensor_id.is_empty() {
        return Err(malformed());
    }

    Ok(sensor_id)
}
