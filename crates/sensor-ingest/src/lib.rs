// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sensor Ingestion Service
//!
//! Bridges sensors publishing over MQTT to a durable store and to live
//! WebSocket dashboards, with each sink in its own failure domain.
//!
//! # Features
//!
//! - **Decoding**: `sensors/<id>/data` topics with `{"co2_ppm", "temperature"}` payloads
//! - **Persistence**: SQLite writes with a deadline, optional retry, bounded concurrency
//! - **Fan-out**: fire-and-forget push to every connected dashboard; slow clients are evicted
//! - **Resilience**: broker reconnect with capped exponential backoff
//!
//! # Quick Start
//!
//! ```bash
//! # Default broker (localhost:1883), dashboards on ws://0.0.0.0:3002/ws
//! sensor-ingest
//!
//! # Using config file
//! sensor-ingest --config ingest.toml
//!
//! # Inspect the store
//! sensor-ingest recent --limit 20
//! ```
//!
//! # Architecture
//!
//! ```text
//! MQTT broker
//!     |
//! Coordinator (connect / subscribe / reconnect)
//!     | bounded queue
//! Pipeline: decode -> PersistenceWriter -> SqliteSink
//!                  -> BroadcastHub -> WebSocket sessions
//! ```

pub mod backoff;
pub mod broker;
pub mod config;
pub mod coordinator;
pub mod decoder;
pub mod hub;
pub mod pipeline;
pub mod reading;
pub mod service;
pub mod session;
pub mod shutdown;
pub mod sqlite;
pub mod stats;
pub mod store;
pub mod writer;

pub use broker::{Broker, BrokerError, BrokerEvent, MqttBroker, ScriptHandle, ScriptedBroker};
pub use config::{ConfigError, IngestConfig};
pub use coordinator::{ConnectionState, Coordinator};
pub use decoder::{decode, DecodeError};
pub use hub::{BroadcastHub, ChannelSession, SendError, SubscriberSession, SubscriptionHandle};
pub use reading::Reading;
pub use service::{IngestError, IngestHandle, IngestService};
pub use sqlite::SqliteSink;
pub use stats::{PipelineStats, StatsSnapshot};
pub use store::{MemorySink, PersistenceSink, WriteError};
