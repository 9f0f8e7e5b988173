// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service configuration.
//!
//! Loaded from TOML, every field optional:
//!
//! ```toml
//! log_level = "info"
//! stats_interval_secs = 30
//!
//! [broker]
//! host = "mosquitto"
//! port = 1883
//! topic_filter = "sensors/+/data"
//!
//! [broker.reconnect]
//! initial_delay_ms = 500
//! max_delay_ms = 30000
//!
//! [store]
//! path = "sensor_readings.db"
//! write_timeout_ms = 5000
//! retry_attempts = 0
//!
//! [subscribers]
//! bind = "0.0.0.0:3002"
//! max_clients = 100
//! ```

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive).
    pub log_level: String,

    /// Statistics reporting interval (seconds, 0 to disable).
    pub stats_interval_secs: u64,

    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub subscribers: SubscriberConfig,
    pub pipeline: PipelineConfig,
}

/// MQTT broker connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Subscription filter for reading topics.
    pub topic_filter: String,
    pub keep_alive_secs: u64,
    /// Outgoing request capacity of the MQTT client.
    pub request_capacity: usize,
    pub reconnect: ReconnectConfig,
}

/// Reconnect backoff bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Durable store and write hardening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file.
    pub path: String,
    /// Deadline for a single write attempt.
    pub write_timeout_ms: u64,
    /// Extra attempts after a failed write (0 = log and drop).
    pub retry_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub retry_delay_ms: u64,
    /// Readings waiting for the writer before new ones are dropped.
    pub queue_capacity: usize,
    pub max_concurrent_writes: usize,
}

/// Live subscriber endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    pub bind: String,
    pub max_clients: usize,
    /// Per-session outbound buffer (frames). A full buffer evicts the session.
    pub buffer: usize,
}

/// Broker-to-worker hand-off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            stats_interval_secs: 30,
            broker: BrokerConfig::default(),
            store: StoreConfig::default(),
            subscribers: SubscriberConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "sensor-ingest".to_string(),
            topic_filter: "sensors/+/data".to_string(),
            keep_alive_secs: 30,
            request_capacity: 16,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "sensor_readings.db".to_string(),
            write_timeout_ms: 5_000,
            retry_attempts: 0,
            retry_delay_ms: 200,
            queue_capacity: 1024,
            max_concurrent_writes: 4,
        }
    }
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3002".to_string(),
            max_clients: 100,
            buffer: 64,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

impl IngestConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML (for `gen-config`).
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.is_empty() {
            return Err(ConfigError::Invalid("broker.host is empty".into()));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::Invalid("broker.port must be non-zero".into()));
        }
        if self.broker.client_id.is_empty() {
            return Err(ConfigError::Invalid("broker.client_id is empty".into()));
        }
        if self.broker.topic_filter.is_empty() {
            return Err(ConfigError::Invalid("broker.topic_filter is empty".into()));
        }
        if self.broker.keep_alive_secs == 0 {
            return Err(ConfigError::Invalid(
                "broker.keep_alive_secs must be non-zero".into(),
            ));
        }
        if self.broker.request_capacity == 0 {
            return Err(ConfigError::Invalid(
                "broker.request_capacity must be non-zero".into(),
            ));
        }
        if self.broker.reconnect.initial_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "broker.reconnect.initial_delay_ms must be non-zero".into(),
            ));
        }
        if self.broker.reconnect.max_delay_ms < self.broker.reconnect.initial_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "broker.reconnect.max_delay_ms ({}) is below initial_delay_ms ({})",
                self.broker.reconnect.max_delay_ms, self.broker.reconnect.initial_delay_ms
            )));
        }

        if self.store.path.is_empty() {
            return Err(ConfigError::Invalid("store.path is empty".into()));
        }
        if self.store.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "store.write_timeout_ms must be non-zero".into(),
            ));
        }
        if self.store.queue_capacity == 0 || self.store.max_concurrent_writes == 0 {
            return Err(ConfigError::Invalid(
                "store.queue_capacity and store.max_concurrent_writes must be non-zero".into(),
            ));
        }

        self.subscribers.bind.parse::<SocketAddr>().map_err(|e| {
            ConfigError::Invalid(format!(
                "subscribers.bind '{}' is not a socket address: {}",
                self.subscribers.bind, e
            ))
        })?;
        if self.subscribers.max_clients == 0 || self.subscribers.buffer == 0 {
            return Err(ConfigError::Invalid(
                "subscribers.max_clients and subscribers.buffer must be non-zero".into(),
            ));
        }

        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.queue_capacity must be non-zero".into(),
            ));
        }

        Ok(())
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl StoreConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
