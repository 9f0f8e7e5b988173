// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ingestion coordinator.
//!
//! Owns the broker connection and its lifecycle:
//!
//! ```text
//! Disconnected --poll--> Connecting --SubAck--> Subscribed
//!      ^                     |                      |
//!      +----- backoff -------+------ error ---------+
//! ```
//!
//! Every message is stamped and queued to the pipeline worker with
//! `try_send`, so a slow store or slow subscriber never stalls the broker
//! read loop. Reconnects are unbounded in count, capped in delay.

use crate::backoff::Backoff;
use crate::broker::{Broker, BrokerEvent};
use crate::config::BrokerConfig;
use crate::pipeline::InboundMessage;
use crate::reading::received_now;
use crate::shutdown::Shutdown;
use crate::stats::PipelineStats;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Broker connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Subscribed => write!(f, "subscribed"),
        }
    }
}

/// Broker-side half of the ingestion core.
pub struct Coordinator<B: Broker> {
    broker: B,
    topic_filter: String,
    backoff: Backoff,
    /// Subscribe sent on the current connection (MQTT may deliver before SUBACK).
    subscribe_sent: bool,
    queue: mpsc::Sender<InboundMessage>,
    state: watch::Sender<ConnectionState>,
    stats: Arc<PipelineStats>,
    shutdown: Shutdown,
}

impl<B: Broker> Coordinator<B> {
    pub fn new(
        broker: B,
        config: &BrokerConfig,
        queue: mpsc::Sender<InboundMessage>,
        stats: Arc<PipelineStats>,
        shutdown: Shutdown,
    ) -> (Self, watch::Receiver<ConnectionState>) {
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        let backoff = Backoff::new(
            config.reconnect.initial_delay(),
            config.reconnect.max_delay(),
            u32::from(config.port),
        );

        (
            Self {
                broker,
                topic_filter: config.topic_filter.clone(),
                backoff,
                subscribe_sent: false,
                queue,
                state,
                stats,
                shutdown,
            },
            state_rx,
        )
    }

    /// Run until shutdown or until the pipeline goes away.
    ///
    /// Dropping the coordinator on return closes the pipeline queue, which
    /// lets the worker drain what is already queued.
    pub async fn run(mut self) {
        info!(
            "Connecting to {} (filter '{}')",
            self.broker.endpoint(),
            self.topic_filter
        );
        self.set_state(ConnectionState::Connecting);

        loop {
            let event = tokio::select! {
                _ = self.shutdown.wait() => break,
                event = self.broker.poll() => event,
            };

            let keep_running = match event {
                Ok(event) => self.on_event(event).await,
                Err(e) => self.on_connection_lost(&e).await,
            };
            if !keep_running {
                break;
            }
        }

        self.broker.disconnect();
        self.set_state(ConnectionState::Disconnected);
        info!("Coordinator stopped");
    }

    async fn on_event(&mut self, event: BrokerEvent) -> bool {
        match event {
            BrokerEvent::ConnAck => {
                info!("Connected to {}", self.broker.endpoint());
                if let Err(e) = self.broker.subscribe(&self.topic_filter) {
                    return self.reconnect(&e).await;
                }
                self.subscribe_sent = true;
                debug!("Subscribe requested for '{}'", self.topic_filter);
            }
            BrokerEvent::SubAck { granted: true } => {
                self.backoff.reset();
                self.set_state(ConnectionState::Subscribed);
                info!("Subscribed to '{}'", self.topic_filter);
            }
            BrokerEvent::SubAck { granted: false } => {
                error!("Broker rejected subscription to '{}'", self.topic_filter);
                return self.reconnect(&"subscription rejected").await;
            }
            BrokerEvent::Message { topic, payload } => return self.on_message(topic, payload),
            BrokerEvent::Other => {}
        }
        true
    }

    fn on_message(&mut self, topic: String, payload: Vec<u8>) -> bool {
        if !self.subscribe_sent {
            debug!("Ignoring message on '{}' outside a subscription", topic);
            return true;
        }

        PipelineStats::incr(&self.stats.messages_received);
        let message = InboundMessage {
            topic,
            payload,
            received_at: received_now(),
        };

        match self.queue.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                PipelineStats::incr(&self.stats.messages_overflowed);
                warn!("Pipeline queue full, dropping message on '{}'", message.topic);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Pipeline worker is gone, stopping coordinator");
                false
            }
        }
    }

    /// Tear the connection down on purpose, then go through the usual
    /// reconnect path.
    async fn reconnect(&mut self, reason: &(dyn fmt::Display + Sync)) -> bool {
        self.broker.disconnect();
        self.on_connection_lost(reason).await
    }

    /// Wait out the backoff delay. Returns `false` if shutdown fired meanwhile.
    async fn on_connection_lost(&mut self, reason: &(dyn fmt::Display + Sync)) -> bool {
        PipelineStats::incr(&self.stats.disconnects);
        self.subscribe_sent = false;
        self.set_state(ConnectionState::Disconnected);

        let delay = self.backoff.next_delay();
        warn!(
            "Broker connection lost ({}), reconnecting in {:?} (attempt {})",
            reason,
            delay,
            self.backoff.attempt()
        );

        tokio::select! {
            _ = self.shutdown.wait() => return false,
            _ = tokio::time::sleep(delay) => {}
        }

        self.set_state(ConnectionState::Connecting);
        true
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Broker state: {} -> {}", previous, state);
        }
    }
}
