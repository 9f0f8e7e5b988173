// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker abstraction.
//!
//! The coordinator drives a [`Broker`] one event at a time. Two
//! implementations:
//!
//! - [`MqttBroker`] -- real MQTT 3.1.1 client (rumqttc)
//! - [`ScriptedBroker`] -- in-process broker for tests, fed through a
//!   [`ScriptHandle`]
//!
//! A `poll` error means the connection is gone; the next `poll` attempts a
//! fresh connection. Subscriptions do not survive a reconnect.

use crate::config::BrokerConfig;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeReasonCode};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Broker errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("subscribe request failed: {0}")]
    Subscribe(String),
}

/// Event surfaced to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Session established.
    ConnAck,

    /// Answer to the last subscribe request.
    SubAck { granted: bool },

    /// A published message on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },

    /// Anything else (pings, outgoing acks).
    Other,
}

/// Message source driven by the coordinator.
pub trait Broker: Send + 'static {
    /// Next event. Connects first if there is no live connection.
    fn poll(&mut self) -> impl Future<Output = Result<BrokerEvent, BrokerError>> + Send;

    /// Queue a subscribe request; the answer arrives as [`BrokerEvent::SubAck`].
    fn subscribe(&mut self, filter: &str) -> Result<(), BrokerError>;

    /// Tear the current connection down now. The next `poll` reconnects.
    fn disconnect(&mut self);

    /// Endpoint label for logs.
    fn endpoint(&self) -> String;
}

// ============================================================================
// MQTT
// ============================================================================

/// MQTT broker connection.
pub struct MqttBroker {
    client: AsyncClient,
    eventloop: EventLoop,
    options: MqttOptions,
    request_capacity: usize,
}

impl MqttBroker {
    pub fn new(config: &BrokerConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options.clone(), config.request_capacity);
        Self {
            client,
            eventloop,
            options,
            request_capacity: config.request_capacity,
        }
    }
}

impl Broker for MqttBroker {
    async fn poll(&mut self) -> Result<BrokerEvent, BrokerError> {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => Ok(BrokerEvent::ConnAck),
            Ok(Event::Incoming(Packet::SubAck(ack))) => Ok(BrokerEvent::SubAck {
                granted: !ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure)),
            }),
            Ok(Event::Incoming(Packet::Publish(publish))) => Ok(BrokerEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            }),
            Ok(_) => Ok(BrokerEvent::Other),
            Err(e) => Err(BrokerError::Connection(e.to_string())),
        }
    }

    fn subscribe(&mut self, filter: &str) -> Result<(), BrokerError> {
        self.client
            .try_subscribe(filter, QoS::AtLeastOnce)
            .map_err(|e| BrokerError::Subscribe(e.to_string()))
    }

    /// Drops the event loop, closing the socket now. The next `poll`
    /// dials a fresh connection with an empty request queue.
    fn disconnect(&mut self) {
        let (client, eventloop) = AsyncClient::new(self.options.clone(), self.request_capacity);
        self.client = client;
        self.eventloop = eventloop;
    }

    fn endpoint(&self) -> String {
        let (host, port) = self.options.broker_address();
        format!("mqtt://{}:{}", host, port)
    }
}

// ============================================================================
// Scripted broker for tests
// ============================================================================

enum ScriptStep {
    Publish { topic: String, payload: Vec<u8> },
    Drop,
}

#[derive(Default)]
struct ScriptShared {
    subscriptions: Mutex<Vec<String>>,
    connects: AtomicUsize,
    refuse: AtomicUsize,
    reject: AtomicUsize,
}

/// In-process broker that behaves like a well-mannered MQTT server.
/// It connects on demand, grants subscriptions unless told to reject them,
/// and delivers whatever the [`ScriptHandle`] publishes. Once the script is
/// exhausted `poll` pends.
pub struct ScriptedBroker {
    steps: mpsc::UnboundedReceiver<ScriptStep>,
    shared: Arc<ScriptShared>,
    connected: bool,
    pending_acks: usize,
}

/// Drives a [`ScriptedBroker`] from test code.
#[derive(Clone)]
pub struct ScriptHandle {
    steps: mpsc::UnboundedSender<ScriptStep>,
    shared: Arc<ScriptShared>,
}

impl ScriptedBroker {
    pub fn new() -> (Self, ScriptHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ScriptShared::default());
        (
            Self {
                steps: rx,
                shared: Arc::clone(&shared),
                connected: false,
                pending_acks: 0,
            },
            ScriptHandle { steps: tx, shared },
        )
    }
}

impl ScriptHandle {
    /// Deliver a message to the subscriber.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let _ = self.steps.send(ScriptStep::Publish {
            topic: topic.to_string(),
            payload: payload.into(),
        });
    }

    /// Drop the connection after the steps queued so far.
    pub fn drop_connection(&self) {
        let _ = self.steps.send(ScriptStep::Drop);
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connects(&self, n: usize) {
        self.shared.refuse.store(n, Ordering::SeqCst);
    }

    /// Answer the next `n` subscribe requests with a failure code.
    pub fn reject_subscriptions(&self, n: usize) {
        self.shared.reject.store(n, Ordering::SeqCst);
    }

    /// Every filter subscribed so far, in order.
    pub fn subscriptions(&self) -> Vec<String> {
        match self.shared.subscriptions.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Successful connections so far.
    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }
}

impl Broker for ScriptedBroker {
    async fn poll(&mut self) -> Result<BrokerEvent, BrokerError> {
        if !self.connected {
            let refused = self
                .shared
                .refuse
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(BrokerError::Connection("connection refused".into()));
            }
            self.connected = true;
            self.shared.connects.fetch_add(1, Ordering::SeqCst);
            return Ok(BrokerEvent::ConnAck);
        }

        if self.pending_acks > 0 {
            self.pending_acks -= 1;
            let rejected = self
                .shared
                .reject
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            return Ok(BrokerEvent::SubAck { granted: !rejected });
        }

        match self.steps.recv().await {
            Some(ScriptStep::Publish { topic, payload }) => Ok(BrokerEvent::Message { topic, payload }),
            Some(ScriptStep::Drop) => {
                self.connected = false;
                self.pending_acks = 0;
                Err(BrokerError::Connection("connection reset by broker".into()))
            }
            None => std::future::pending().await,
        }
    }

    fn subscribe(&mut self, filter: &str) -> Result<(), BrokerError> {
        if !self.connected {
            return Err(BrokerError::Subscribe("not connected".into()));
        }
        match self.shared.subscriptions.lock() {
            Ok(mut guard) => guard.push(filter.to_string()),
            Err(poisoned) => poisoned.into_inner().push(filter.to_string()),
        }
        self.pending_acks += 1;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.pending_acks = 0;
    }

    fn endpoint(&self) -> String {
        "scripted://local".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_session_flow() {
        let (mut broker, handle) = ScriptedBroker::new();
        handle.publish("sensors/a/data", b"{}".to_vec());
        handle.drop_connection();

        assert_eq!(broker.poll().await, Ok(BrokerEvent::ConnAck));
        broker.subscribe("sensors/+/data").unwrap();
        assert_eq!(broker.poll().await, Ok(BrokerEvent::SubAck { granted: true }));
        assert_eq!(
            broker.poll().await,
            Ok(BrokerEvent::Message {
                topic: "sensors/a/data".into(),
                payload: b"{}".to_vec(),
            })
        );
        assert!(broker.poll().await.is_err());

        // Reconnects on the next poll.
        assert_eq!(broker.poll().await, Ok(BrokerEvent::ConnAck));
        assert_eq!(handle.connects(), 2);
        assert_eq!(handle.subscriptions(), vec!["sensors/+/data"]);
    }

    #[tokio::test]
    async fn test_refused_connects() {
        let (mut broker, handle) = ScriptedBroker::new();
        handle.refuse_connects(2);

        assert!(broker.poll().await.is_err());
        assert!(broker.poll().await.is_err());
        assert_eq!(broker.poll().await, Ok(BrokerEvent::ConnAck));
        assert_eq!(handle.connects(), 1);
    }

    #[tokio::test]
    async fn test_rejected_subscriptions() {
        let (mut broker, handle) = ScriptedBroker::new();
        handle.reject_subscriptions(1);

        assert_eq!(broker.poll().await, Ok(BrokerEvent::ConnAck));
        broker.subscribe("sensors/+/data").unwrap();
        assert_eq!(broker.poll().await, Ok(BrokerEvent::SubAck { granted: false }));
        broker.subscribe("sensors/+/data").unwrap();
        assert_eq!(broker.poll().await, Ok(BrokerEvent::SubAck { granted: true }));
    }

    #[test]
    fn test_subscribe_requires_connection() {
        let (mut broker, _handle) = ScriptedBroker::new();
        assert!(broker.subscribe("sensors/+/data").is_err());
    }

    #[tokio::test]
    async fn test_mqtt_endpoint_label() {
        let broker = MqttBroker::new(&BrokerConfig {
            host: "mosquitto".into(),
            ..BrokerConfig::default()
        });
        assert_eq!(broker.endpoint(), "mqtt://mosquitto:1883");
    }

    /// Accept one MQTT connection on `listener` and answer its CONNECT.
    async fn accept_and_connack(listener: &tokio::net::TcpListener) -> tokio::net::TcpStream {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 256];
        let n = socket.read(&mut buf).await.unwrap();
        assert!(n > 0);
        assert_eq!(buf[0], 0x10, "expected CONNECT");
        socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
        socket
    }

    #[tokio::test]
    async fn test_mqtt_disconnect_closes_socket_immediately() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut broker = MqttBroker::new(&BrokerConfig {
            host: "127.0.0.1".into(),
            port,
            ..BrokerConfig::default()
        });

        let (event, mut server_side) =
            tokio::join!(broker.poll(), accept_and_connack(&listener));
        assert_eq!(event, Ok(BrokerEvent::ConnAck));

        // Torn down without another poll and without a DISCONNECT packet.
        broker.disconnect();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), server_side.read(&mut buf))
            .await
            .expect("socket still open")
            .unwrap_or(0);
        assert_eq!(n, 0);

        // The next poll dials a fresh connection.
        let (event, _second) = tokio::join!(broker.poll(), accept_and_connack(&listener));
        assert_eq!(event, Ok(BrokerEvent::ConnAck));
    }
}
