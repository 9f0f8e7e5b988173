// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! WebSocket subscriber session.
//!
//! Each accepted dashboard connection is registered with the hub as a
//! [`ChannelSession`] and then forwards pushed readings as JSON text frames
//! until either side goes away:
//! - client closes or errors: unregister and stop
//! - hub drops the session (eviction or shutdown): send Close and stop
//!
//! Dashboards do not talk back; incoming text is ignored.

use crate::hub::{BroadcastHub, ChannelSession};
use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Serve one upgraded WebSocket until it closes.
pub async fn serve_socket(socket: WebSocket, hub: BroadcastHub, buffer: usize) {
    let (ws_tx, ws_rx) = socket.split();
    run(new_session_id(), ws_tx, ws_rx, hub, buffer).await;
}

/// Short id for log lines.
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// Session loop over any message sink/stream pair.
pub async fn run<Tx, Rx, E>(session_id: String, mut ws_tx: Tx, mut ws_rx: Rx, hub: BroadcastHub, buffer: usize)
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: fmt::Display,
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let (session, mut readings) = ChannelSession::new(session_id.clone(), buffer);
    let handle = hub.register(Arc::new(session));
    info!("[{}] Subscriber connected ({} live)", session_id, hub.len());

    loop {
        tokio::select! {
            reading = readings.recv() => match reading {
                Some(reading) => {
                    let json = match reading.frame().to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            error!("[{}] Failed to serialize reading: {}", session_id, e);
                            continue;
                        }
                    };
                    if let Err(e) = ws_tx.send(Message::Text(json)).await {
                        debug!("[{}] WebSocket send failed, closing: {}", session_id, e);
                        break;
                    }
                }
                None => {
                    debug!("[{}] Dropped by hub, closing", session_id);
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => {
                    info!("[{}] Client closed connection", session_id);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("[{}] WebSocket error: {}", session_id, e);
                    break;
                }
            },
        }
    }

    hub.unregister(handle);
    info!("[{}] Session ended ({} live)", session_id, hub.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Reading;
    use crate::stats::PipelineStats;
    use chrono::{TimeZone, Utc};
    use futures::channel::mpsc;
    use std::time::Duration;

    struct Client {
        to_server: mpsc::UnboundedSender<Result<Message, String>>,
        from_server: mpsc::UnboundedReceiver<Message>,
        task: tokio::task::JoinHandle<()>,
    }

    fn connect(hub: &BroadcastHub, buffer: usize) -> Client {
        let (to_server, server_rx) = mpsc::unbounded();
        let (server_tx, from_server) = mpsc::unbounded();
        let task = tokio::spawn(run("test".into(), server_tx, server_rx, hub.clone(), buffer));
        Client {
            to_server,
            from_server,
            task,
        }
    }

    async fn wait_for_sessions(hub: &BroadcastHub, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.len() != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn reading() -> Arc<Reading> {
        Arc::new(Reading {
            sensor_id: "INDUSTRY-001".into(),
            co2_ppm: 415.2,
            temperature_celsius: 28.1,
            received_at: Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap(),
        })
    }

    #[tokio::test]
    async fn test_pushes_json_frames() {
        let hub = BroadcastHub::new(Arc::new(PipelineStats::new()));
        let mut client = connect(&hub, 8);
        wait_for_sessions(&hub, 1).await;

        hub.broadcast(&reading());

        let Some(Message::Text(text)) = client.from_server.next().await else {
            panic!("expected a text frame");
        };
        let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["sensor_id"], "INDUSTRY-001");
        assert_eq!(frame["co2_ppm"], 415.2);
        assert_eq!(frame["temperature"], 28.1);
        assert_eq!(frame["timestamp"], "2026-01-05T10:00:00.000Z");

        drop(client.to_server);
        client.task.await.unwrap();
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn test_client_close_unregisters() {
        let hub = BroadcastHub::new(Arc::new(PipelineStats::new()));
        let client = connect(&hub, 8);
        wait_for_sessions(&hub, 1).await;

        client.to_server.unbounded_send(Ok(Message::Text("hello".into()))).unwrap();
        client.to_server.unbounded_send(Ok(Message::Close(None))).unwrap();
        client.task.await.unwrap();
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn test_hub_shutdown_sends_close() {
        let hub = BroadcastHub::new(Arc::new(PipelineStats::new()));
        let mut client = connect(&hub, 8);
        wait_for_sessions(&hub, 1).await;

        hub.close_all();

        assert!(matches!(
            client.from_server.next().await,
            Some(Message::Close(None))
        ));
        client.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_error_ends_session() {
        let hub = BroadcastHub::new(Arc::new(PipelineStats::new()));
        let client = connect(&hub, 8);
        wait_for_sessions(&hub, 1).await;

        client.to_server.unbounded_send(Err("reset".into())).unwrap();
        client.task.await.unwrap();
        assert!(hub.is_empty());
    }

    #[test]
    fn test_session_ids_are_short() {
        let id = new_session_id();
        assert_eq!(id.len(), 8);
        assert_ne!(id, new_session_id());
    }
}
