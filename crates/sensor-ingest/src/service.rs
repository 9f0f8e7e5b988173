// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service assembly.
//!
//! Wires the tasks together and owns their shutdown:
//!
//! ```text
//! broker --> Coordinator --[queue]--> Pipeline --> PersistenceWriter --> sink
//!                                        |
//!                                        +--> BroadcastHub --> WebSocket sessions
//! ```
//!
//! Shutdown order: stop taking broker messages, drain the pipeline, let
//! in-flight writes finish or time out, close every subscriber session,
//! then stop the subscriber endpoint.

use crate::broker::Broker;
use crate::config::{ConfigError, IngestConfig};
use crate::coordinator::{ConnectionState, Coordinator};
use crate::hub::BroadcastHub;
use crate::pipeline::Pipeline;
use crate::session::serve_socket;
use crate::shutdown::{self, ShutdownTrigger};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::store::PersistenceSink;
use crate::writer::{PersistenceWriter, WriterConfig};
use axum::{
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Service errors.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to bind subscriber endpoint {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Bind the subscriber endpoint. Failure here is the one fatal startup error.
pub async fn bind(addr: &str) -> Result<TcpListener, IngestError> {
    TcpListener::bind(addr).await.map_err(|source| IngestError::Bind {
        addr: addr.to_string(),
        source,
    })
}

#[derive(Clone)]
struct AppState {
    hub: BroadcastHub,
    max_clients: usize,
    buffer: usize,
}

/// Entry point for running the ingestion core.
pub struct IngestService;

impl IngestService {
    /// Spawn every task and start serving subscribers on `listener`.
    pub fn start<B: Broker, S: PersistenceSink>(
        config: &IngestConfig,
        listener: TcpListener,
        broker: B,
        sink: Arc<S>,
    ) -> Result<IngestHandle, IngestError> {
        config.validate()?;
        let local_addr = listener.local_addr()?;

        let stats = Arc::new(PipelineStats::new());
        let hub = BroadcastHub::new(Arc::clone(&stats));

        let (write_queue, writer) = PersistenceWriter::spawn(
            sink,
            WriterConfig::from(&config.store),
            Arc::clone(&stats),
        );

        let (msg_tx, msg_rx) = mpsc::channel(config.pipeline.queue_capacity);
        let pipeline = Pipeline::new(write_queue, hub.clone(), Arc::clone(&stats));
        let pipeline = tokio::spawn(pipeline.run(msg_rx));

        let (ingest_stop, ingest_shutdown) = shutdown::channel();
        let (coordinator, state) = Coordinator::new(
            broker,
            &config.broker,
            msg_tx,
            Arc::clone(&stats),
            ingest_shutdown,
        );
        let coordinator = tokio::spawn(coordinator.run());

        let app = Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(AppState {
                hub: hub.clone(),
                max_clients: config.subscribers.max_clients,
                buffer: config.subscribers.buffer,
            });

        let (server_stop, mut server_shutdown) = shutdown::channel();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_shutdown.wait().await })
                .await;
            if let Err(e) = result {
                error!("Subscriber endpoint failed: {}", e);
            }
        });

        info!("Subscriber endpoint: ws://{}/ws", local_addr);

        Ok(IngestHandle {
            hub,
            stats,
            state,
            local_addr,
            ingest_stop,
            server_stop,
            coordinator,
            pipeline,
            writer,
            server,
        })
    }
}

/// Handle to a running service.
pub struct IngestHandle {
    hub: BroadcastHub,
    stats: Arc<PipelineStats>,
    state: watch::Receiver<ConnectionState>,
    local_addr: SocketAddr,
    ingest_stop: ShutdownTrigger,
    server_stop: ShutdownTrigger,
    coordinator: JoinHandle<()>,
    pipeline: JoinHandle<()>,
    writer: JoinHandle<()>,
    server: JoinHandle<()>,
}

impl IngestHandle {
    /// Address the subscriber endpoint is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Shared counters, for periodic reporting.
    pub fn stats_handle(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the broker connection reaches `wanted`.
    /// Returns `false` if the coordinator is gone.
    #[allow(clippy::let_and_return)]
    pub async fn wait_for_state(&self, wanted: ConnectionState) -> bool {
        let mut state = self.state.clone();
        // Bound first: the temporary `Ref` borrows `state`.
        let reached = state.wait_for(|s| *s == wanted).await.is_ok();
        reached
    }

    /// Graceful shutdown. Returns the final statistics.
    pub async fn stop(self) -> StatsSnapshot {
        info!("Stopping ingestion");

        self.ingest_stop.trigger();
        join("coordinator", self.coordinator).await;
        join("pipeline", self.pipeline).await;
        join("writer", self.writer).await;

        // Closing the hub also turns away upgrades still in flight.
        self.hub.close_all();
        self.server_stop.trigger();
        join("subscriber endpoint", self.server).await;

        let snapshot = self.stats.snapshot();
        info!("Ingestion stopped: {}", snapshot);
        snapshot
    }
}

async fn join(name: &str, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        error!("{} task failed: {}", name, e);
    }
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.hub.is_closed() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Shutting down").into_response();
    }
    if state.hub.len() >= state.max_clients {
        warn!("Connection rejected: max clients ({}) reached", state.max_clients);
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    }

    let AppState { hub, buffer, .. } = state;
    ws.on_upgrade(move |socket| serve_socket(socket, hub, buffer))
}
