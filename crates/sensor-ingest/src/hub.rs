// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broadcast hub.
//!
//! Tracks the live subscriber sessions and fans each reading out to all of
//! them. Delivery is fire-and-forget: a session only sees readings broadcast
//! while it is registered, and a session whose send fails is dropped from
//! the registry without affecting the others.
//!
//! Sessions are opaque to the hub. They only expose a non-blocking `send`
//! and a future that resolves when their connection goes away; the hub
//! watches that future to unregister them proactively.

use crate::reading::Reading;
use crate::stats::PipelineStats;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Why a session refused a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// Outbound buffer is full (slow consumer).
    #[error("session buffer full")]
    Full,

    /// Connection is gone.
    #[error("session closed")]
    Closed,
}

/// One live observer connection, as seen by the hub.
pub trait SubscriberSession: Send + Sync + 'static {
    /// Identifier used in logs.
    fn id(&self) -> &str;

    /// Queue a reading for delivery. Must not block.
    fn send(&self, reading: &Arc<Reading>) -> Result<(), SendError>;

    /// Resolves once the underlying connection is gone.
    fn disconnected(&self) -> BoxFuture<'static, ()>;
}

/// Returned by [`BroadcastHub::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

/// Result of a single broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub evicted: usize,
}

struct Entry {
    session: Arc<dyn SubscriberSession>,
    /// Dropping this stops the disconnect watcher.
    _stop: oneshot::Sender<()>,
}

struct HubInner {
    sessions: DashMap<u64, Entry>,
    next_id: AtomicU64,
    /// Set by `close_all`; later registrations are dropped on arrival.
    closed: AtomicBool,
    stats: Arc<PipelineStats>,
}

/// Concurrency-safe subscription registry plus fan-out. Cheap to clone.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new(stats: Arc<PipelineStats>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                sessions: DashMap::new(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                stats,
            }),
        }
    }

    /// Add a session to the live set.
    ///
    /// When called inside a tokio runtime, a watcher task unregisters the
    /// session as soon as its `disconnected` future resolves. Outside a
    /// runtime, failed sends are the only removal path besides `unregister`.
    ///
    /// After [`close_all`](Self::close_all) the session is dropped at once,
    /// so its stream ends just like the sessions closed at shutdown.
    pub fn register(&self, session: Arc<dyn SubscriberSession>) -> SubscriptionHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let disconnected = session.disconnected();
        let session_id = session.id().to_string();

        self.inner.sessions.insert(
            id,
            Entry {
                session,
                _stop: stop_tx,
            },
        );

        // Checked after the insert: either this sees the flag or
        // close_all's clear sees the entry.
        if self.inner.closed.load(Ordering::SeqCst) {
            self.inner.sessions.remove(&id);
            debug!("[{}] Hub closed, session dropped", session_id);
            return SubscriptionHandle(id);
        }

        debug!(
            "[{}] Registered ({} live)",
            session_id,
            self.inner.sessions.len()
        );

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let hub = Arc::downgrade(&self.inner);
            runtime.spawn(async move {
                tokio::select! {
                    _ = disconnected => {
                        if let Some(hub) = hub.upgrade() {
                            if hub.sessions.remove(&id).is_some() {
                                debug!("[{}] Disconnected, unregistered", session_id);
                            }
                        }
                    }
                    _ = stop_rx => {}
                }
            });
        }

        SubscriptionHandle(id)
    }

    /// Remove a session. Returns `false` if it was already gone.
    pub fn unregister(&self, handle: SubscriptionHandle) -> bool {
        match self.inner.sessions.remove(&handle.0) {
            Some((_, entry)) => {
                debug!("[{}] Unregistered", entry.session.id());
                true
            }
            None => false,
        }
    }

    /// Offer a reading to every session registered right now.
    ///
    /// Works on a snapshot of the registry, so sessions may register or
    /// leave concurrently. A session whose send fails is evicted.
    pub fn broadcast(&self, reading: &Arc<Reading>) -> BroadcastOutcome {
        let snapshot: Vec<(u64, Arc<dyn SubscriberSession>)> = self
            .inner
            .sessions
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(&entry.value().session)))
            .collect();

        let mut outcome = BroadcastOutcome::default();
        for (id, session) in snapshot {
            match session.send(reading) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    if self.inner.sessions.remove(&id).is_some() {
                        outcome.evicted += 1;
                        info!("[{}] Evicted: {}", session.id(), e);
                    }
                }
            }
        }

        let stats = &self.inner.stats;
        PipelineStats::incr(&stats.readings_broadcast);
        PipelineStats::add(&stats.deliveries, outcome.delivered as u64);
        PipelineStats::add(&stats.sessions_evicted, outcome.evicted as u64);

        outcome
    }

    /// Drop every session and refuse new ones. Channel-backed sessions see
    /// their stream end.
    pub fn close_all(&self) -> usize {
        self.inner.closed.store(true, Ordering::SeqCst);
        let count = self.inner.sessions.len();
        self.inner.sessions.clear();
        if count > 0 {
            info!("Closed {} subscriber sessions", count);
        }
        count
    }

    /// Whether [`close_all`](Self::close_all) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }
}

/// Session backed by a bounded mpsc channel.
///
/// The transport side owns the receiver and forwards readings to its
/// connection. Dropping the receiver disconnects the session; the hub
/// dropping the session ends the receiver's stream.
pub struct ChannelSession {
    id: String,
    tx: mpsc::Sender<Arc<Reading>>,
}

impl ChannelSession {
    pub fn new(id: impl Into<String>, buffer: usize) -> (Self, mpsc::Receiver<Arc<Reading>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { id: id.into(), tx }, rx)
    }
}

impl SubscriberSession for ChannelSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, reading: &Arc<Reading>) -> Result<(), SendError> {
        self.tx.try_send(Arc::clone(reading)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    fn disconnected(&self) -> BoxFuture<'static, ()> {
        let tx = self.tx.clone();
        Box::pin(async move { tx.closed().await })
    }
}
