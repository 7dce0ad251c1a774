//! The [`ConnectionManager`] façade.
//!
//! Composes the registry, rate limiter, dispatcher, and heartbeat monitor
//! and owns the background task lifecycle. One manager is built by the
//! composition root and shared (`Arc`) with every transport handler.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use metrics::counter;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vitals_core::ConnectionId;

use crate::config::RealtimeConfig;
use crate::dispatcher::{DeliveryReport, Dispatcher};
use crate::heartbeat::HeartbeatMonitor;
use crate::messages::{Envelope, MessageKind};
use crate::rate_limit::RateLimiter;
use crate::registry::{ConnectionInfo, ConnectionRegistry, UserInfo};
use crate::transport::{CloseReason, Transport, close_quietly};

/// What [`ConnectionManager::handle_frame`] did with an inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameOutcome {
    /// The connection is not (or no longer) registered.
    UnknownConnection,
    /// Larger than `max_message_size`; dropped before any other check.
    Oversized,
    /// Over the user's message budget; not parsed.
    RateLimited,
    /// Within budget but undecodable; dropped with a warning.
    Malformed,
    /// Decoded and validated.
    Accepted(Envelope),
}

impl FrameOutcome {
    /// Whether the frame consumed rate budget (accepted or malformed).
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_) | Self::Malformed)
    }
}

struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Registry façade consumed by the transport layer.
pub struct ConnectionManager {
    config: RealtimeConfig,
    registry: Arc<ConnectionRegistry>,
    limiter: RateLimiter,
    dispatcher: Dispatcher,
    monitor: Arc<HeartbeatMonitor>,
    tasks: Mutex<Option<BackgroundTasks>>,
    shut_down: AtomicBool,
}

impl ConnectionManager {
    /// Build a manager. Background duties are not started.
    ///
    /// Zero periods and quotas are raised to their minimum
    /// (see [`RealtimeConfig::normalized`]).
    pub fn new(config: RealtimeConfig) -> Self {
        let normalized = config.normalized();
        if normalized != config {
            warn!(?config, "zero interval or quota in realtime config, raised to minimum");
        }
        let config = normalized;
        let registry = Arc::new(ConnectionRegistry::new(config.max_connections_per_user));
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        let monitor = Arc::new(HeartbeatMonitor::new(
            Arc::clone(&registry),
            dispatcher.clone(),
            config.heartbeat_interval,
            config.sweep_interval,
            config.connection_timeout,
        ));
        Self {
            limiter: RateLimiter::new(config.message_rate_limit, config.rate_limit_window),
            config,
            registry,
            dispatcher,
            monitor,
            tasks: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    // ── lifecycle ───────────────────────────────────────────────────

    /// Register an authenticated stream.
    ///
    /// The identity is trusted as given. If the user is at quota their
    /// oldest connection is evicted and closed before this returns.
    ///
    /// After [`shutdown`](Self::shutdown) the stream is closed with
    /// [`CloseReason::ServerShutdown`] and the returned id is never
    /// registered.
    pub async fn connect(
        &self,
        transport: Arc<dyn Transport>,
        user_id: impl Into<String>,
        username: impl Into<String>,
        room_id: Option<String>,
    ) -> ConnectionId {
        let user_id = user_id.into();
        if self.is_shut_down() {
            let id = ConnectionId::new();
            debug!(conn_id = %id, user_id = %user_id, "refusing connection after shutdown");
            close_quietly(transport.as_ref(), &id, CloseReason::ServerShutdown).await;
            return id;
        }
        let registration =
            self.registry
                .register(transport, user_id.clone(), username.into(), room_id.clone());
        info!(
            conn_id = %registration.id,
            user_id = %user_id,
            room_id = room_id.as_deref(),
            "connection registered"
        );
        if let Some(evicted) = registration.evicted {
            evicted.retire(CloseReason::Evicted).await;
        }
        registration.id
    }

    /// Close and unregister a connection. Returns `false` if it was
    /// already gone.
    pub async fn disconnect(&self, id: &ConnectionId) -> bool {
        self.disconnect_with_reason(id, CloseReason::Disconnected).await
    }

    /// [`disconnect`](Self::disconnect) recording a specific reason.
    pub async fn disconnect_with_reason(&self, id: &ConnectionId, reason: CloseReason) -> bool {
        match self.registry.unregister(id) {
            Some(removed) => {
                removed.retire(reason).await;
                true
            }
            None => false,
        }
    }

    /// Spawn the heartbeat push and stale sweep. No-op if already running.
    pub fn start_background_tasks(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            debug!("background tasks already running");
            return;
        }
        let cancel = CancellationToken::new();
        let handles = vec![
            tokio::spawn(Arc::clone(&self.monitor).run_push(cancel.child_token())),
            tokio::spawn(Arc::clone(&self.monitor).run_sweep(cancel.child_token())),
        ];
        *tasks = Some(BackgroundTasks { cancel, handles });
        info!(
            heartbeat_secs = self.config.heartbeat_interval.as_secs(),
            sweep_secs = self.config.sweep_interval.as_secs(),
            timeout_secs = self.config.connection_timeout.as_secs(),
            "background tasks started"
        );
    }

    /// Cancel the background duties and wait for them to finish.
    /// No-op if not running.
    pub async fn stop_background_tasks(&self) {
        let Some(tasks) = self.tasks.lock().take() else {
            return;
        };
        tasks.cancel.cancel();
        for handle in tasks.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("background tasks stopped");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Whether the background duties are running.
    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// Stop background duties, then close every connection. Later
    /// `connect` calls are refused.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.stop_background_tasks().await;
        let removed = self.registry.drain();
        let count = removed.len();
        let _ = join_all(
            removed
                .into_iter()
                .map(|r| r.retire(CloseReason::ServerShutdown)),
        )
        .await;
        info!(closed = count, "connection manager shut down");
    }

    // ── inbound ─────────────────────────────────────────────────────

    /// Process one inbound frame. Returns `true` if it was within budget.
    pub async fn handle_message(&self, id: &ConnectionId, raw: &[u8]) -> bool {
        self.handle_frame(id, raw).await.is_accepted()
    }

    /// Process one inbound frame and report what happened.
    ///
    /// Checks run in order: liveness refresh, size, rate budget, decode.
    /// A client `heartbeat` is answered with a `heartbeat_ack`.
    pub async fn handle_frame(&self, id: &ConnectionId, raw: &[u8]) -> FrameOutcome {
        let Some(user_id) = self.registry.touch(id, Instant::now()) else {
            debug!(conn_id = %id, "frame for unknown connection");
            return FrameOutcome::UnknownConnection;
        };

        if raw.len() > self.config.max_message_size {
            debug!(conn_id = %id, size = raw.len(), limit = self.config.max_message_size, "frame too large");
            counter!(crate::metrics::WS_OVERSIZED_TOTAL).increment(1);
            return FrameOutcome::Oversized;
        }

        if !self.limiter.allow(&user_id) {
            debug!(conn_id = %id, user_id = %user_id, "rate limit exceeded");
            counter!(crate::metrics::WS_RATE_LIMITED_TOTAL).increment(1);
            return FrameOutcome::RateLimited;
        }

        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(conn_id = %id, user_id = %user_id, error = %e, "dropping malformed frame");
                counter!(crate::metrics::WS_MALFORMED_TOTAL).increment(1);
                return FrameOutcome::Malformed;
            }
        };

        debug!(conn_id = %id, kind = envelope.kind.name(), "frame accepted");
        if let MessageKind::Heartbeat { client_timestamp } = &envelope.kind {
            let ack = Envelope::heartbeat_ack(client_timestamp.clone());
            let _ = self.dispatcher.send_to(id, &ack).await;
        }
        FrameOutcome::Accepted(envelope)
    }

    /// Refresh liveness without spending rate budget (protocol ping/pong).
    /// Returns `false` for unknown connections.
    pub fn record_heartbeat(&self, id: &ConnectionId) -> bool {
        self.registry.touch(id, Instant::now()).is_some()
    }

    // ── delivery ────────────────────────────────────────────────────

    /// Deliver to every live connection.
    pub async fn broadcast_all(&self, envelope: &Envelope) -> DeliveryReport {
        self.dispatcher.broadcast_all(envelope).await
    }

    /// Deliver to every connection in `room_id`.
    pub async fn broadcast_room(&self, room_id: &str, envelope: &Envelope) -> DeliveryReport {
        self.dispatcher.broadcast_room(room_id, envelope).await
    }

    /// Deliver to every connection of `user_id`.
    pub async fn send_user(&self, user_id: &str, envelope: &Envelope) -> DeliveryReport {
        self.dispatcher.send_user(user_id, envelope).await
    }

    /// Deliver to one connection.
    pub async fn send_to(&self, id: &ConnectionId, envelope: &Envelope) -> DeliveryReport {
        self.dispatcher.send_to(id, envelope).await
    }

    // ── reads ───────────────────────────────────────────────────────

    /// Live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.count()
    }

    /// Distinct users with a live connection.
    pub fn user_count(&self) -> usize {
        self.registry.user_count()
    }

    /// Distinct users in `room_id`.
    pub fn room_users(&self, room_id: &str) -> BTreeSet<String> {
        self.registry.room_users(room_id)
    }

    /// The user's newest connection's identity, if connected.
    pub fn user_info(&self, user_id: &str) -> Option<UserInfo> {
        self.registry.user_info(user_id)
    }

    /// Snapshot of one connection.
    pub fn connection_info(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        self.registry.connection_info(id)
    }

    /// Messages `user_id` may still send in the current window.
    pub fn remaining_budget(&self, user_id: &str) -> usize {
        self.limiter.remaining(user_id)
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(RealtimeConfig::default())
    }
}
