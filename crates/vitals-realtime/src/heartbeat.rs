//! Heartbeat push and stale-connection sweep.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use metrics::counter;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use vitals_core::ConnectionId;

use crate::config::MIN_PERIOD;
use crate::dispatcher::{DeliveryReport, Dispatcher};
use crate::messages::Envelope;
use crate::registry::ConnectionRegistry;
use crate::transport::CloseReason;

/// Drives the two liveness duties over a shared registry.
pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    dispatcher: Dispatcher,
    heartbeat_interval: Duration,
    sweep_interval: Duration,
    connection_timeout: Duration,
}

impl HeartbeatMonitor {
    /// Monitor pushing every `heartbeat_interval` and sweeping every
    /// `sweep_interval` for connections silent longer than
    /// `connection_timeout`.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        dispatcher: Dispatcher,
        heartbeat_interval: Duration,
        sweep_interval: Duration,
        connection_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            heartbeat_interval,
            sweep_interval,
            connection_timeout,
        }
    }

    /// Send one heartbeat frame to every registered connection.
    ///
    /// Sends never refresh liveness; only peer traffic does.
    pub async fn push_once(&self) -> DeliveryReport {
        self.dispatcher.broadcast_all(&Envelope::heartbeat()).await
    }

    /// Disconnect every connection silent for longer than the timeout.
    pub async fn sweep_once(&self) -> Vec<ConnectionId> {
        let stale = self.registry.remove_stale(Instant::now(), self.connection_timeout);
        if stale.is_empty() {
            return Vec::new();
        }

        let ids: Vec<ConnectionId> = stale.iter().map(|r| r.id.clone()).collect();
        for removed in &stale {
            warn!(
                conn_id = %removed.id,
                user_id = %removed.user_id,
                timeout_secs = self.connection_timeout.as_secs(),
                "heartbeat timeout, disconnecting"
            );
        }
        counter!(crate::metrics::WS_HEARTBEAT_TIMEOUTS_TOTAL).increment(ids.len() as u64);
        let _ = join_all(
            stale
                .into_iter()
                .map(|r| r.retire(CloseReason::HeartbeatTimeout)),
        )
        .await;
        ids
    }

    /// Push loop; returns when `cancel` fires.
    pub async fn run_push(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval_after(self.heartbeat_interval);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.push_once().await;
                    if report.attempted > 0 {
                        debug!(delivered = report.delivered, failed = report.failed, "heartbeat push");
                    }
                }
            }
        }
        debug!("heartbeat push stopped");
    }

    /// Sweep loop; returns when `cancel` fires.
    pub async fn run_sweep(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval_after(self.sweep_interval);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = self.sweep_once().await;
                }
            }
        }
        debug!("stale sweep stopped");
    }
}

/// Interval whose first tick is one `period` from now.
fn interval_after(period: Duration) -> time::Interval {
    let period = period.max(MIN_PERIOD);
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
