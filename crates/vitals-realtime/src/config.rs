//! Registry configuration.

use std::time::Duration;

/// Shortest period any interval or window is allowed to have.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Quotas and timings for a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RealtimeConfig {
    /// Time between heartbeat pushes.
    pub heartbeat_interval: Duration,
    /// Silence tolerated before a connection is reaped.
    pub connection_timeout: Duration,
    /// Time between stale sweeps.
    pub sweep_interval: Duration,
    /// Live connections per user; the oldest is evicted beyond this.
    pub max_connections_per_user: usize,
    /// Inbound messages allowed per user per window.
    pub message_rate_limit: usize,
    /// Rate-limit window length.
    pub rate_limit_window: Duration,
    /// Largest accepted inbound frame, in bytes.
    pub max_message_size: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(30),
            max_connections_per_user: 2,
            message_rate_limit: 10,
            rate_limit_window: Duration::from_secs(60),
            max_message_size: 1024,
        }
    }
}

impl RealtimeConfig {
    /// Copy with zero periods raised to [`MIN_PERIOD`] and zero quotas
    /// raised to one.
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            heartbeat_interval: self.heartbeat_interval.max(MIN_PERIOD),
            connection_timeout: self.connection_timeout,
            sweep_interval: self.sweep_interval.max(MIN_PERIOD),
            max_connections_per_user: self.max_connections_per_user.max(1),
            message_rate_limit: self.message_rate_limit.max(1),
            rate_limit_window: self.rate_limit_window.max(MIN_PERIOD),
            max_message_size: self.max_message_size,
        }
    }
}
