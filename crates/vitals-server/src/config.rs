//! Server configuration.

use std::time::Duration;

use vitals_realtime::RealtimeConfig;
use vitals_settings::{RealtimeSettings, ServerSettings};

/// Listener configuration for [`VitalsServer`](crate::VitalsServer).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Per-connection outbound queue capacity, in frames.
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            outbound_buffer: 256,
        }
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            outbound_buffer: settings.outbound_buffer,
        }
    }
}

/// Registry configuration from the `realtime` settings section.
pub fn realtime_config(settings: &RealtimeSettings) -> RealtimeConfig {
    RealtimeConfig {
        heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs),
        connection_timeout: Duration::from_secs(settings.connection_timeout_secs),
        sweep_interval: Duration::from_secs(settings.effective_sweep_interval_secs()),
        max_connections_per_user: settings.max_connections_per_user,
        message_rate_limit: settings.message_rate_limit,
        rate_limit_window: Duration::from_secs(settings.rate_limit_window_secs),
        max_message_size: settings.max_message_size,
    }
}
