//! Settings type definitions.
//!
//! Field names are camelCase on the wire. Every section carries
//! `#[serde(default)]`, so a settings file only needs the keys it changes.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "realtime": { "messageRateLimit": 20 },
///   "logging": { "level": "debug" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VitalsSettings {
    /// HTTP/WebSocket listener settings.
    pub server: ServerSettings,
    /// Connection registry quotas and liveness timings.
    pub realtime: RealtimeSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl VitalsSettings {
    /// Reject values the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.realtime.validate()
    }
}

/// Listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Per-connection outbound queue capacity, in frames.
    pub outbound_buffer: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
            outbound_buffer: 256,
        }
    }
}

impl ServerSettings {
    fn validate(&self) -> Result<()> {
        if self.outbound_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "server.outboundBuffer must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Real-time channel settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealtimeSettings {
    /// Seconds between server heartbeat pushes.
    pub heartbeat_interval_secs: u64,
    /// Seconds of silence tolerated before a connection is reaped.
    pub connection_timeout_secs: u64,
    /// Seconds between stale sweeps. Defaults to the heartbeat interval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_interval_secs: Option<u64>,
    /// Live connections allowed per user before the oldest is evicted.
    pub max_connections_per_user: usize,
    /// Inbound messages allowed per user per rate-limit window.
    pub message_rate_limit: usize,
    /// Length of the rate-limit window in seconds.
    pub rate_limit_window_secs: u64,
    /// Largest accepted inbound frame, in bytes.
    pub max_message_size: usize,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            connection_timeout_secs: 90,
            sweep_interval_secs: None,
            max_connections_per_user: 2,
            message_rate_limit: 10,
            rate_limit_window_secs: 60,
            max_message_size: 1024,
        }
    }
}

impl RealtimeSettings {
    /// Sweep cadence, falling back to the heartbeat interval.
    pub fn effective_sweep_interval_secs(&self) -> u64 {
        self.sweep_interval_secs
            .unwrap_or(self.heartbeat_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        let checks = [
            ("realtime.heartbeatIntervalSecs", self.heartbeat_interval_secs == 0),
            ("realtime.connectionTimeoutSecs", self.connection_timeout_secs == 0),
            ("realtime.sweepIntervalSecs", self.sweep_interval_secs == Some(0)),
            ("realtime.maxConnectionsPerUser", self.max_connections_per_user == 0),
            ("realtime.messageRateLimit", self.message_rate_limit == 0),
            ("realtime.rateLimitWindowSecs", self.rate_limit_window_secs == 0),
            ("realtime.maxMessageSize", self.max_message_size == 0),
        ];
        match checks.iter().find(|(_, zero)| *zero) {
            Some((key, _)) => Err(SettingsError::InvalidValue(format!("{key} must be > 0"))),
            None => Ok(()),
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit one JSON object per line instead of the compact format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
