//! Metric names emitted by the registry.
//!
//! Recording is a no-op until the host installs a `metrics` recorder.

/// Connections admitted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Connections removed (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Oldest-connection evictions under the per-user quota (counter).
pub const WS_EVICTIONS_TOTAL: &str = "ws_evictions_total";
/// Inbound frames rejected by the rate limiter (counter).
pub const WS_RATE_LIMITED_TOTAL: &str = "ws_rate_limited_total";
/// Inbound frames rejected for size (counter).
pub const WS_OVERSIZED_TOTAL: &str = "ws_oversized_total";
/// Inbound frames dropped as malformed (counter).
pub const WS_MALFORMED_TOTAL: &str = "ws_malformed_total";
/// Outbound sends that failed (counter).
pub const WS_DELIVERY_FAILURES_TOTAL: &str = "ws_delivery_failures_total";
/// Connections reaped by the stale sweep (counter).
pub const WS_HEARTBEAT_TIMEOUTS_TOTAL: &str = "ws_heartbeat_timeouts_total";
