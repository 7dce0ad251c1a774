//! # vitals-server
//!
//! Axum HTTP + `WebSocket` gateway for the real-time channel.
//!
//! - `GET /ws`: upgrade, register with the [`ConnectionManager`](vitals_realtime::ConnectionManager), relay frames
//! - `GET /health`: liveness plus connection counters
//! - `GET /metrics`: Prometheus text
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::{ServerConfig, realtime_config};
pub use error::ServerError;
pub use server::{AppState, VitalsServer};
pub use shutdown::ShutdownCoordinator;
