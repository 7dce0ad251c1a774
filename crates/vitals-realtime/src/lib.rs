//! # vitals-realtime
//!
//! In-process registry for the chat/notification real-time channel.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `rate_limit` | Sliding-window per-user message budget |
//! | `registry` | Connection table plus per-user and per-room indexes |
//! | `heartbeat` | Periodic heartbeat push and stale-connection sweep |
//! | `dispatcher` | Broadcast / room / user / single-connection delivery |
//! | `manager` | [`ConnectionManager`] façade and background task lifecycle |
//! | `messages` | Wire envelope as a tagged enum |
//! | `transport` | The [`Transport`] seam the transport layer implements |
//!
//! ## Data Flow
//!
//! transport accept → [`ConnectionManager::connect`] → per-frame
//! [`ConnectionManager::handle_message`] → [`ConnectionManager::disconnect`].
//! The heartbeat duties run beside that for the manager's lifetime.

#![deny(unsafe_code)]

pub mod config;
pub mod dispatcher;
pub mod heartbeat;
pub mod manager;
pub mod messages;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod transport;

pub use config::RealtimeConfig;
pub use dispatcher::{DeliveryReport, Dispatcher};
pub use heartbeat::HeartbeatMonitor;
pub use manager::{ConnectionManager, FrameOutcome};
pub use messages::{Envelope, EnvelopeError, MessageKind};
pub use rate_limit::RateLimiter;
pub use registry::{ConnectionInfo, ConnectionRegistry, UserInfo};
pub use transport::{ChannelTransport, CloseReason, Transport, TransportError};
pub use vitals_core::ConnectionId;
