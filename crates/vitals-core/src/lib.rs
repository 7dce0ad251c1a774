//! # vitals-core
//!
//! Foundation types shared by every Vitals crate.
//!
//! - [`ids`]: branded identifier newtypes (`ConnectionId`, `MessageId`)
//! - [`logging`]: `tracing` subscriber setup and test-time log capture

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;

pub use ids::{ConnectionId, MessageId};
