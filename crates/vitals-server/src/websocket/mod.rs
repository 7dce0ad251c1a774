//! WebSocket upgrade identity and per-connection session loop.

pub mod identity;
pub mod session;
