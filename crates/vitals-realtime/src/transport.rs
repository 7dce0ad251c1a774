//! The transport seam.
//!
//! The registry never touches sockets. The transport layer hands it an
//! `Arc<dyn Transport>` per accepted stream, and the registry only ever
//! sends serialized frames through it or closes it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use vitals_core::ConnectionId;

/// Failure to hand a frame to, or close, a transport.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The stream is already closed.
    #[error("transport closed")]
    Closed,
    /// The outbound queue is full (slow consumer).
    #[error("outbound queue full")]
    Full,
    /// Any other transport-specific failure.
    #[error("transport error: {0}")]
    Other(String),
}

/// Why a connection was closed by the server side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The peer closed the stream.
    ClientClosed,
    /// Explicit `disconnect` call.
    Disconnected,
    /// Oldest connection removed to admit a newer one under the user quota.
    Evicted,
    /// No liveness signal within the connection timeout.
    HeartbeatTimeout,
    /// A send to this connection failed.
    DeliveryFailed,
    /// The manager is shutting down.
    ServerShutdown,
}

impl CloseReason {
    /// WebSocket close code for this reason.
    pub const fn code(self) -> u16 {
        match self {
            Self::ClientClosed | Self::Disconnected => 1000,
            Self::ServerShutdown => 1001,
            Self::DeliveryFailed => 1011,
            Self::HeartbeatTimeout => 4000,
            Self::Evicted => 4001,
        }
    }

    /// Short label, used as close-frame reason and metric label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::Disconnected => "disconnected",
            Self::Evicted => "evicted",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::DeliveryFailed => "delivery_failed",
            Self::ServerShutdown => "server_shutdown",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One bidirectional stream, as seen by the registry.
///
/// Implementations must be cheap to call concurrently: a heartbeat push and
/// a room broadcast may target the same connection at once.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue one serialized frame for the peer.
    async fn send(&self, frame: Arc<str>) -> Result<(), TransportError>;

    /// Close the stream. Closing an already-closed stream returns
    /// [`TransportError::Closed`].
    async fn close(&self, reason: CloseReason) -> Result<(), TransportError>;
}

/// Close `transport`, treating "already closed" as success.
pub(crate) async fn close_quietly(
    transport: &dyn Transport,
    conn_id: &ConnectionId,
    reason: CloseReason,
) {
    match transport.close(reason).await {
        Ok(()) | Err(TransportError::Closed) => {}
        Err(e) => debug!(conn_id = %conn_id, %reason, error = %e, "error closing transport"),
    }
}

/// Queue-backed [`Transport`] for stream handlers.
///
/// Frames go into a bounded mpsc queue that the handler's writer task drains
/// onto the socket. Closing records the reason and fires
/// [`closed_token`](Self::closed_token), which both the writer and reader
/// tasks select on.
pub struct ChannelTransport {
    tx: mpsc::Sender<Arc<str>>,
    closed: CancellationToken,
    reason: OnceLock<CloseReason>,
    dropped: AtomicU64,
}

impl ChannelTransport {
    /// Create a transport and the receiving half of its outbound queue.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let transport = Arc::new(Self {
            tx,
            closed: CancellationToken::new(),
            reason: OnceLock::new(),
            dropped: AtomicU64::new(0),
        });
        (transport, rx)
    }

    /// Token cancelled once the transport is closed.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Reason passed to the first `close` call.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }

    /// Frames rejected because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, frame: Arc<str>) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    async fn close(&self, reason: CloseReason) -> Result<(), TransportError> {
        if self.reason.set(reason).is_err() {
            return Err(TransportError::Closed);
        }
        self.closed.cancel();
        Ok(())
    }
}
