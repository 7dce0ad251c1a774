//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::histogram;
use tracing::{debug, info, instrument};

use vitals_realtime::{
    ChannelTransport, CloseReason, ConnectionId, ConnectionManager, Envelope, FrameOutcome,
    MessageKind,
};

use super::identity::AuthenticatedUser;

/// How long the writer may take to flush and send the close frame.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Error code sent when a frame exceeds the rate budget.
pub const RATE_LIMITED: &str = "rate_limited";
/// Error code sent when a frame exceeds the size limit.
pub const MESSAGE_TOO_LARGE: &str = "message_too_large";

/// Run a session for an upgraded socket.
///
/// 1. Registers a [`ChannelTransport`] with the manager
/// 2. Sends `connection_ack` and announces `user_joined` to the room
/// 3. Forwards queued frames to the socket until the transport closes
/// 4. Feeds inbound frames to the manager in receipt order, relaying chat
///    and typing to the room
/// 5. Unregisters and announces `user_left` when either side ends it
#[instrument(skip_all, fields(user_id = %user.user_id, room_id = room_id.as_deref()))]
pub async fn run_ws_session(
    socket: WebSocket,
    user: AuthenticatedUser,
    room_id: Option<String>,
    manager: Arc<ConnectionManager>,
    outbound_buffer: usize,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (transport, mut outbound) = ChannelTransport::new(outbound_buffer);
    let closed = transport.closed_token();
    let started = Instant::now();

    let conn_id = manager
        .connect(
            transport.clone(),
            user.user_id.clone(),
            user.username.clone(),
            room_id.clone(),
        )
        .await;
    let session = Session {
        manager,
        conn_id,
        user,
        room_id,
    };
    session.announce_join().await;

    let writer_transport = Arc::clone(&transport);
    let writer_closed = closed.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                frame = outbound.recv() => {
                    let Some(text) = frame else { break };
                    if ws_tx.send(Message::Text(text.to_string().into())).await.is_err() {
                        break;
                    }
                }
                () = writer_closed.cancelled() => {
                    while let Ok(text) = outbound.try_recv() {
                        if ws_tx.send(Message::Text(text.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    let reason = writer_transport
                        .close_reason()
                        .unwrap_or(CloseReason::Disconnected);
                    let frame = CloseFrame {
                        code: reason.code(),
                        reason: reason.as_str().into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    loop {
        let msg = tokio::select! {
            biased;
            () = closed.cancelled() => break,
            msg = ws_rx.next() => msg,
        };
        let flow = match msg {
            Some(Ok(Message::Text(text))) => session.on_frame(text.as_str().as_bytes()).await,
            Some(Ok(Message::Binary(data))) => session.on_frame(&data).await,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                let _ = session.manager.record_heartbeat(&session.conn_id);
                ControlFlow::Continue(())
            }
            Some(Ok(Message::Close(_))) | None => {
                debug!("client closed");
                ControlFlow::Break(())
            }
            Some(Err(e)) => {
                debug!(error = %e, "socket error");
                ControlFlow::Break(())
            }
        };
        if flow.is_break() {
            break;
        }
    }

    let _ = session
        .manager
        .disconnect_with_reason(&session.conn_id, CloseReason::ClientClosed)
        .await;
    let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await;
    session.announce_leave().await;

    histogram!(crate::metrics::WS_SESSION_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    info!(
        conn_id = %session.conn_id,
        reason = transport.close_reason().map(CloseReason::as_str),
        "session ended"
    );
}

struct Session {
    manager: Arc<ConnectionManager>,
    conn_id: ConnectionId,
    user: AuthenticatedUser,
    room_id: Option<String>,
}

impl Session {
    async fn announce_join(&self) {
        let ack = Envelope::connection_ack(
            self.conn_id.clone(),
            self.user.user_id.clone(),
            self.user.username.clone(),
            self.room_id.clone(),
        );
        let _ = self.manager.send_to(&self.conn_id, &ack).await;

        if let Some(room) = &self.room_id {
            let joined = Envelope::user_joined(
                self.user.user_id.clone(),
                self.user.username.clone(),
                Some(room.clone()),
            );
            let _ = self.manager.broadcast_room(room, &joined).await;
        }
    }

    async fn announce_leave(&self) {
        if let Some(room) = &self.room_id {
            let left = Envelope::user_left(
                self.user.user_id.clone(),
                self.user.username.clone(),
                Some(room.clone()),
            );
            let _ = self.manager.broadcast_room(room, &left).await;
        }
    }

    async fn on_frame(&self, raw: &[u8]) -> ControlFlow<()> {
        match self.manager.handle_frame(&self.conn_id, raw).await {
            FrameOutcome::Accepted(envelope) => self.relay(envelope).await,
            FrameOutcome::Malformed => {}
            FrameOutcome::RateLimited => {
                let err = Envelope::error(RATE_LIMITED, "message rate limit exceeded, slow down");
                let _ = self.manager.send_to(&self.conn_id, &err).await;
            }
            FrameOutcome::Oversized => {
                let limit = self.manager.config().max_message_size;
                let err = Envelope::error(
                    MESSAGE_TOO_LARGE,
                    format!("messages are limited to {limit} bytes"),
                );
                let _ = self.manager.send_to(&self.conn_id, &err).await;
            }
            FrameOutcome::UnknownConnection => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    /// Re-broadcast client traffic under the verified identity.
    async fn relay(&self, envelope: Envelope) {
        match envelope.kind {
            MessageKind::Message {
                content, metadata, ..
            } => {
                let chat = Envelope::chat(
                    self.user.user_id.clone(),
                    Some(self.user.username.clone()),
                    content,
                    metadata,
                );
                let _ = match &self.room_id {
                    Some(room) => self.manager.broadcast_room(room, &chat).await,
                    None => self.manager.broadcast_all(&chat).await,
                };
            }
            MessageKind::Typing { is_typing, .. } => {
                if let Some(room) = &self.room_id {
                    let typing =
                        Envelope::typing(self.user.user_id.clone(), is_typing, Some(room.clone()));
                    let _ = self.manager.broadcast_room(room, &typing).await;
                }
            }
            other => debug!(kind = other.name(), "not relayed"),
        }
    }
}
