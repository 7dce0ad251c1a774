//! Wire envelope for the real-time channel.
//!
//! Every frame is a JSON object with a `type` discriminator, an RFC 3339
//! `timestamp`, an optional `message_id`, and the fields of its kind:
//!
//! ```json
//! {"type":"message","content":"hi","user_id":"u1","timestamp":"2026-01-01T00:00:00Z"}
//! ```
//!
//! The registry only interprets `heartbeat`; every other kind is carried
//! through for the transport layer and the application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use vitals_core::{ConnectionId, MessageId};

/// A decoded or outbound frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Kind-specific payload; serialized inline with its `type` tag.
    #[serde(flatten)]
    pub kind: MessageKind,
    /// When the frame was produced. Defaults to receipt time if absent.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Optional message identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
}

/// All frame kinds understood on the channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    /// Chat message.
    Message {
        /// Message text.
        content: String,
        /// Author.
        user_id: String,
        /// Author display name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        /// Free-form attachment data.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    /// Server notice.
    System {
        /// Notice text.
        content: String,
    },
    /// Error report to the peer.
    Error {
        /// Machine-readable code, e.g. `rate_limited`.
        code: String,
        /// Human-readable description.
        message: String,
    },
    /// AI-generated health insight pushed to a user.
    HealthInsight {
        /// Recipient.
        user_id: String,
        /// Insight category (e.g. `sleep`, `activity`).
        insight_type: String,
        /// Short headline.
        title: String,
        /// Body text.
        content: String,
        /// Structured supporting data.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// Progress of a background analysis job.
    AnalysisUpdate {
        /// Job identifier.
        analysis_id: String,
        /// Job status (`queued`, `running`, `completed`, `failed`).
        status: String,
        /// Completion fraction in `0.0..=1.0`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<f64>,
        /// Partial or final result.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// A user joined a room.
    UserJoined {
        /// Who joined.
        user_id: String,
        /// Display name.
        username: String,
        /// Room joined.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    /// A user left a room.
    UserLeft {
        /// Who left.
        user_id: String,
        /// Display name.
        username: String,
        /// Room left.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    /// Typing indicator.
    Typing {
        /// Who is typing.
        user_id: String,
        /// Started (`true`) or stopped (`false`).
        is_typing: bool,
        /// Room the indicator applies to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    /// Sent once after a connection is registered.
    ConnectionAck {
        /// Handle assigned to the connection.
        connection_id: ConnectionId,
        /// Verified owner.
        user_id: String,
        /// Display name.
        username: String,
        /// Room joined, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    /// Liveness probe, from either side.
    Heartbeat {
        /// Sender's clock, echoed back in the ack.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_timestamp: Option<Value>,
    },
    /// Reply to a heartbeat.
    HeartbeatAck {
        /// The `client_timestamp` of the heartbeat being acknowledged.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_timestamp: Option<Value>,
        /// Server clock at reply time.
        server_timestamp: DateTime<Utc>,
    },
}

impl MessageKind {
    /// The wire `type` tag.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::System { .. } => "system",
            Self::Error { .. } => "error",
            Self::HealthInsight { .. } => "health_insight",
            Self::AnalysisUpdate { .. } => "analysis_update",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::Typing { .. } => "typing",
            Self::ConnectionAck { .. } => "connection_ack",
            Self::Heartbeat { .. } => "heartbeat",
            Self::HeartbeatAck { .. } => "heartbeat_ack",
        }
    }
}

/// Why an inbound frame could not be decoded.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Not JSON, unknown `type`, or missing required fields.
    #[error("invalid envelope: {0}")]
    Json(#[from] serde_json::Error),
    /// Decoded but semantically invalid.
    #[error("invalid {kind} payload: {reason}")]
    Invalid {
        /// Offending frame kind.
        kind: &'static str,
        /// What was wrong.
        reason: &'static str,
    },
}

impl Envelope {
    /// Stamp `kind` with the current time and a fresh message ID.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            message_id: Some(MessageId::new()),
        }
    }

    /// Decode and validate an inbound frame.
    pub fn parse(raw: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Self = serde_json::from_slice(raw)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        let invalid = |reason| {
            Err(EnvelopeError::Invalid {
                kind: self.kind.name(),
                reason,
            })
        };
        match &self.kind {
            MessageKind::Message { content, .. } if content.trim().is_empty() => {
                invalid("content must not be empty")
            }
            MessageKind::Message { user_id, .. } | MessageKind::Typing { user_id, .. }
                if user_id.is_empty() =>
            {
                invalid("user_id must not be empty")
            }
            MessageKind::AnalysisUpdate {
                progress: Some(p), ..
            } if !(0.0..=1.0).contains(p) => invalid("progress must be within 0..=1"),
            _ => Ok(()),
        }
    }

    /// Chat message.
    pub fn chat(
        user_id: impl Into<String>,
        username: Option<String>,
        content: impl Into<String>,
        metadata: Option<Value>,
    ) -> Self {
        Self::new(MessageKind::Message {
            content: content.into(),
            user_id: user_id.into(),
            username,
            metadata,
        })
    }

    /// Server notice.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageKind::System {
            content: content.into(),
        })
    }

    /// Error report.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(MessageKind::Error {
            code: code.into(),
            message: message.into(),
        })
    }

    /// Server-initiated heartbeat.
    pub fn heartbeat() -> Self {
        Self::new(MessageKind::Heartbeat {
            client_timestamp: None,
        })
    }

    /// Reply to a peer heartbeat, echoing its clock.
    pub fn heartbeat_ack(client_timestamp: Option<Value>) -> Self {
        Self::new(MessageKind::HeartbeatAck {
            client_timestamp,
            server_timestamp: Utc::now(),
        })
    }

    /// Registration acknowledgement.
    pub fn connection_ack(
        connection_id: ConnectionId,
        user_id: impl Into<String>,
        username: impl Into<String>,
        room_id: Option<String>,
    ) -> Self {
        Self::new(MessageKind::ConnectionAck {
            connection_id,
            user_id: user_id.into(),
            username: username.into(),
            room_id,
        })
    }

    /// Room join announcement.
    pub fn user_joined(
        user_id: impl Into<String>,
        username: impl Into<String>,
        room_id: Option<String>,
    ) -> Self {
        Self::new(MessageKind::UserJoined {
            user_id: user_id.into(),
            username: username.into(),
            room_id,
        })
    }

    /// Room leave announcement.
    pub fn user_left(
        user_id: impl Into<String>,
        username: impl Into<String>,
        room_id: Option<String>,
    ) -> Self {
        Self::new(MessageKind::UserLeft {
            user_id: user_id.into(),
            username: username.into(),
            room_id,
        })
    }

    /// Typing indicator.
    pub fn typing(user_id: impl Into<String>, is_typing: bool, room_id: Option<String>) -> Self {
        Self::new(MessageKind::Typing {
            user_id: user_id.into(),
            is_typing,
            room_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn chat_wire_shape() {
        let env = Envelope::chat("u1", Some("Ada".into()), "hello", None);
        let v: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(v["type"], "message");
        assert_eq!(v["content"], "hello");
        assert_eq!(v["user_id"], "u1");
        assert_eq!(v["username"], "Ada");
        assert!(v.get("metadata").is_none());
        assert!(v["timestamp"].is_string());
        assert!(v["message_id"].is_string());
    }

    #[test]
    fn parse_client_chat_without_timestamp() {
        let env = Envelope::parse(br#"{"type":"message","content":"hi","user_id":"u1"}"#).unwrap();
        assert_matches!(
            env.kind,
            MessageKind::Message { ref content, ref user_id, username: None, .. }
                if content == "hi" && user_id == "u1"
        );
        assert!(env.message_id.is_none());
    }

    #[test]
    fn parse_keeps_client_timestamp_and_id() {
        let raw = br#"{"type":"typing","user_id":"u2","is_typing":true,"timestamp":"2026-03-01T12:00:00Z","message_id":"m-1"}"#;
        let env = Envelope::parse(raw).unwrap();
        assert_eq!(env.timestamp.to_rfc3339(), "2026-03-01T12:00:00+00:00");
        assert_eq!(env.message_id, Some(MessageId::from("m-1")));
        assert_eq!(env.kind.name(), "typing");
    }

    #[test]
    fn heartbeat_with_and_without_client_timestamp() {
        let bare = Envelope::parse(br#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(bare.kind, MessageKind::Heartbeat { client_timestamp: None });

        let stamped = Envelope::parse(br#"{"type":"heartbeat","client_timestamp":1700000000123}"#)
            .unwrap();
        assert_eq!(
            stamped.kind,
            MessageKind::Heartbeat {
                client_timestamp: Some(json!(1_700_000_000_123_u64))
            }
        );
    }

    #[test]
    fn heartbeat_ack_echoes_client_clock() {
        let ack = Envelope::heartbeat_ack(Some(json!("t-42")));
        let v: Value = serde_json::from_str(&ack.to_json().unwrap()).unwrap();
        assert_eq!(v["type"], "heartbeat_ack");
        assert_eq!(v["client_timestamp"], "t-42");
        assert!(v["server_timestamp"].is_string());
    }

    #[test]
    fn every_kind_uses_snake_case_tag() {
        let samples = [
            Envelope::system("maintenance"),
            Envelope::error("rate_limited", "slow down"),
            Envelope::heartbeat(),
            Envelope::connection_ack(ConnectionId::from("c1"), "u1", "Ada", None),
            Envelope::user_joined("u1", "Ada", Some("r1".into())),
            Envelope::user_left("u1", "Ada", Some("r1".into())),
            Envelope::new(MessageKind::HealthInsight {
                user_id: "u1".into(),
                insight_type: "sleep".into(),
                title: "Short night".into(),
                content: "You slept 5h".into(),
                data: None,
            }),
            Envelope::new(MessageKind::AnalysisUpdate {
                analysis_id: "a1".into(),
                status: "running".into(),
                progress: Some(0.5),
                data: None,
            }),
        ];
        for env in samples {
            let v: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
            assert_eq!(v["type"], env.kind.name());
            let back: Envelope = serde_json::from_value(v).unwrap();
            assert_eq!(back.kind, env.kind);
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert_matches!(
            Envelope::parse(br#"{"type":"teleport","content":"x"}"#),
            Err(EnvelopeError::Json(_))
        );
    }

    #[test]
    fn not_json_is_rejected() {
        assert_matches!(Envelope::parse(b"not json"), Err(EnvelopeError::Json(_)));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        assert_matches!(
            Envelope::parse(br#"{"type":"message","user_id":"u1"}"#),
            Err(EnvelopeError::Json(_))
        );
    }

    #[test]
    fn blank_chat_content_is_invalid() {
        assert_matches!(
            Envelope::parse(br#"{"type":"message","content":"   ","user_id":"u1"}"#),
            Err(EnvelopeError::Invalid { kind: "message", .. })
        );
    }

    #[test]
    fn out_of_range_progress_is_invalid() {
        assert_matches!(
            Envelope::parse(br#"{"type":"analysis_update","analysis_id":"a","status":"running","progress":1.5}"#),
            Err(EnvelopeError::Invalid { kind: "analysis_update", .. })
        );
    }
}
