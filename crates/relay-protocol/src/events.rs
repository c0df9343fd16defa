//! Event types for the relay wire protocol.
//!
//! Every frame on the wire is a JSON envelope `{type, payload, timestamp}`
//! with an epoch-millisecond timestamp. Inbound and outbound frames are
//! closed tagged unions; an inbound tag the server does not recognize
//! decodes to [`ClientFrame::Unknown`] instead of failing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as epoch milliseconds.
#[must_use]
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// WebSocket close codes used by the gateway.
pub mod close {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Policy violation (missing or invalid credential).
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Internal server error.
    pub const SERVER_ERROR: u16 = 1011;
}

/// Stable machine-readable codes carried by `error` events.
pub mod error_code {
    /// Payload could not be decoded.
    pub const MALFORMED_FRAME: &str = "malformed_frame";
    /// Frame type is not supported by this server.
    pub const UNSUPPORTED_TYPE: &str = "unsupported_type";
    /// Per-connection subscription limit reached.
    pub const SUBSCRIPTION_LIMIT: &str = "subscription_limit";
}

/// Online/offline visibility of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceStatus::Online => write!(f, "online"),
            PresenceStatus::Offline => write!(f, "offline"),
        }
    }
}

/// A decoded frame received from a client.
///
/// Decoding happens in [`crate::codec`]; the `Unknown` variant keeps the
/// original tag so the gateway can report it back in an error event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Keepalive; answered with a `pong` event.
    Ping,
    /// Request fan-out for a conversation.
    Subscribe { conversation_id: String },
    /// Stop fan-out for a conversation.
    Unsubscribe { conversation_id: String },
    /// Typing indicator, relayed to the conversation's other subscribers.
    Typing {
        conversation_id: String,
        is_typing: bool,
    },
    /// Any tag this server does not understand.
    Unknown { kind: String },
}

impl ClientFrame {
    /// Wire tag of the frame, for logging and error events.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            ClientFrame::Ping => "ping",
            ClientFrame::Subscribe { .. } => "subscribe",
            ClientFrame::Unsubscribe { .. } => "unsubscribe",
            ClientFrame::Typing { .. } => "typing",
            ClientFrame::Unknown { kind } => kind,
        }
    }
}

/// An inbound frame with its envelope timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub frame: ClientFrame,
    /// Client-supplied envelope timestamp, if any.
    pub timestamp: Option<u64>,
}

/// An event sent to a client.
///
/// Serializes as the adjacently tagged `{type, payload}` part of the wire
/// envelope; the codec appends the timestamp field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Pong,

    #[serde(rename_all = "camelCase")]
    Presence {
        user_id: String,
        status: PresenceStatus,
        timestamp: u64,
    },

    #[serde(rename_all = "camelCase")]
    Typing {
        conversation_id: String,
        user_id: String,
        is_typing: bool,
    },

    #[serde(rename_all = "camelCase")]
    NewMessage {
        conversation_id: String,
        /// Persisted message as produced by the durable store; opaque here.
        message: Value,
    },

    #[serde(rename_all = "camelCase")]
    NewReaction {
        conversation_id: String,
        message_id: String,
        reaction: Value,
    },

    Error { code: String, message: String },
}

impl ServerEvent {
    /// Create a presence event stamped with the current time.
    #[must_use]
    pub fn presence(user_id: impl Into<String>, status: PresenceStatus) -> Self {
        ServerEvent::Presence {
            user_id: user_id.into(),
            status,
            timestamp: epoch_millis(),
        }
    }

    /// Create an error event with a stable machine-readable code.
    #[must_use]
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Wire tag of the event.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Pong => "pong",
            ServerEvent::Presence { .. } => "presence",
            ServerEvent::Typing { .. } => "typing",
            ServerEvent::NewMessage { .. } => "new_message",
            ServerEvent::NewReaction { .. } => "new_reaction",
            ServerEvent::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_server_event_tags() {
        let event = ServerEvent::NewMessage {
            conversation_id: "c1".into(),
            message: json!({"id": "m1"}),
        };
        assert_eq!(event.kind(), "new_message");

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "new_message");
        assert_eq!(value["payload"]["conversationId"], "c1");
    }

    #[test]
    fn test_presence_event_payload() {
        let event = ServerEvent::presence("u1", PresenceStatus::Online);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "presence");
        assert_eq!(value["payload"]["userId"], "u1");
        assert_eq!(value["payload"]["status"], "online");
        assert!(value["payload"]["timestamp"].is_u64());
    }

    #[test]
    fn test_client_frame_kind() {
        assert_eq!(ClientFrame::Ping.kind(), "ping");
        assert_eq!(
            ClientFrame::Typing {
                conversation_id: "c1".into(),
                is_typing: false
            }
            .kind(),
            "typing"
        );
        // Unknown frames keep their original wire tag for error reporting.
        assert_eq!(
            ClientFrame::Unknown {
                kind: "frobnicate".into()
            }
            .kind(),
            "frobnicate"
        );
    }

    #[test]
    fn test_server_event_roundtrip() {
        let event = ServerEvent::Typing {
            conversation_id: "c1".into(),
            user_id: "u1".into(),
            is_typing: true,
        };
        let text = serde_json::to_string(&event).unwrap();
        let back: ServerEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(event, back);
    }
}
