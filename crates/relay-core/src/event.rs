//! Inter-instance event payloads.
//!
//! These are the messages carried by the pub/sub bus between instances.
//! They wrap a client-facing [`ServerEvent`] together with enough routing
//! context for the receiving instance to apply it locally.

use crate::{ConversationId, InstanceId, UserId};
use bytes::Bytes;
use relay_protocol::{PresenceStatus, ServerEvent};
use serde::{Deserialize, Serialize};

/// An event published between instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteEvent {
    /// Deliver to every local subscriber of a conversation.
    ///
    /// `origin` lets instances skip events they published themselves on the
    /// broadcast topic (local fan-out already happened at the origin).
    Conversation {
        conversation_id: ConversationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exclude_user: Option<UserId>,
        origin: InstanceId,
        event: ServerEvent,
    },

    /// Deliver to one user's socket on the receiving instance, if that user
    /// is still connected there and subscribed to the conversation.
    Direct {
        conversation_id: ConversationId,
        user_id: UserId,
        event: ServerEvent,
    },

    /// A user's presence changed somewhere in the fleet.
    PresenceChanged {
        user_id: UserId,
        status: PresenceStatus,
        timestamp: u64,
    },
}

impl RemoteEvent {
    /// Serialize for the bus.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Deserialize from a bus payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a valid event.
    pub fn from_bytes(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_event_roundtrip() {
        let event = RemoteEvent::Direct {
            conversation_id: "c1".into(),
            user_id: "bob".into(),
            event: ServerEvent::NewMessage {
                conversation_id: "c1".into(),
                message: serde_json::json!({"id": "m1", "body": "hi"}),
            },
        };

        let bytes = event.to_bytes().unwrap();
        let back = RemoteEvent::from_bytes(&bytes).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn test_presence_changed_roundtrip() {
        let event = RemoteEvent::PresenceChanged {
            user_id: "alice".into(),
            status: PresenceStatus::Offline,
            timestamp: 12345,
        };

        let bytes = event.to_bytes().unwrap();
        assert_eq!(RemoteEvent::from_bytes(&bytes).unwrap(), event);
    }

    #[test]
    fn test_conversation_event_omits_empty_exclusion() {
        let event = RemoteEvent::Conversation {
            conversation_id: "c1".into(),
            exclude_user: None,
            origin: "inst-1".into(),
            event: ServerEvent::Pong,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("exclude_user").is_none());
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(RemoteEvent::from_bytes(b"not json").is_err());
    }
}
