//! Codec for the relay wire envelope.
//!
//! Frames are JSON text: `{"type": ..., "payload": ..., "timestamp": ...}`.
//! Decoding matches the tag exhaustively and never fails on an unknown tag;
//! a known tag with an undecodable payload is a [`ProtocolError::Decode`].

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::events::{epoch_millis, ClientFrame, InboundFrame, ServerEvent};

/// Maximum accepted frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Payload could not be decoded.
    #[error("Malformed frame: {0}")]
    Decode(#[source] serde_json::Error),

    /// Event could not be encoded.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    timestamp: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationPayload {
    conversation_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingPayload {
    conversation_id: String,
    is_typing: bool,
}

/// Decode an inbound frame from JSON text.
///
/// # Errors
///
/// Returns an error if the text is oversized, is not a JSON envelope, or
/// carries a known tag with an undecodable payload. Unknown tags decode
/// successfully to [`ClientFrame::Unknown`].
pub fn decode_frame(text: &str) -> Result<InboundFrame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    let raw: RawEnvelope = serde_json::from_str(text).map_err(ProtocolError::Decode)?;

    let frame = match raw.kind.as_str() {
        "ping" => ClientFrame::Ping,
        "subscribe" => {
            let p: ConversationPayload =
                serde_json::from_value(raw.payload).map_err(ProtocolError::Decode)?;
            ClientFrame::Subscribe {
                conversation_id: p.conversation_id,
            }
        }
        "unsubscribe" => {
            let p: ConversationPayload =
                serde_json::from_value(raw.payload).map_err(ProtocolError::Decode)?;
            ClientFrame::Unsubscribe {
                conversation_id: p.conversation_id,
            }
        }
        "typing" => {
            let p: TypingPayload =
                serde_json::from_value(raw.payload).map_err(ProtocolError::Decode)?;
            ClientFrame::Typing {
                conversation_id: p.conversation_id,
                is_typing: p.is_typing,
            }
        }
        _ => ClientFrame::Unknown { kind: raw.kind },
    };

    Ok(InboundFrame {
        frame,
        timestamp: raw.timestamp,
    })
}

/// Encode an outbound event as JSON text, stamping the envelope timestamp.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_event(event: &ServerEvent) -> Result<String, ProtocolError> {
    let mut value = serde_json::to_value(event).map_err(ProtocolError::Encode)?;
    value["timestamp"] = Value::from(epoch_millis());
    serde_json::to_string(&value).map_err(ProtocolError::Encode)
}
