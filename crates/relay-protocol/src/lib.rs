//! # relay-protocol
//!
//! Wire protocol definitions for the relay chat gateway.
//!
//! This crate defines the JSON frames exchanged between clients and the
//! gateway: inbound frames (`ping`, `subscribe`, `unsubscribe`, `typing`)
//! and outbound events (`pong`, `presence`, `typing`, `new_message`,
//! `new_reaction`, `error`), plus the envelope codec.
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, ClientFrame, ServerEvent};
//!
//! let inbound = codec::decode_frame(
//!     r#"{"type":"subscribe","payload":{"conversationId":"c1"}}"#,
//! ).unwrap();
//! assert!(matches!(inbound.frame, ClientFrame::Subscribe { .. }));
//!
//! let text = codec::encode_event(&ServerEvent::Pong).unwrap();
//! assert!(text.contains("\"pong\""));
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode_frame, encode_event, ProtocolError, MAX_FRAME_SIZE};
pub use events::{
    close, epoch_millis, error_code, ClientFrame, InboundFrame, PresenceStatus, ServerEvent,
};
