//! # relay-core
//!
//! Connection registry, presence, routing, and fan-out primitives for the
//! relay chat gateway.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **ConnectionRegistry** - in-process map of live sockets and their
//!   subscription sets; the only component that touches send handles
//! - **PresenceStore** - "is this user visible as online", with TTL and
//!   conditional delete
//! - **RouteStore / InstanceRouter** - "where to deliver": which instance
//!   owns a user's socket, plus point-to-point and broadcast publish
//! - **EventBus** - pub/sub transport between instances
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────┐     ┌─────────────┐
//! │   Gateway   │────▶│ ConnectionRegistry│────▶│   sockets   │
//! └─────────────┘     └──────────────────┘     └─────────────┘
//!        │                      ▲
//!        ▼                      │ apply RemoteEvent
//! ┌─────────────┐     ┌──────────────────┐
//! │ Presence /  │────▶│    EventBus      │
//! │ RouteStore  │     │ (per-instance +  │
//! └─────────────┘     │ broadcast topics)│
//!                     └──────────────────┘
//! ```

pub mod bus;
pub mod event;
pub mod presence;
pub mod registry;
pub mod routes;
pub mod store;

/// A user identifier, opaque to this layer.
pub type UserId = String;
/// A conversation identifier, opaque to this layer.
pub type ConversationId = String;
/// Identifier of one application instance, fixed at process start.
pub type InstanceId = String;

pub use bus::{topics, BusError, BusSubscription, EventBus, MemoryBus};
pub use event::RemoteEvent;
pub use presence::{MemoryPresenceStore, PresenceRecord, PresenceStore};
pub use registry::{
    ConnectionRegistry, EventSender, Identity, RegistryConfig, RegistryError, SocketId,
};
pub use routes::{InstanceRouter, MemoryRouteStore, RouteRecord, RouteStore};
pub use store::StoreError;
