//! In-process connection registry.
//!
//! The registry is the only component that holds live socket send handles.
//! It tracks every connection accepted by this instance together with its
//! subscription set, and performs all local fan-out. Cross-instance
//! delivery is layered on top by the instance router; the registry itself
//! never touches the network.
//!
//! The registry is an explicitly constructed object: callers create one per
//! process (or per test) and share it via `Arc`. There is no global.

use crate::{ConversationId, UserId};
use dashmap::DashMap;
use relay_protocol::ServerEvent;
use std::collections::HashSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Unique identifier for a socket, generated at accept time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocketId(pub String);

impl SocketId {
    /// Create a socket ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random socket ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("sock_{}", Uuid::new_v4()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SocketId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SocketId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity bound to a connection at handshake time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

impl Identity {
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}

/// Per-socket outbound send handle.
///
/// The gateway owns the matching receiver and drains it into the socket
/// sink, which keeps per-socket send order intact with a single writer.
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A connection with this socket ID is already registered.
    #[error("Duplicate socket id: {0}")]
    DuplicateSocket(SocketId),

    /// Per-connection subscription limit reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum subscriptions per connection.
    pub max_subscriptions_per_connection: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: 100,
        }
    }
}

/// State held for one live connection.
struct ConnectionEntry {
    identity: Identity,
    connected_at: u64,
    subscriptions: HashSet<ConversationId>,
    sender: EventSender,
}

/// Concurrency-safe bookkeeping of live sockets and their subscriptions.
pub struct ConnectionRegistry {
    connections: DashMap<SocketId, ConnectionEntry>,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    /// Create a registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            connections: DashMap::new(),
            config,
        }
    }

    /// Insert a new connection.
    ///
    /// # Errors
    ///
    /// Returns an error on a duplicate socket ID. With generated IDs this
    /// indicates a caller bug, not a runtime condition.
    pub fn register(
        &self,
        socket_id: SocketId,
        identity: Identity,
        sender: EventSender,
    ) -> Result<(), RegistryError> {
        let entry = ConnectionEntry {
            identity,
            connected_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            subscriptions: HashSet::new(),
            sender,
        };

        match self.connections.entry(socket_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RegistryError::DuplicateSocket(socket_id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                debug!(socket = %socket_id, "Connection registered");
                Ok(())
            }
        }
    }

    /// Remove a connection. Idempotent.
    pub fn deregister(&self, socket_id: &SocketId) {
        if self.connections.remove(socket_id).is_some() {
            debug!(socket = %socket_id, "Connection deregistered");
        }
    }

    /// Add a conversation to a connection's subscription set.
    ///
    /// A missing connection is a no-op: the client may have disconnected
    /// while the frame was in flight.
    ///
    /// # Errors
    ///
    /// Returns an error when the subscription limit is reached.
    pub fn subscribe(
        &self,
        socket_id: &SocketId,
        conversation_id: impl Into<ConversationId>,
    ) -> Result<(), RegistryError> {
        if let Some(mut entry) = self.connections.get_mut(socket_id) {
            let conversation_id = conversation_id.into();
            if entry.subscriptions.contains(&conversation_id) {
                return Ok(());
            }
            if entry.subscriptions.len() >= self.config.max_subscriptions_per_connection {
                return Err(RegistryError::MaxSubscriptionsReached);
            }
            entry.subscriptions.insert(conversation_id.clone());
            debug!(socket = %socket_id, conversation = %conversation_id, "Subscribed");
        }
        Ok(())
    }

    /// Remove a conversation from a connection's subscription set. No-op if
    /// the connection or the subscription is gone.
    pub fn unsubscribe(&self, socket_id: &SocketId, conversation_id: &str) {
        if let Some(mut entry) = self.connections.get_mut(socket_id) {
            if entry.subscriptions.remove(conversation_id) {
                debug!(socket = %socket_id, conversation = %conversation_id, "Unsubscribed");
            }
        }
    }

    /// Snapshot of the sockets currently subscribed to a conversation.
    ///
    /// A subscriber that joins or leaves during iteration may or may not be
    /// included; fan-out is best-effort, not transactional.
    #[must_use]
    pub fn subscribers_of(&self, conversation_id: &str) -> Vec<SocketId> {
        self.connections
            .iter()
            .filter(|e| e.subscriptions.contains(conversation_id))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Whether the given socket is subscribed to the conversation.
    #[must_use]
    pub fn user_subscribed(&self, user_id: &str, conversation_id: &str) -> bool {
        self.connections.iter().any(|e| {
            e.identity.user_id == user_id && e.subscriptions.contains(conversation_id)
        })
    }

    /// Send an event to one socket. Returns `false` if the connection is
    /// gone or its writer has shut down; the close path owns deregistration.
    pub fn send_to_socket(&self, socket_id: &SocketId, event: ServerEvent) -> bool {
        match self.connections.get(socket_id) {
            Some(entry) => entry.sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Send an event to the local connection of a user, if any.
    ///
    /// Returns `false` when the user has no connection on this instance;
    /// the caller should then consult the instance router.
    pub fn send_to_user(&self, user_id: &str, event: ServerEvent) -> bool {
        let target = self
            .connections
            .iter()
            .find(|e| e.identity.user_id == user_id)
            .map(|e| e.sender.clone());

        match target {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Fan an event out to every local subscriber of a conversation,
    /// skipping connections of `exclude_user` if given.
    ///
    /// Returns the number of sockets the event was written to.
    pub fn broadcast_to_conversation(
        &self,
        conversation_id: &str,
        event: &ServerEvent,
        exclude_user: Option<&str>,
    ) -> usize {
        // Snapshot senders first so no shard lock is held while sending.
        let targets: Vec<EventSender> = self
            .connections
            .iter()
            .filter(|e| e.subscriptions.contains(conversation_id))
            .filter(|e| exclude_user != Some(e.identity.user_id.as_str()))
            .map(|e| e.sender.clone())
            .collect();

        let mut delivered = 0;
        for sender in targets {
            if sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }

        trace!(conversation = %conversation_id, recipients = delivered, "Local fan-out");
        delivered
    }

    /// Send an event to every local connection. Used to relay global
    /// presence changes.
    pub fn send_to_all(&self, event: &ServerEvent) -> usize {
        let targets: Vec<EventSender> =
            self.connections.iter().map(|e| e.sender.clone()).collect();

        let mut delivered = 0;
        for sender in targets {
            if sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Whether the user has a live connection on this instance.
    #[must_use]
    pub fn has_user(&self, user_id: &str) -> bool {
        self.connections
            .iter()
            .any(|e| e.identity.user_id == user_id)
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of distinct users with at least one live connection.
    #[must_use]
    pub fn distinct_user_count(&self) -> usize {
        let users: HashSet<String> = self
            .connections
            .iter()
            .map(|e| e.identity.user_id.clone())
            .collect();
        users.len()
    }

    /// Timestamp (epoch millis) the socket connected at, if registered.
    #[must_use]
    pub fn connected_at(&self, socket_id: &SocketId) -> Option<u64> {
        self.connections.get(socket_id).map(|e| e.connected_at)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connect(
        registry: &ConnectionRegistry,
        user: &str,
    ) -> (SocketId, UnboundedReceiver<ServerEvent>) {
        let socket_id = SocketId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        registry
            .register(socket_id.clone(), Identity::new(user, user), tx)
            .unwrap();
        (socket_id, rx)
    }

    #[test]
    fn test_register_deregister_counts() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.connection_count(), 0);

        let (s1, _rx1) = connect(&registry, "alice");
        let (s2, _rx2) = connect(&registry, "alice");
        let (s3, _rx3) = connect(&registry, "bob");

        assert_eq!(registry.connection_count(), 3);
        assert_eq!(registry.distinct_user_count(), 2);

        registry.deregister(&s1);
        assert_eq!(registry.connection_count(), 2);

        // Deregister is idempotent.
        registry.deregister(&s1);
        assert_eq!(registry.connection_count(), 2);

        registry.deregister(&s2);
        registry.deregister(&s3);
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.distinct_user_count(), 0);
    }

    #[test]
    fn test_duplicate_socket_rejected() {
        let registry = ConnectionRegistry::new();
        let socket_id = SocketId::new("sock_fixed");
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        registry
            .register(socket_id.clone(), Identity::new("u1", "u1"), tx1)
            .unwrap();
        assert!(matches!(
            registry.register(socket_id, Identity::new("u1", "u1"), tx2),
            Err(RegistryError::DuplicateSocket(_))
        ));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_subscribe_unsubscribe_roundtrip() {
        let registry = ConnectionRegistry::new();
        let (socket_id, _rx) = connect(&registry, "alice");

        let before = registry.subscribers_of("c1");
        registry.subscribe(&socket_id, "c1").unwrap();
        assert_eq!(registry.subscribers_of("c1"), vec![socket_id.clone()]);

        registry.unsubscribe(&socket_id, "c1");
        assert_eq!(registry.subscribers_of("c1"), before);
    }

    #[test]
    fn test_connected_at_tracks_registration() {
        let registry = ConnectionRegistry::new();
        let (socket_id, _rx) = connect(&registry, "alice");

        assert!(registry.connected_at(&socket_id).is_some());
        registry.deregister(&socket_id);
        assert!(registry.connected_at(&socket_id).is_none());
    }

    #[test]
    fn test_deregister_drops_subscriptions() {
        let registry = ConnectionRegistry::new();
        let (socket_id, _rx) = connect(&registry, "alice");
        registry.subscribe(&socket_id, "c1").unwrap();

        // Close without explicit unsubscribe; the subscriber set converges.
        registry.deregister(&socket_id);
        assert!(registry.subscribers_of("c1").is_empty());
        assert!(!registry.user_subscribed("alice", "c1"));
    }

    #[test]
    fn test_subscribe_missing_socket_is_noop() {
        let registry = ConnectionRegistry::new();
        let ghost = SocketId::generate();
        registry.subscribe(&ghost, "c1").unwrap();
        registry.unsubscribe(&ghost, "c1");
        assert!(registry.subscribers_of("c1").is_empty());
    }

    #[test]
    fn test_subscription_limit() {
        let registry = ConnectionRegistry::with_config(RegistryConfig {
            max_subscriptions_per_connection: 2,
        });
        let (socket_id, _rx) = connect(&registry, "alice");

        registry.subscribe(&socket_id, "c1").unwrap();
        registry.subscribe(&socket_id, "c2").unwrap();
        // Re-subscribing an existing conversation does not count.
        registry.subscribe(&socket_id, "c1").unwrap();
        assert!(matches!(
            registry.subscribe(&socket_id, "c3"),
            Err(RegistryError::MaxSubscriptionsReached)
        ));
    }

    #[test]
    fn test_broadcast_excludes_user() {
        let registry = ConnectionRegistry::new();
        let (s1, mut rx1) = connect(&registry, "alice");
        let (s2, mut rx2) = connect(&registry, "bob");
        registry.subscribe(&s1, "c1").unwrap();
        registry.subscribe(&s2, "c1").unwrap();

        let event = ServerEvent::error("test", "test");

        let delivered = registry.broadcast_to_conversation("c1", &event, None);
        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());

        let delivered = registry.broadcast_to_conversation("c1", &event, Some("alice"));
        assert_eq!(delivered, 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_broadcast_delivers_exactly_once_per_subscriber() {
        let registry = ConnectionRegistry::new();
        let (s1, mut rx1) = connect(&registry, "alice");
        registry.subscribe(&s1, "c1").unwrap();
        registry.subscribe(&s1, "c2").unwrap();

        registry.broadcast_to_conversation("c1", &ServerEvent::Pong, None);
        assert!(rx1.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());
    }

    #[test]
    fn test_send_to_user() {
        let registry = ConnectionRegistry::new();
        let (_s1, mut rx1) = connect(&registry, "alice");

        assert!(registry.send_to_user("alice", ServerEvent::Pong));
        assert!(rx1.try_recv().is_ok());
        assert!(!registry.send_to_user("nobody", ServerEvent::Pong));
    }

    #[test]
    fn test_send_to_socket_after_writer_gone() {
        let registry = ConnectionRegistry::new();
        let (socket_id, rx) = connect(&registry, "alice");
        drop(rx);

        // Failed send does not deregister; the close path does.
        assert!(!registry.send_to_socket(&socket_id, ServerEvent::Pong));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_user_subscribed() {
        let registry = ConnectionRegistry::new();
        let (s1, _rx) = connect(&registry, "alice");
        registry.subscribe(&s1, "c1").unwrap();

        assert!(registry.user_subscribed("alice", "c1"));
        assert!(!registry.user_subscribed("alice", "c2"));
        assert!(!registry.user_subscribed("bob", "c1"));
    }
}
