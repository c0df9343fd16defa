//! Event fan-out across the fleet.
//!
//! Local delivery goes straight through the connection registry. Remote
//! delivery resolves each participant's route and publishes a directed
//! event to the owning instance's topic; typing indicators skip the route
//! lookup and ride the broadcast topic instead, since they are frequent
//! and lossy by design. All remote publication is best-effort: a failed
//! publish is logged and dropped, never retried.

use crate::metrics;
use async_trait::async_trait;
use dashmap::DashMap;
use relay_core::{
    BusSubscription, ConnectionRegistry, InstanceRouter, RemoteEvent, UserId,
};
use relay_protocol::ServerEvent;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Directory lookup errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The conversation does not exist.
    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),

    /// The backing service failed.
    #[error("Directory backend error: {0}")]
    Backend(String),
}

/// Resolves a conversation to its participant user IDs.
///
/// Membership is owned by the durable chat service; the gateway only reads
/// it. The in-memory implementation below serves single-node deployments
/// and tests, where membership is pushed in alongside the broadcast call.
#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    /// Participants of a conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the conversation is unknown or the backend
    /// fails.
    async fn participants(&self, conversation_id: &str) -> Result<Vec<UserId>, DirectoryError>;
}

/// In-memory participant directory.
pub struct MemoryDirectory {
    conversations: DashMap<String, Vec<UserId>>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            conversations: DashMap::new(),
        }
    }

    /// Replace the participant list for a conversation.
    pub fn set_participants(&self, conversation_id: impl Into<String>, users: Vec<UserId>) {
        self.conversations.insert(conversation_id.into(), users);
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationDirectory for MemoryDirectory {
    async fn participants(&self, conversation_id: &str) -> Result<Vec<UserId>, DirectoryError> {
        self.conversations
            .get(conversation_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| DirectoryError::UnknownConversation(conversation_id.to_string()))
    }
}

/// Fan-out engine for one instance.
pub struct EventFanout {
    registry: Arc<ConnectionRegistry>,
    router: Arc<InstanceRouter>,
    directory: Arc<dyn ConversationDirectory>,
}

impl EventFanout {
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        router: Arc<InstanceRouter>,
        directory: Arc<dyn ConversationDirectory>,
    ) -> Self {
        Self {
            registry,
            router,
            directory,
        }
    }

    /// Fan a new message out to subscribers everywhere.
    ///
    /// Local subscribers are written to synchronously; remote delivery is
    /// spawned and never blocks the caller. Callers that already know the
    /// participant list (the durable store does) pass it in; otherwise it
    /// is resolved through the directory. Returns the local delivery
    /// count.
    pub fn broadcast_new_message(
        &self,
        conversation_id: &str,
        message: Value,
        participants: Option<Vec<UserId>>,
    ) -> usize {
        let event = ServerEvent::NewMessage {
            conversation_id: conversation_id.to_string(),
            message,
        };
        self.broadcast_conversation_event(conversation_id, event, participants, "message")
    }

    /// Fan a new reaction out to subscribers everywhere. Returns the local
    /// delivery count.
    pub fn broadcast_new_reaction(
        &self,
        conversation_id: &str,
        message_id: &str,
        reaction: Value,
        participants: Option<Vec<UserId>>,
    ) -> usize {
        let event = ServerEvent::NewReaction {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            reaction,
        };
        self.broadcast_conversation_event(conversation_id, event, participants, "reaction")
    }

    fn broadcast_conversation_event(
        &self,
        conversation_id: &str,
        event: ServerEvent,
        participants: Option<Vec<UserId>>,
        kind: &'static str,
    ) -> usize {
        let delivered = self
            .registry
            .broadcast_to_conversation(conversation_id, &event, None);
        metrics::record_fanout_deliveries(kind, delivered);

        let registry = Arc::clone(&self.registry);
        let router = Arc::clone(&self.router);
        let directory = Arc::clone(&self.directory);
        let conversation_id = conversation_id.to_string();
        tokio::spawn(async move {
            let participants = match participants {
                Some(participants) => participants,
                None => match directory.participants(&conversation_id).await {
                    Ok(participants) => participants,
                    Err(e) => {
                        warn!(conversation = %conversation_id, error = %e,
                            "Participant lookup failed");
                        metrics::record_error("directory");
                        return;
                    }
                },
            };
            deliver_remote(&registry, &router, &conversation_id, participants, event).await;
        });

        delivered
    }

    /// Relay a typing indicator to the conversation's other subscribers,
    /// locally and on every other instance.
    pub fn broadcast_typing(&self, conversation_id: &str, user_id: &str, is_typing: bool) {
        let event = ServerEvent::Typing {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            is_typing,
        };

        let delivered =
            self.registry
                .broadcast_to_conversation(conversation_id, &event, Some(user_id));
        metrics::record_fanout_deliveries("typing", delivered);

        let remote = RemoteEvent::Conversation {
            conversation_id: conversation_id.to_string(),
            exclude_user: Some(user_id.to_string()),
            origin: self.router.instance_id().to_string(),
            event,
        };
        let router = Arc::clone(&self.router);
        tokio::spawn(async move {
            if let Err(e) = router.publish_to_all(&remote).await {
                warn!(error = %e, "Typing broadcast publish failed");
            }
        });
    }

    /// Spawn the listener tasks for this instance's topic and the broadcast
    /// topic.
    ///
    /// # Errors
    ///
    /// Returns an error if either bus subscription fails.
    pub async fn start_listeners(&self) -> Result<(), relay_core::BusError> {
        let instance_sub = self.router.subscribe_instance().await?;
        let broadcast_sub = self.router.subscribe_broadcast().await?;

        self.spawn_listener(instance_sub, "instance");
        self.spawn_listener(broadcast_sub, "broadcast");
        Ok(())
    }

    fn spawn_listener(&self, mut sub: BusSubscription, topic_kind: &'static str) {
        let registry = Arc::clone(&self.registry);
        let local_instance = self.router.instance_id().to_string();
        tokio::spawn(async move {
            while let Some(payload) = sub.recv().await {
                match RemoteEvent::from_bytes(&payload) {
                    Ok(event) => apply_remote(&registry, &local_instance, event),
                    Err(e) => {
                        warn!(topic = topic_kind, error = %e, "Undecodable bus payload dropped");
                        metrics::record_error("bus_decode");
                    }
                }
            }
            debug!(topic = topic_kind, "Bus listener stopped");
        });
    }
}

/// Deliver a conversation event to participants on other instances.
///
/// Participants with a local connection were already covered by the local
/// fan-out; everyone else is resolved through the route table.
async fn deliver_remote(
    registry: &ConnectionRegistry,
    router: &InstanceRouter,
    conversation_id: &str,
    participants: Vec<UserId>,
    event: ServerEvent,
) {
    for user_id in participants {
        if registry.has_user(&user_id) {
            continue;
        }

        let route = match router.lookup_route(&user_id).await {
            Ok(Some(route)) => route,
            Ok(None) => continue,
            Err(e) => {
                warn!(user = %user_id, error = %e, "Route lookup failed");
                metrics::record_error("route_lookup");
                continue;
            }
        };

        // The route may point here when the user disconnected between the
        // has_user check and the lookup; nothing to deliver then.
        if route.instance_id == router.instance_id() {
            continue;
        }

        let remote = RemoteEvent::Direct {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.clone(),
            event: event.clone(),
        };
        if let Err(e) = router.publish_to_instance(&route.instance_id, &remote).await {
            warn!(user = %user_id, instance = %route.instance_id, error = %e,
                "Remote delivery publish failed");
            metrics::record_error("remote_publish");
        }
    }
}

/// Apply an event received from the bus to local connections.
fn apply_remote(registry: &ConnectionRegistry, local_instance: &str, event: RemoteEvent) {
    match event {
        RemoteEvent::Direct {
            conversation_id,
            user_id,
            event,
        } => {
            if !registry.user_subscribed(&user_id, &conversation_id) {
                return;
            }
            if registry.send_to_user(&user_id, event) {
                metrics::record_fanout_deliveries("direct", 1);
            }
        }

        RemoteEvent::Conversation {
            conversation_id,
            exclude_user,
            origin,
            event,
        } => {
            // Our own broadcast; local fan-out already happened.
            if origin == local_instance {
                return;
            }
            let delivered = registry.broadcast_to_conversation(
                &conversation_id,
                &event,
                exclude_user.as_deref(),
            );
            metrics::record_fanout_deliveries("conversation", delivered);
        }

        RemoteEvent::PresenceChanged {
            user_id,
            status,
            timestamp,
        } => {
            metrics::record_presence_event(&status.to_string());
            registry.send_to_all(&ServerEvent::Presence {
                user_id,
                status,
                timestamp,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{Identity, MemoryBus, MemoryRouteStore, SocketId};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use tokio::time::timeout;

    struct Instance {
        registry: Arc<ConnectionRegistry>,
        router: Arc<InstanceRouter>,
        fanout: Arc<EventFanout>,
    }

    async fn instance(
        id: &str,
        bus: Arc<MemoryBus>,
        routes: Arc<MemoryRouteStore>,
        directory: Arc<MemoryDirectory>,
    ) -> Instance {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(InstanceRouter::new(id, routes, bus));
        let fanout = Arc::new(EventFanout::new(
            Arc::clone(&registry),
            Arc::clone(&router),
            directory,
        ));
        fanout.start_listeners().await.unwrap();
        Instance {
            registry,
            router,
            fanout,
        }
    }

    async fn connect(
        inst: &Instance,
        user: &str,
        conversation: &str,
    ) -> (SocketId, UnboundedReceiver<ServerEvent>) {
        let socket_id = SocketId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        inst.registry
            .register(socket_id.clone(), Identity::new(user, user), tx)
            .unwrap();
        inst.registry.subscribe(&socket_id, conversation).unwrap();
        inst.router
            .register_route(user, socket_id.as_str())
            .await
            .unwrap();
        (socket_id, rx)
    }

    async fn recv(rx: &mut UnboundedReceiver<ServerEvent>) -> ServerEvent {
        timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_message_reaches_local_and_remote_subscribers() {
        let bus = Arc::new(MemoryBus::new());
        let routes = Arc::new(MemoryRouteStore::new(Duration::from_secs(30)));
        let directory = Arc::new(MemoryDirectory::new());
        directory.set_participants("c1", vec!["alice".into(), "bob".into()]);

        let i1 = instance("i1", bus.clone(), routes.clone(), directory.clone()).await;
        let i2 = instance("i2", bus, routes, directory).await;

        let (_s1, mut alice_rx) = connect(&i1, "alice", "c1").await;
        let (_s2, mut bob_rx) = connect(&i2, "bob", "c1").await;

        let local = i1
            .fanout
            .broadcast_new_message("c1", json!({"id": "m1", "body": "hi"}), None);
        assert_eq!(local, 1);

        assert!(matches!(
            recv(&mut alice_rx).await,
            ServerEvent::NewMessage { .. }
        ));
        assert!(matches!(
            recv(&mut bob_rx).await,
            ServerEvent::NewMessage { .. }
        ));
    }

    #[tokio::test]
    async fn test_remote_delivery_respects_subscription() {
        let bus = Arc::new(MemoryBus::new());
        let routes = Arc::new(MemoryRouteStore::new(Duration::from_secs(30)));
        let directory = Arc::new(MemoryDirectory::new());
        directory.set_participants("c1", vec!["alice".into(), "bob".into()]);

        let i1 = instance("i1", bus.clone(), routes.clone(), directory.clone()).await;
        let i2 = instance("i2", bus, routes, directory).await;

        let (_s1, _alice_rx) = connect(&i1, "alice", "c1").await;
        // Bob is connected on i2 but subscribed to a different conversation.
        let (_s2, mut bob_rx) = connect(&i2, "bob", "c2").await;

        i1.fanout.broadcast_new_message("c1", json!({"id": "m1"}), None);

        assert!(timeout(Duration::from_millis(200), bob_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_typing_excludes_sender_everywhere() {
        let bus = Arc::new(MemoryBus::new());
        let routes = Arc::new(MemoryRouteStore::new(Duration::from_secs(30)));
        let directory = Arc::new(MemoryDirectory::new());
        directory.set_participants("c1", vec!["alice".into(), "bob".into()]);

        let i1 = instance("i1", bus.clone(), routes.clone(), directory.clone()).await;
        let i2 = instance("i2", bus, routes, directory).await;

        let (_s1, mut alice_rx) = connect(&i1, "alice", "c1").await;
        let (_s2, mut bob_rx) = connect(&i2, "bob", "c1").await;

        i1.fanout.broadcast_typing("c1", "alice", true);

        match recv(&mut bob_rx).await {
            ServerEvent::Typing {
                user_id, is_typing, ..
            } => {
                assert_eq!(user_id, "alice");
                assert!(is_typing);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // The sender never sees their own indicator.
        assert!(timeout(Duration::from_millis(200), alice_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_presence_change_relayed_to_every_socket() {
        let bus = Arc::new(MemoryBus::new());
        let routes = Arc::new(MemoryRouteStore::new(Duration::from_secs(30)));
        let directory = Arc::new(MemoryDirectory::new());

        let i1 = instance("i1", bus.clone(), routes.clone(), directory.clone()).await;
        let i2 = instance("i2", bus, routes, directory).await;

        let (_s1, mut alice_rx) = connect(&i1, "alice", "c1").await;
        let (_s2, mut bob_rx) = connect(&i2, "bob", "c1").await;

        i1.router
            .publish_to_all(&RemoteEvent::PresenceChanged {
                user_id: "carol".into(),
                status: relay_protocol::PresenceStatus::Online,
                timestamp: 1,
            })
            .await
            .unwrap();

        for rx in [&mut alice_rx, &mut bob_rx] {
            match recv(rx).await {
                ServerEvent::Presence {
                    user_id, status, ..
                } => {
                    assert_eq!(user_id, "carol");
                    assert_eq!(status, relay_protocol::PresenceStatus::Online);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_explicit_participants_bypass_directory() {
        let bus = Arc::new(MemoryBus::new());
        let routes = Arc::new(MemoryRouteStore::new(Duration::from_secs(30)));
        // Directory is empty; the caller supplies the participant list.
        let directory = Arc::new(MemoryDirectory::new());

        let i1 = instance("i1", bus.clone(), routes.clone(), directory.clone()).await;
        let i2 = instance("i2", bus, routes, directory).await;

        let (_s1, _alice_rx) = connect(&i1, "alice", "c1").await;
        let (_s2, mut bob_rx) = connect(&i2, "bob", "c1").await;

        i1.fanout.broadcast_new_message(
            "c1",
            json!({"id": "m1"}),
            Some(vec!["alice".into(), "bob".into()]),
        );

        assert!(matches!(
            recv(&mut bob_rx).await,
            ServerEvent::NewMessage { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_swallowed() {
        let bus = Arc::new(MemoryBus::new());
        let routes = Arc::new(MemoryRouteStore::new(Duration::from_secs(30)));
        let directory = Arc::new(MemoryDirectory::new());

        let i1 = instance("i1", bus, routes, directory).await;
        // No participants registered and none supplied; the remote path
        // logs and drops.
        let delivered = i1.fanout.broadcast_new_message("nope", json!({}), None);
        assert_eq!(delivered, 0);
    }
}
