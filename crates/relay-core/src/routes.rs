//! Instance routing: which instance owns a user's socket, and how to reach
//! it.
//!
//! The route table is structurally identical to the presence table but is
//! kept separate: routing answers "where to deliver", presence answers "is
//! this user visible as online". Both follow the same upsert/TTL/
//! conditional-delete discipline.

use crate::bus::{topics, BusError, BusSubscription, EventBus};
use crate::event::RemoteEvent;
use crate::store::StoreError;
use crate::{InstanceId, UserId};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Stored route record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub user_id: UserId,
    pub socket_id: String,
    pub instance_id: InstanceId,
}

/// The shared routing table.
#[async_trait]
pub trait RouteStore: Send + Sync {
    /// Upsert the user's route with a fresh TTL.
    async fn register_route(&self, record: RouteRecord) -> Result<(), StoreError>;

    /// Current route for a user, if any.
    async fn lookup_route(&self, user_id: &str) -> Result<Option<RouteRecord>, StoreError>;

    /// Delete the route only if it still belongs to `socket_id`. Returns
    /// whether a record was deleted.
    async fn remove_route(&self, user_id: &str, socket_id: &str) -> Result<bool, StoreError>;

    /// Renew the TTL. No-op if the route is gone.
    async fn refresh_route(&self, user_id: &str) -> Result<(), StoreError>;
}

struct StoredRoute {
    record: RouteRecord,
    expires_at: Instant,
}

/// In-memory route table for single-node deployments and tests.
pub struct MemoryRouteStore {
    records: DashMap<UserId, StoredRoute>,
    ttl: Duration,
}

impl MemoryRouteStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
        }
    }
}

#[async_trait]
impl RouteStore for MemoryRouteStore {
    async fn register_route(&self, record: RouteRecord) -> Result<(), StoreError> {
        debug!(user = %record.user_id, instance = %record.instance_id, "Route registered");
        self.records.insert(
            record.user_id.clone(),
            StoredRoute {
                record,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn lookup_route(&self, user_id: &str) -> Result<Option<RouteRecord>, StoreError> {
        {
            let Some(entry) = self.records.get(user_id) else {
                return Ok(None);
            };
            if entry.expires_at > Instant::now() {
                return Ok(Some(entry.record.clone()));
            }
        }
        let _ = self
            .records
            .remove_if(user_id, |_, v| v.expires_at <= Instant::now());
        Ok(None)
    }

    async fn remove_route(&self, user_id: &str, socket_id: &str) -> Result<bool, StoreError> {
        let removed = self
            .records
            .remove_if(user_id, |_, v| v.record.socket_id == socket_id)
            .is_some();
        if removed {
            debug!(user = %user_id, socket = %socket_id, "Route removed");
        }
        Ok(removed)
    }

    async fn refresh_route(&self, user_id: &str) -> Result<(), StoreError> {
        if let Some(mut entry) = self.records.get_mut(user_id) {
            entry.expires_at = Instant::now() + self.ttl;
        }
        Ok(())
    }
}

/// Routing facade for one instance: the route table plus the pub/sub bus.
///
/// This component exists because the connection registry is in-process
/// only; an event aimed at a user on another instance has no path to
/// delivery without it.
pub struct InstanceRouter {
    instance_id: InstanceId,
    routes: Arc<dyn RouteStore>,
    bus: Arc<dyn EventBus>,
}

impl InstanceRouter {
    /// Create a router for this instance.
    #[must_use]
    pub fn new(
        instance_id: impl Into<InstanceId>,
        routes: Arc<dyn RouteStore>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            routes,
            bus,
        }
    }

    /// This instance's identifier.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Register a route pointing at this instance.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn register_route(&self, user_id: &str, socket_id: &str) -> Result<(), StoreError> {
        self.routes
            .register_route(RouteRecord {
                user_id: user_id.to_string(),
                socket_id: socket_id.to_string(),
                instance_id: self.instance_id.clone(),
            })
            .await
    }

    /// Current route for a user.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn lookup_route(&self, user_id: &str) -> Result<Option<RouteRecord>, StoreError> {
        self.routes.lookup_route(user_id).await
    }

    /// Conditionally remove a route owned by `socket_id`.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn remove_route(&self, user_id: &str, socket_id: &str) -> Result<bool, StoreError> {
        self.routes.remove_route(user_id, socket_id).await
    }

    /// Renew the route TTL.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn refresh_route(&self, user_id: &str) -> Result<(), StoreError> {
        self.routes.refresh_route(user_id).await
    }

    /// Publish an event to one instance's topic. Fire-and-forget: if the
    /// owner has since failed the event is silently dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be serialized or the bus
    /// rejects the publish.
    pub async fn publish_to_instance(
        &self,
        instance_id: &str,
        event: &RemoteEvent,
    ) -> Result<(), BusError> {
        let payload = event.to_bytes()?;
        self.bus.publish(&topics::instance(instance_id), payload).await
    }

    /// Publish an event every instance should see.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be serialized or the bus
    /// rejects the publish.
    pub async fn publish_to_all(&self, event: &RemoteEvent) -> Result<(), BusError> {
        let payload = event.to_bytes()?;
        self.bus.publish(topics::BROADCAST, payload).await
    }

    /// Subscribe to this instance's point-to-point topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus rejects the subscription.
    pub async fn subscribe_instance(&self) -> Result<BusSubscription, BusError> {
        self.bus.subscribe(&topics::instance(&self.instance_id)).await
    }

    /// Subscribe to the shared broadcast topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus rejects the subscription.
    pub async fn subscribe_broadcast(&self) -> Result<BusSubscription, BusError> {
        self.bus.subscribe(topics::BROADCAST).await
    }
}
