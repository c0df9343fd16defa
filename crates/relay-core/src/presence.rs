//! Presence store: who is online, anywhere in the fleet.
//!
//! A presence record says "user X is online via socket S on instance I".
//! Records carry a bounded TTL renewed by heartbeats, so presence degrades
//! to offline within the TTL window after a crash with no explicit
//! disconnect. Deletion is conditional on the socket ID so a delayed
//! disconnect cannot clobber a fresher reconnect.
//!
//! The single-device model applies: one authoritative record per user,
//! last writer wins.

use crate::bus::{topics, EventBus};
use crate::event::RemoteEvent;
use crate::store::StoreError;
use crate::UserId;
use async_trait::async_trait;
use dashmap::DashMap;
use relay_protocol::{epoch_millis, PresenceStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Stored presence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub socket_id: String,
    pub instance_id: String,
    /// Optional display metadata (e.g. display name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Publish and query online status, independent of socket ownership.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Upsert the user's record with a fresh TTL and announce `online` on
    /// the broadcast topic.
    async fn set_online(&self, record: PresenceRecord) -> Result<(), StoreError>;

    /// Delete the record only if it still belongs to `socket_id`, then
    /// announce `offline`. Returns whether a record was deleted.
    async fn set_offline(&self, user_id: &str, socket_id: &str) -> Result<bool, StoreError>;

    /// Renew the TTL. No-op if the record is gone.
    async fn refresh(&self, user_id: &str) -> Result<(), StoreError>;

    /// Whether the user currently has a live presence record.
    async fn is_online(&self, user_id: &str) -> Result<bool, StoreError>;

    /// Batched existence check for list-rendering use cases.
    async fn batch_is_online(
        &self,
        user_ids: &[UserId],
    ) -> Result<HashMap<UserId, bool>, StoreError>;
}

struct StoredPresence {
    record: PresenceRecord,
    expires_at: Instant,
}

/// In-memory presence store for single-node deployments and tests.
///
/// Expiry is lazy: an expired record counts as offline on read and is
/// removed when observed.
pub struct MemoryPresenceStore {
    records: DashMap<UserId, StoredPresence>,
    ttl: Duration,
    bus: Arc<dyn EventBus>,
}

impl MemoryPresenceStore {
    /// Create a store announcing presence changes on the given bus.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
            bus,
        }
    }

    async fn announce(&self, user_id: &str, status: PresenceStatus) {
        let event = RemoteEvent::PresenceChanged {
            user_id: user_id.to_string(),
            status,
            timestamp: epoch_millis(),
        };
        let payload = match event.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(user = %user_id, error = %e, "Presence event serialization failed");
                return;
            }
        };
        if let Err(e) = self.bus.publish(topics::BROADCAST, payload).await {
            warn!(user = %user_id, error = %e, "Presence change publish failed");
        }
    }

    fn live(&self, user_id: &str) -> bool {
        {
            let Some(entry) = self.records.get(user_id) else {
                return false;
            };
            if entry.expires_at > Instant::now() {
                return true;
            }
            // Guard dropped here; expired records are reaped below.
        }
        let _ = self
            .records
            .remove_if(user_id, |_, v| v.expires_at <= Instant::now());
        false
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set_online(&self, record: PresenceRecord) -> Result<(), StoreError> {
        let user_id = record.user_id.clone();
        debug!(user = %user_id, socket = %record.socket_id, "Presence online");
        self.records.insert(
            user_id.clone(),
            StoredPresence {
                record,
                expires_at: Instant::now() + self.ttl,
            },
        );
        self.announce(&user_id, PresenceStatus::Online).await;
        Ok(())
    }

    async fn set_offline(&self, user_id: &str, socket_id: &str) -> Result<bool, StoreError> {
        let removed = self
            .records
            .remove_if(user_id, |_, v| v.record.socket_id == socket_id)
            .is_some();

        if removed {
            debug!(user = %user_id, socket = %socket_id, "Presence offline");
            self.announce(user_id, PresenceStatus::Offline).await;
        }
        Ok(removed)
    }

    async fn refresh(&self, user_id: &str) -> Result<(), StoreError> {
        if let Some(mut entry) = self.records.get_mut(user_id) {
            entry.expires_at = Instant::now() + self.ttl;
        }
        Ok(())
    }

    async fn is_online(&self, user_id: &str) -> Result<bool, StoreError> {
        Ok(self.live(user_id))
    }

    async fn batch_is_online(
        &self,
        user_ids: &[UserId],
    ) -> Result<HashMap<UserId, bool>, StoreError> {
        Ok(user_ids
            .iter()
            .map(|id| (id.clone(), self.live(id)))
            .collect())
    }
}
