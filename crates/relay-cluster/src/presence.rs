//! Redis-backed presence store.
//!
//! Records are JSON values under `relay:presence:{user}` with a TTL set at
//! write time; liveness is an `EXISTS` check, so expiry needs no reaper.

use crate::{keys, map_redis_err, CONDITIONAL_DELETE};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use relay_core::{topics, EventBus, PresenceRecord, PresenceStore, RemoteEvent, StoreError, UserId};
use relay_protocol::{epoch_millis, PresenceStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Presence store over Redis.
pub struct RedisPresenceStore {
    conn: ConnectionManager,
    ttl: Duration,
    bus: Arc<dyn EventBus>,
    delete_script: Script,
}

impl RedisPresenceStore {
    /// Create a store announcing presence changes on the given bus.
    #[must_use]
    pub fn new(conn: ConnectionManager, bus: Arc<dyn EventBus>, ttl: Duration) -> Self {
        Self {
            conn,
            ttl,
            bus,
            delete_script: Script::new(CONDITIONAL_DELETE),
        }
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
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
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn set_online(&self, record: PresenceRecord) -> Result<(), StoreError> {
        let user_id = record.user_id.clone();
        let json = serde_json::to_string(&record)?;

        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(keys::presence(&user_id), json, self.ttl_secs())
            .await
            .map_err(map_redis_err)?;

        debug!(user = %user_id, socket = %record.socket_id, "Presence online");
        self.announce(&user_id, PresenceStatus::Online).await;
        Ok(())
    }

    async fn set_offline(&self, user_id: &str, socket_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .delete_script
            .key(keys::presence(user_id))
            .arg(socket_id)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_err)?;

        if removed == 1 {
            debug!(user = %user_id, socket = %socket_id, "Presence offline");
            self.announce(user_id, PresenceStatus::Offline).await;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn refresh(&self, user_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.expire::<_, i64>(keys::presence(user_id), self.ttl_secs() as i64)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn is_online(&self, user_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        conn.exists(keys::presence(user_id))
            .await
            .map_err(map_redis_err)
    }

    async fn batch_is_online(
        &self,
        user_ids: &[UserId],
    ) -> Result<HashMap<UserId, bool>, StoreError> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let keys: Vec<String> = user_ids.iter().map(|id| keys::presence(id)).collect();
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = conn.mget(keys).await.map_err(map_redis_err)?;

        Ok(user_ids
            .iter()
            .zip(values)
            .map(|(id, value)| (id.clone(), value.is_some()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::MemoryBus;

    fn record(user: &str, socket: &str) -> PresenceRecord {
        PresenceRecord {
            user_id: user.to_string(),
            socket_id: socket.to_string(),
            instance_id: "inst-1".to_string(),
            metadata: None,
        }
    }

    #[test]
    fn test_record_serialization_matches_script_fields() {
        // The conditional-delete script reads `socket_id` out of the stored
        // JSON; the serialized field name must not drift.
        let json = serde_json::to_value(record("u1", "s1")).unwrap();
        assert_eq!(json["socket_id"], "s1");
    }

    // Requires a running Redis instance; enable with REDIS_INTEGRATION_TEST=1.
    #[tokio::test]
    async fn test_online_offline_against_redis() {
        if std::env::var("REDIS_INTEGRATION_TEST").is_err() {
            return;
        }

        let conn = crate::manager("redis://localhost:6379").await.unwrap();
        let bus = Arc::new(MemoryBus::new());
        let store = RedisPresenceStore::new(conn, bus, Duration::from_secs(5));

        store.set_online(record("itest-user", "s1")).await.unwrap();
        assert!(store.is_online("itest-user").await.unwrap());

        // Stale socket is a no-op.
        assert!(!store.set_offline("itest-user", "s0").await.unwrap());
        assert!(store.is_online("itest-user").await.unwrap());

        assert!(store.set_offline("itest-user", "s1").await.unwrap());
        assert!(!store.is_online("itest-user").await.unwrap());
    }
}
