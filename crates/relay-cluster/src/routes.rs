//! Redis-backed route table.
//!
//! Same storage discipline as the presence store, under
//! `relay:route:{user}`. Routes are read on the message fan-out path, so
//! lookups parse the stored record instead of a bare existence check.

use crate::{keys, map_redis_err, CONDITIONAL_DELETE};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use relay_core::{RouteRecord, RouteStore, StoreError};
use std::time::Duration;
use tracing::debug;

/// Route store over Redis.
pub struct RedisRouteStore {
    conn: ConnectionManager,
    ttl: Duration,
    delete_script: Script,
}

impl RedisRouteStore {
    #[must_use]
    pub fn new(conn: ConnectionManager, ttl: Duration) -> Self {
        Self {
            conn,
            ttl,
            delete_script: Script::new(CONDITIONAL_DELETE),
        }
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }
}

#[async_trait]
impl RouteStore for RedisRouteStore {
    async fn register_route(&self, record: RouteRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(&record)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(keys::route(&record.user_id), json, self.ttl_secs())
            .await
            .map_err(map_redis_err)?;
        debug!(user = %record.user_id, instance = %record.instance_id, "Route registered");
        Ok(())
    }

    async fn lookup_route(&self, user_id: &str) -> Result<Option<RouteRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(keys::route(user_id))
            .await
            .map_err(map_redis_err)?;

        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn remove_route(&self, user_id: &str, socket_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .delete_script
            .key(keys::route(user_id))
            .arg(socket_id)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_err)?;

        if removed == 1 {
            debug!(user = %user_id, socket = %socket_id, "Route removed");
        }
        Ok(removed == 1)
    }

    async fn refresh_route(&self, user_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.expire::<_, i64>(keys::route(user_id), self.ttl_secs() as i64)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_record_serialization_matches_script_fields() {
        let record = RouteRecord {
            user_id: "u1".into(),
            socket_id: "s1".into(),
            instance_id: "i1".into(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["socket_id"], "s1");
        assert_eq!(json["instance_id"], "i1");
    }

    // Requires a running Redis instance; enable with REDIS_INTEGRATION_TEST=1.
    #[tokio::test]
    async fn test_route_lifecycle_against_redis() {
        if std::env::var("REDIS_INTEGRATION_TEST").is_err() {
            return;
        }

        let conn = crate::manager("redis://localhost:6379").await.unwrap();
        let store = RedisRouteStore::new(conn, Duration::from_secs(5));

        store
            .register_route(RouteRecord {
                user_id: "itest-route".into(),
                socket_id: "s1".into(),
                instance_id: "i1".into(),
            })
            .await
            .unwrap();

        let found = store.lookup_route("itest-route").await.unwrap().unwrap();
        assert_eq!(found.instance_id, "i1");

        assert!(!store.remove_route("itest-route", "s0").await.unwrap());
        assert!(store.remove_route("itest-route", "s1").await.unwrap());
        assert!(store.lookup_route("itest-route").await.unwrap().is_none());
    }
}
