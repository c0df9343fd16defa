//! # relay-cluster
//!
//! Redis-backed implementations of the relay-core seams for multi-instance
//! deployments: the pub/sub [`EventBus`](relay_core::EventBus), the
//! [`PresenceStore`](relay_core::PresenceStore), and the
//! [`RouteStore`](relay_core::RouteStore).
//!
//! All concurrency control is pushed into Redis: records carry a TTL set
//! with `SET ... EX`, and deletes are conditional on the stored socket ID
//! (a Lua script) so a stale disconnect cannot clobber a fresher
//! reconnect. Instances hold no locks of their own.

pub mod bus;
pub mod presence;
pub mod routes;

pub use bus::RedisBus;
pub use presence::RedisPresenceStore;
pub use routes::RedisRouteStore;

use relay_core::StoreError;

/// Key naming for records stored in Redis.
pub(crate) mod keys {
    pub fn presence(user_id: &str) -> String {
        format!("relay:presence:{user_id}")
    }

    pub fn route(user_id: &str) -> String {
        format!("relay:route:{user_id}")
    }
}

/// Delete KEYS[1] only when its stored `socket_id` equals ARGV[1].
pub(crate) const CONDITIONAL_DELETE: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then return 0 end
local record = cjson.decode(current)
if record['socket_id'] == ARGV[1] then
  redis.call('DEL', KEYS[1])
  return 1
end
return 0
"#;

/// Open a managed connection for the key/value stores.
///
/// # Errors
///
/// Returns an error if the Redis endpoint is unreachable.
pub async fn manager(url: &str) -> Result<redis::aio::ConnectionManager, StoreError> {
    let client = redis::Client::open(url)
        .map_err(|e| StoreError::Backend(format!("Invalid Redis URL: {e}")))?;
    client
        .get_connection_manager()
        .await
        .map_err(map_redis_err)
}

pub(crate) fn map_redis_err(e: redis::RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
    {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}
