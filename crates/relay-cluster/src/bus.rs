//! Redis pub/sub event bus.
//!
//! One PUBLISH connection (managed, auto-reconnecting) plus one dedicated
//! pub/sub connection whose stream side is drained by a background task and
//! dispatched to local subscribers by channel name. Channel subscription is
//! dynamic: topics are added to the pub/sub connection as local
//! subscriptions appear.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink};
use redis::AsyncCommands;
use relay_core::{BusError, BusSubscription, EventBus};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

type TopicSenders = Arc<DashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>>;

/// Event bus over Redis pub/sub channels.
pub struct RedisBus {
    publish_conn: ConnectionManager,
    sink: Mutex<PubSubSink>,
    subscribers: TopicSenders,
}

impl RedisBus {
    /// Connect to Redis and start the dispatch task.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is unreachable.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)
            .map_err(|e| BusError::Unavailable(format!("Invalid Redis URL: {e}")))?;

        let publish_conn = client
            .get_connection_manager()
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        let pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        let (sink, mut stream) = pubsub.split();

        let subscribers: TopicSenders = Arc::new(DashMap::new());
        let dispatch_targets = Arc::clone(&subscribers);

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let topic = msg.get_channel_name().to_string();
                let payload = Bytes::copy_from_slice(msg.get_payload_bytes());

                if let Some(mut senders) = dispatch_targets.get_mut(&topic) {
                    senders.retain(|tx| tx.send(payload.clone()).is_ok());
                }
            }
            // The stream only ends when the pub/sub connection is lost.
            warn!("Redis pub/sub stream ended; bus subscriptions are dead");
        });

        info!(url = %url, "Redis bus connected");

        Ok(Self {
            publish_conn,
            sink: Mutex::new(sink),
            subscribers,
        })
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        let mut conn = self.publish_conn.clone();
        let receivers: i64 = conn
            .publish(topic, payload.as_ref())
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        debug!(topic = %topic, receivers, "Published to Redis bus");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();

        self.subscribers
            .entry(topic.to_string())
            .or_default()
            .push(tx);

        self.sink
            .lock()
            .await
            .subscribe(topic)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        debug!(topic = %topic, "Subscribed to Redis channel");
        Ok(BusSubscription::from_receiver(rx))
    }
}
