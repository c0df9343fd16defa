//! Pub/sub bus abstraction for inter-instance events.
//!
//! Instances talk to each other over named topics: one topic per instance
//! for point-to-point delivery and a shared broadcast topic for events every
//! instance must see (presence changes). Publish is fire-and-forget; a
//! dropped event is not recovered by this layer.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

/// Topic naming for the bus.
pub mod topics {
    /// Shared topic every instance subscribes to.
    pub const BROADCAST: &str = "relay:events";

    /// Per-instance topic for point-to-point delivery.
    #[must_use]
    pub fn instance(instance_id: &str) -> String {
        format!("relay:instance:{instance_id}")
    }
}

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus backend is unreachable.
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    /// Publish failed.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Subscribe failed.
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// Event payload could not be serialized.
    #[error("Event serialization error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A long-lived subscription to one topic.
pub struct BusSubscription {
    receiver: mpsc::UnboundedReceiver<Bytes>,
}

impl BusSubscription {
    /// Wrap a receiver produced by a bus implementation.
    #[must_use]
    pub fn from_receiver(receiver: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self { receiver }
    }

    /// Receive the next payload. Returns `None` when the bus side closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }
}

/// Transport for inter-instance events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a payload to a topic. Fire-and-forget: no subscriber means
    /// the payload is dropped.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError>;

    /// Open a long-lived subscription to a topic.
    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError>;
}

/// Default per-topic channel capacity for the in-memory bus.
const MEMORY_BUS_CAPACITY: usize = 1024;

/// In-process bus over `tokio::sync::broadcast` channels, one per topic.
///
/// Used for single-node deployments and for tests, where sharing one
/// `MemoryBus` between several registries exercises the full cross-instance
/// path without a network.
pub struct MemoryBus {
    channels: DashMap<String, broadcast::Sender<Bytes>>,
    capacity: usize,
}

impl MemoryBus {
    /// Create a bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(MEMORY_BUS_CAPACITY)
    }

    /// Create a bus with a specific per-topic capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    fn channel(&self, topic: &str) -> broadcast::Sender<Bytes> {
        self.channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        // send() errors when there are no receivers; that is fine.
        let receivers = self.channel(topic).send(payload).unwrap_or_default();
        trace!(topic = %topic, receivers, "Published to memory bus");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError> {
        let mut rx = self.channel(topic).subscribe();
        let (tx, receiver) = mpsc::unbounded_channel();

        // Bridge broadcast to mpsc so the subscription outlives lagging.
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break; // Subscriber dropped
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        });

        Ok(BusSubscription::from_receiver(receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_memory_bus_publish_subscribe() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("t1").await.unwrap();

        bus.publish("t1", Bytes::from_static(b"hello")).await.unwrap();

        let payload = timeout(Duration::from_millis(200), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_memory_bus_topic_isolation() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("t1").await.unwrap();

        bus.publish("t2", Bytes::from_static(b"other")).await.unwrap();
        bus.publish("t1", Bytes::from_static(b"mine")).await.unwrap();

        let payload = timeout(Duration::from_millis(200), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&payload[..], b"mine");
    }

    #[tokio::test]
    async fn test_memory_bus_fanout_to_all_subscribers() {
        let bus = MemoryBus::new();
        let mut sub1 = bus.subscribe("t1").await.unwrap();
        let mut sub2 = bus.subscribe("t1").await.unwrap();

        bus.publish("t1", Bytes::from_static(b"x")).await.unwrap();

        assert!(timeout(Duration::from_millis(200), sub1.recv())
            .await
            .unwrap()
            .is_some());
        assert!(timeout(Duration::from_millis(200), sub2.recv())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_memory_bus_publish_without_subscribers() {
        let bus = MemoryBus::new();
        // Fire-and-forget: publishing into the void succeeds.
        bus.publish("empty", Bytes::from_static(b"x")).await.unwrap();
    }
}
