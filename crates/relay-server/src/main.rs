//! # Relay Gateway
//!
//! Real-time chat gateway: WebSocket connections, presence, and
//! cross-instance event fan-out.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (single instance, in-memory cluster)
//! relayd
//!
//! # Run with environment variables
//! RELAY_PORT=8080 RELAY_HOST=0.0.0.0 relayd
//! ```
//!
//! Configuration is read from `relay.toml` when present; see
//! [`config::Config`].

mod auth;
mod config;
mod fanout;
mod gateway;
mod metrics;

use anyhow::Result;
use auth::StaticTokenVerifier;
use config::ClusterMode;
use fanout::{EventFanout, MemoryDirectory};
use gateway::AppState;
use relay_core::{
    ConnectionRegistry, EventBus, InstanceRouter, MemoryBus, MemoryPresenceStore,
    MemoryRouteStore, PresenceStore, RegistryConfig, RouteStore,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    let instance_id = config
        .cluster
        .instance_id
        .clone()
        .unwrap_or_else(|| format!("inst-{}", Uuid::new_v4()));

    tracing::info!(
        "Starting relay gateway {} on {}:{}",
        instance_id,
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    let ttl = config.presence_ttl();

    // Cluster backends
    let (bus, presence, routes): (
        Arc<dyn EventBus>,
        Arc<dyn PresenceStore>,
        Arc<dyn RouteStore>,
    ) = match config.cluster.mode {
        ClusterMode::Memory => {
            let bus: Arc<dyn EventBus> = Arc::new(MemoryBus::new());
            let presence = Arc::new(MemoryPresenceStore::new(bus.clone(), ttl));
            let routes = Arc::new(MemoryRouteStore::new(ttl));
            (bus, presence, routes)
        }
        ClusterMode::Redis => {
            let url = &config.cluster.redis_url;
            let bus: Arc<dyn EventBus> = Arc::new(relay_cluster::RedisBus::connect(url).await?);
            let conn = relay_cluster::manager(url).await?;
            let presence = Arc::new(relay_cluster::RedisPresenceStore::new(
                conn.clone(),
                bus.clone(),
                ttl,
            ));
            let routes = Arc::new(relay_cluster::RedisRouteStore::new(conn, ttl));
            (bus, presence, routes)
        }
    };

    let registry = Arc::new(ConnectionRegistry::with_config(RegistryConfig {
        max_subscriptions_per_connection: config.limits.max_subscriptions_per_connection,
    }));
    let router = Arc::new(InstanceRouter::new(instance_id, routes, bus));
    let fanout = Arc::new(EventFanout::new(
        registry.clone(),
        router.clone(),
        Arc::new(MemoryDirectory::new()),
    ));
    fanout.start_listeners().await?;

    let verifier = Arc::new(StaticTokenVerifier::from_config(&config.auth));

    let state = Arc::new(AppState {
        registry,
        presence,
        router,
        fanout,
        verifier,
        config,
    });

    // Start the server
    gateway::run_server(state).await?;

    Ok(())
}
