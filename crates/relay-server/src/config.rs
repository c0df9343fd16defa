//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (RELAY_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Heartbeat and idle-timeout configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Presence and route TTLs.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Cluster configuration.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between presence/route TTL renewals in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle window after which a silent connection is closed, in
    /// milliseconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
}

/// Presence and route record lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Record TTL in seconds. Bounds the staleness window after a crash
    /// with no explicit disconnect.
    #[serde(default = "default_presence_ttl")]
    pub ttl_secs: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum subscriptions per connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,
}

/// How instances find each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    /// Single instance; in-process bus and stores.
    Memory,
    /// Redis-backed bus and stores shared across the fleet.
    Redis,
}

/// Cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Backend selection.
    #[serde(default = "default_cluster_mode")]
    pub mode: ClusterMode,

    /// Redis endpoint, used when mode is `redis`.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Stable identifier for this instance. Generated per process when
    /// unset.
    #[serde(default)]
    pub instance_id: Option<String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Identity bound to a static token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenIdentity {
    pub user_id: String,
    pub username: String,
}

/// Authentication configuration.
///
/// Token issuance lives outside this service; the static table here backs
/// the built-in verifier used for development and tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Static token table: token -> identity.
    #[serde(default)]
    pub tokens: HashMap<String, TokenIdentity>,
}

// Default value functions
fn default_host() -> String {
    std::env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RELAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_heartbeat_interval() -> u64 {
    15_000 // 15 seconds
}

fn default_idle_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_presence_ttl() -> u64 {
    45 // seconds; three missed heartbeats
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_cluster_mode() -> ClusterMode {
    ClusterMode::Memory
}

fn default_redis_url() -> String {
    std::env::var("RELAY_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            presence: PresenceConfig::default(),
            limits: LimitsConfig::default(),
            cluster: ClusterConfig::default(),
            metrics: MetricsConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            idle_timeout_ms: default_idle_timeout(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_presence_ttl(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: default_max_subscriptions(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            mode: default_cluster_mode(),
            redis_url: default_redis_url(),
            instance_id: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host/port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Presence/route TTL as a duration.
    #[must_use]
    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence.ttl_secs)
    }

    /// Heartbeat interval as a duration.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms)
    }

    /// Idle timeout as a duration.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat.idle_timeout_ms)
    }
}
