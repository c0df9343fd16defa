//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const FRAMES_TOTAL: &str = "relay_frames_total";
    pub const FANOUT_DELIVERIES_TOTAL: &str = "relay_fanout_deliveries_total";
    pub const PRESENCE_EVENTS_TOTAL: &str = "relay_presence_events_total";
    pub const SUBSCRIPTIONS_TOTAL: &str = "relay_subscriptions_total";
    pub const DISPATCH_SECONDS: &str = "relay_dispatch_seconds";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(
        names::FANOUT_DELIVERIES_TOTAL,
        "Total events delivered to local sockets by the fan-out path"
    );
    metrics::describe_counter!(
        names::PRESENCE_EVENTS_TOTAL,
        "Total presence transitions relayed to clients"
    );
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of conversation subscriptions"
    );
    metrics::describe_histogram!(
        names::DISPATCH_SECONDS,
        "Inbound frame dispatch latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame by direction.
pub fn record_frame(direction: &str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction.to_string()).increment(1);
}

/// Record fan-out deliveries to local sockets.
pub fn record_fanout_deliveries(kind: &str, count: usize) {
    counter!(names::FANOUT_DELIVERIES_TOTAL, "kind" => kind.to_string())
        .increment(count as u64);
}

/// Record a presence transition relayed to clients.
pub fn record_presence_event(status: &str) {
    counter!(names::PRESENCE_EVENTS_TOTAL, "status" => status.to_string()).increment(1);
}

/// Record a subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Record inbound frame dispatch latency.
pub fn record_dispatch_latency(seconds: f64) {
    histogram!(names::DISPATCH_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
