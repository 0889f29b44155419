//! Metrics export for Chorus.
//!
//! The relay core records through the `metrics` facade using the names in
//! [`chorus_core::metrics::names`]; this module describes them and exports
//! them in Prometheus format.

use chorus_core::metrics::names;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of accepted connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open connections"
    );
    metrics::describe_gauge!(
        names::CLIENTS_REGISTERED,
        "Current number of clients registered with the hub"
    );
    metrics::describe_counter!(
        names::MESSAGES_INBOUND,
        "Total number of inbound messages relayed"
    );
    metrics::describe_counter!(
        names::MESSAGES_INBOUND_BYTES,
        "Total bytes of inbound messages relayed"
    );
    metrics::describe_counter!(
        names::FRAMES_OUTBOUND,
        "Total number of outbound data frames, by coalesced payload count"
    );
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Total number of slow clients evicted by the hub"
    );
    metrics::describe_counter!(names::PINGS_TOTAL, "Total number of liveness probes sent");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of pump errors");

    info!("Metrics initialized");
}

/// Install the Prometheus recorder, start its listener on `host:port`, and
/// describe the relay metrics on it.
///
/// # Errors
///
/// Returns an error if the address is invalid or the server cannot be
/// started.
pub fn start_metrics_server(host: &str, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    // Must follow install()
    init_metrics();

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
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
