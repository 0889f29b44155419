//! Metric names and recording helpers for the relay core.
//!
//! Recording goes through the `metrics` facade; without an installed
//! recorder every call is a no-op.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "chorus_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "chorus_connections_active";
    pub const CLIENTS_REGISTERED: &str = "chorus_clients_registered";
    pub const MESSAGES_INBOUND: &str = "chorus_messages_inbound_total";
    pub const MESSAGES_INBOUND_BYTES: &str = "chorus_messages_inbound_bytes";
    pub const FRAMES_OUTBOUND: &str = "chorus_frames_outbound_total";
    pub const EVICTIONS_TOTAL: &str = "chorus_evictions_total";
    pub const PINGS_TOTAL: &str = "chorus_pings_total";
    pub const ERRORS_TOTAL: &str = "chorus_errors_total";
}

/// Record an inbound message accepted for broadcast.
pub fn record_inbound(bytes: usize) {
    counter!(names::MESSAGES_INBOUND).increment(1);
    counter!(names::MESSAGES_INBOUND_BYTES).increment(bytes as u64);
}

/// Record an outbound data frame and how many payloads it carried.
pub fn record_outbound(payloads: usize) {
    counter!(names::FRAMES_OUTBOUND, "payloads" => bucket(payloads)).increment(1);
}

/// Record a liveness probe.
pub fn record_ping() {
    counter!(names::PINGS_TOTAL).increment(1);
}

/// Record a slow client evicted by the hub.
pub fn record_eviction() {
    counter!(names::EVICTIONS_TOTAL).increment(1);
}

/// Update the registered client gauge.
pub fn set_registered(count: usize) {
    gauge!(names::CLIENTS_REGISTERED).set(count as f64);
}

/// Record a pump error.
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
}

fn bucket(payloads: usize) -> &'static str {
    match payloads {
        0 | 1 => "1",
        2..=8 => "2-8",
        _ => "9+",
    }
}
