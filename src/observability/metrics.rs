//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): relayed requests by status
//! - `gateway_request_duration_seconds` (histogram): relay latency
//! - `gateway_transport_sessions_total` (counter): framed transport
//!   negotiations by transport
//! - `gateway_workers_spawned_total` / `gateway_workers_terminated_total`
//!   (counters)
//! - `gateway_active_workers` (gauge)
//! - `gateway_failed_logins_total` (counter): by login mode
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - The Prometheus exporter is opt-in and runs in the master only

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint on `addr`.
///
/// Must be called from inside the Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to start metrics endpoint"),
    }
}

pub fn record_request(status: u16, elapsed: Duration) {
    metrics::counter!("gateway_requests_total", "status" => status.to_string()).increment(1);
    metrics::histogram!("gateway_request_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_transport(transport: &'static str) {
    metrics::counter!("gateway_transport_sessions_total", "transport" => transport).increment(1);
}

pub fn record_worker_spawned() {
    metrics::counter!("gateway_workers_spawned_total").increment(1);
}

pub fn record_worker_terminated() {
    metrics::counter!("gateway_workers_terminated_total").increment(1);
}

pub fn set_active_workers(count: usize) {
    metrics::gauge!("gateway_active_workers").set(count as f64);
}

pub fn record_failed_login(mode: &'static str) {
    metrics::counter!("gateway_failed_logins_total", "mode" => mode).increment(1);
}
