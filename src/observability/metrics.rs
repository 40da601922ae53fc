//! Metrics collection and exposition.
//!
//! # Metrics
//! - `sitegate_requests_total` (counter): requests by domain, status
//! - `sitegate_request_duration_seconds` (histogram): latency distribution
//! - `sitegate_admission_rejected_total` (counter): 503s from admission control
//! - `sitegate_request_timeouts_total` (counter): 503s from the request timeout
//! - `sitegate_access_log_dropped_total` (counter): entries lost to a full queue
//! - `sitegate_proxy_errors_total` (counter): upstream failures by domain
//! - `sitegate_plugin_panics_total` (counter): contained plugin panics
//!
//! Recording is a no-op until an exporter is installed, so library users
//! and tests pay nothing for it.

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

const REQUEST_DURATION_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Install the Prometheus exporter with an HTTP scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    let builder = PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full("sitegate_request_duration_seconds".to_string()),
            REQUEST_DURATION_BUCKETS,
        );

    let builder = match builder {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to apply histogram buckets, using defaults");
            PrometheusBuilder::new().with_http_listener(addr)
        }
    };

    match builder.install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

/// Record a completed request.
pub fn record_request(domain: &str, status: u16, start: Instant) {
    let labels = [
        ("domain", domain.to_string()),
        ("status", status.to_string()),
    ];
    metrics::counter!("sitegate_requests_total", &labels).increment(1);
    metrics::histogram!("sitegate_request_duration_seconds", "domain" => domain.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_admission_rejected(domain: &str) {
    metrics::counter!("sitegate_admission_rejected_total", "domain" => domain.to_string())
        .increment(1);
}

pub fn record_timeout(domain: &str) {
    metrics::counter!("sitegate_request_timeouts_total", "domain" => domain.to_string())
        .increment(1);
}

pub fn record_access_log_dropped() {
    metrics::counter!("sitegate_access_log_dropped_total").increment(1);
}

pub fn record_proxy_error(domain: &str) {
    metrics::counter!("sitegate_proxy_errors_total", "domain" => domain.to_string())
        .increment(1);
}

pub fn record_plugin_panic(plugin: &str, hook: &'static str) {
    metrics::counter!(
        "sitegate_plugin_panics_total",
        "plugin" => plugin.to_string(),
        "hook" => hook
    )
    .increment(1);
}
