//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total{method,status,protocol}` (counter)
//! - `proxy_request_duration_seconds{protocol}` (histogram)
//! - `proxy_pool_sessions` (gauge): open upstream HTTP/2 sessions
//! - `proxy_queue_depth` (gauge): requests waiting for stream capacity
//! - `proxy_queue_rejections_total{reason}` (counter): full / timeout
//! - `proxy_protocol_probes_total{result}` (counter)

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 120.0];

/// Install the Prometheus recorder and its scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    let builder = match PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets(LATENCY_BUCKETS)
    {
        Ok(builder) => builder,
        Err(e) => {
            tracing::error!(error = %e, "Invalid histogram buckets");
            return;
        }
    };

    if let Err(e) = builder.install() {
        tracing::error!(error = %e, "Failed to install Prometheus recorder");
        return;
    }

    describe_counter!("proxy_requests_total", "Total proxied requests");
    describe_histogram!("proxy_request_duration_seconds", "Time to upstream response headers");
    describe_gauge!("proxy_pool_sessions", "Open upstream HTTP/2 sessions");
    describe_gauge!("proxy_queue_depth", "Requests waiting for upstream stream capacity");
    describe_counter!("proxy_queue_rejections_total", "Queued requests rejected, by reason");
    describe_counter!("proxy_protocol_probes_total", "HTTP/2 support probes, by result");

    tracing::info!(address = %addr, "Metrics endpoint listening");
}

pub fn record_request(method: &str, status: u16, protocol: &'static str, start: Instant) {
    counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string(),
        "protocol" => protocol
    )
    .increment(1);
    histogram!("proxy_request_duration_seconds", "protocol" => protocol)
        .record(start.elapsed().as_secs_f64());
}

pub fn set_pool_sessions(count: usize) {
    gauge!("proxy_pool_sessions").set(count as f64);
}

pub fn set_queue_depth(depth: usize) {
    gauge!("proxy_queue_depth").set(depth as f64);
}

pub fn record_queue_rejection(reason: &'static str) {
    counter!("proxy_queue_rejections_total", "reason" => reason).increment(1);
}

pub fn record_probe(result: &'static str) {
    counter!("proxy_protocol_probes_total", "result" => result).increment(1);
}
