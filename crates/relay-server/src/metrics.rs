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
    pub const SUBMISSIONS_TOTAL: &str = "flowrelay_submissions_total";
    pub const REJECTIONS_TOTAL: &str = "flowrelay_rejections_total";
    pub const LIVE_CONNECTIONS_ACTIVE: &str = "flowrelay_live_connections_active";
    pub const LIVE_MESSAGES_TOTAL: &str = "flowrelay_live_messages_total";
    pub const REQUEST_SECONDS: &str = "flowrelay_request_seconds";
    pub const ERRORS_TOTAL: &str = "flowrelay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SUBMISSIONS_TOTAL,
        "Messages accepted by the bus, by kind"
    );
    metrics::describe_counter!(
        names::REJECTIONS_TOTAL,
        "Submissions rejected before reaching the bus, by reason"
    );
    metrics::describe_gauge!(
        names::LIVE_CONNECTIONS_ACTIVE,
        "Current number of live WebSocket subscribers"
    );
    metrics::describe_counter!(
        names::LIVE_MESSAGES_TOTAL,
        "Messages pushed to live subscribers"
    );
    metrics::describe_histogram!(
        names::REQUEST_SECONDS,
        "Submission handling latency in seconds"
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

/// Record an accepted submission.
pub fn record_submission(kind: &'static str) {
    counter!(names::SUBMISSIONS_TOTAL, "kind" => kind).increment(1);
}

/// Record a rejected submission.
pub fn record_rejection(reason: &'static str) {
    counter!(names::REJECTIONS_TOTAL, "reason" => reason).increment(1);
}

/// Record submission latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::REQUEST_SECONDS).record(seconds);
}

/// Record a message pushed to a live subscriber.
pub fn record_live_message(topic: &str) {
    counter!(names::LIVE_MESSAGES_TOTAL, "topic" => topic.to_string()).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard tracking a live subscriber for its lifetime.
pub struct LiveConnectionGuard;

impl LiveConnectionGuard {
    /// Create a new guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        gauge!(names::LIVE_CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for LiveConnectionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LiveConnectionGuard {
    fn drop(&mut self) {
        gauge!(names::LIVE_CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter() {
        // Without an installed recorder these are no-ops.
        let _guard = LiveConnectionGuard::new();
        record_submission("CHAT");
        record_rejection("validation");
        record_latency(0.001);
    }
}
