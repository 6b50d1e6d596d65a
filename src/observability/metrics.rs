//! Metrics collection and exposition.
//!
//! # Metrics
//! - `whizard_gateway_requests_total` (counter): requests by handler, method, status
//! - `whizard_gateway_request_duration_seconds` (histogram): latency by handler
//! - `whizard_gateway_admission_config_*`: admission watcher state
//! - `whizard_gateway_remote_write_fanout_total` (counter): external deliveries
//!
//! # Design Decisions
//! - `metrics` facade; recording is a no-op until an exporter is installed
//! - Prometheus exporter serves its own listener

use std::net::SocketAddr;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            describe();
            tracing::info!(address = %addr, "Metrics exporter listening");
        }
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

fn describe() {
    describe_counter!("whizard_gateway_requests_total", "Requests handled by the gateway.");
    describe_histogram!(
        "whizard_gateway_request_duration_seconds",
        "Time spent handling a request, including the upstream call."
    );
    describe_gauge!(
        "whizard_gateway_admission_config_last_reload_successful",
        "Whether the last admission config reload attempt succeeded."
    );
    describe_gauge!(
        "whizard_gateway_admission_config_last_reload_success_timestamp_seconds",
        "Timestamp of the last successful admission config reload."
    );
    describe_gauge!(
        "whizard_gateway_admission_config_hash",
        "Hash of the currently loaded admission config file."
    );
    describe_gauge!(
        "whizard_gateway_admission_config_tenants",
        "Number of tenants in the active admission config."
    );
    describe_counter!(
        "whizard_gateway_admission_config_file_changes_total",
        "Filesystem change notifications for the admission config."
    );
    describe_counter!(
        "whizard_gateway_admission_config_reload_errors_total",
        "Failed admission config reloads."
    );
    describe_counter!(
        "whizard_gateway_admission_config_refresh_total",
        "Periodic admission config refreshes."
    );
    describe_counter!(
        "whizard_gateway_remote_write_fanout_total",
        "Deliveries to external remote-write destinations."
    );
}

pub fn record_request(handler: &'static str, method: &str, status: u16, start: Instant) {
    counter!(
        "whizard_gateway_requests_total",
        "handler" => handler,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("whizard_gateway_request_duration_seconds", "handler" => handler)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_admission_file_change() {
    counter!("whizard_gateway_admission_config_file_changes_total").increment(1);
}

pub fn record_admission_refresh() {
    counter!("whizard_gateway_admission_config_refresh_total").increment(1);
}

pub fn record_admission_reload(success: bool) {
    if success {
        gauge!("whizard_gateway_admission_config_last_reload_successful").set(1.0);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        gauge!("whizard_gateway_admission_config_last_reload_success_timestamp_seconds").set(now);
    } else {
        gauge!("whizard_gateway_admission_config_last_reload_successful").set(0.0);
        counter!("whizard_gateway_admission_config_reload_errors_total").increment(1);
    }
}

pub fn record_admission_config(hash: f64, tenants: usize) {
    gauge!("whizard_gateway_admission_config_hash").set(hash);
    gauge!("whizard_gateway_admission_config_tenants").set(tenants as f64);
}

pub fn record_fanout(destination: &str, success: bool) {
    counter!(
        "whizard_gateway_remote_write_fanout_total",
        "destination" => destination.to_string(),
        "result" => if success { "success" } else { "failure" }
    )
    .increment(1);
}
