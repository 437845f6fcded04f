//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by outcome code and status
//! - `gateway_request_duration_seconds` (histogram): end-to-end latency
//! - `gateway_rejections_total` (counter): pipeline rejections by stage and reason
//! - `gateway_backend_active` (gauge): 1=active, 0=inactive
//! - `gateway_backend_load` (gauge): in-flight dispatches per backend
//! - `gateway_backend_latency_ms` (gauge): EWMA latency per backend
//! - `gateway_rate_limit_buckets` (gauge): tracked identities
//!
//! # Design Decisions
//! - One recorder per process; the handle is rendered by `/metrics`
//! - Without an installed recorder every update is a no-op

use std::sync::OnceLock;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder (idempotent).
pub fn init_metrics() -> Option<PrometheusHandle> {
    if let Some(handle) = HANDLE.get() {
        return Some(handle.clone());
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = HANDLE.set(handle.clone());
            tracing::info!("Prometheus recorder installed");
            Some(handle)
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            None
        }
    }
}

/// The installed handle, if any.
pub fn handle() -> Option<PrometheusHandle> {
    HANDLE.get().cloned()
}

/// Record a finished request.
pub fn record_request(code: &'static str, status: u16, start: Instant) {
    counter!("gateway_requests_total", "code" => code, "status" => status.to_string())
        .increment(1);
    histogram!("gateway_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

/// Record a pipeline rejection.
pub fn record_rejection(stage: &'static str, reason: &'static str) {
    counter!("gateway_rejections_total", "stage" => stage, "reason" => reason).increment(1);
}

pub fn record_backend_health(backend: &str, active: bool) {
    gauge!("gateway_backend_active", "backend" => backend.to_string())
        .set(if active { 1.0 } else { 0.0 });
}

pub fn record_backend_load(backend: &str, load: usize) {
    gauge!("gateway_backend_load", "backend" => backend.to_string()).set(load as f64);
}

pub fn record_backend_latency(backend: &str, ewma_ms: f64) {
    gauge!("gateway_backend_latency_ms", "backend" => backend.to_string()).set(ewma_ms);
}

pub fn record_rate_limit_buckets(count: usize) {
    gauge!("gateway_rate_limit_buckets").set(count as f64);
}
