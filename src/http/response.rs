//! Responses for the reserved paths.
//!
//! # Responsibilities
//! - `/health`: service status as JSON, no auth
//! - `/metrics`: Prometheus text, restricted by client IP
//!
//! # Design Decisions
//! - Reserved responses carry the request id like forwarded ones

use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use crate::error::GatewayError;
use crate::pipeline::Gateway;
use crate::security::headers::X_REQUEST_ID;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub strategy: &'static str,
    pub backends_total: usize,
    pub backends_active: usize,
}

impl HealthReport {
    pub fn of(gateway: &Gateway) -> Self {
        let pool = gateway.pool();
        let active = pool.active_count();
        Self {
            // The gateway itself is up; "degraded" tells operators nothing can be forwarded.
            status: if active > 0 || pool.is_empty() { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            strategy: pool.strategy().as_str(),
            backends_total: pool.len(),
            backends_active: active,
        }
    }
}

pub fn health_response(gateway: &Gateway, request_id: &str) -> Response {
    with_request_id(Json(HealthReport::of(gateway)).into_response(), request_id)
}

/// Prometheus text for allowed callers; 403 for everyone else.
pub fn metrics_response(handle: Option<&PrometheusHandle>, allowed: bool, request_id: &str) -> Response {
    if !allowed {
        return GatewayError::AuthForbidden("METRICS_RESTRICTED").into_response_for(request_id);
    }
    let Some(handle) = handle else {
        return with_request_id(StatusCode::NOT_FOUND.into_response(), request_id);
    };
    let mut response = handle.render().into_response();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    with_request_id(response, request_id)
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(id) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(X_REQUEST_ID, id);
    }
    response
}
