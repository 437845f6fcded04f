//! Retry eligibility.
//!
//! # Responsibilities
//! - Decide whether a failed upstream connect may be retried on another backend
//! - Bound how much body is buffered to make the retry possible
//!
//! # Design Decisions
//! - Only idempotent methods by default; `X-Idempotent: true` opts others in
//! - Only connect failures are retried: the backend never saw the request
//! - Bodies without a declared length are buffered only up to the limit;
//!   past it they are forwarded as they arrive and never retried

use axum::http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use axum::http::request::Parts;
use axum::http::Method;

use crate::config::UpstreamConfig;

pub const X_IDEMPOTENT: &str = "x-idempotent";

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    enabled: bool,
    methods: Vec<Method>,
    buffer_limit: usize,
}

impl RetryPolicy {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        let methods = config
            .retry_methods
            .iter()
            .filter_map(|m| Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()).ok())
            .collect();
        Self {
            enabled: config.retry_once,
            methods,
            buffer_limit: usize::try_from(config.retry_buffer_bytes).unwrap_or(usize::MAX),
        }
    }

    /// Largest body buffered for replay.
    pub fn buffer_limit(&self) -> usize {
        self.buffer_limit
    }

    /// Whether a request with this head may be replayed on another backend.
    pub fn eligible(&self, parts: &Parts) -> bool {
        if !self.enabled {
            return false;
        }

        let marked = parts
            .headers
            .get(X_IDEMPOTENT)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if !marked && !self.methods.contains(&parts.method) {
            return false;
        }

        match declared_length(parts) {
            Some(len) => len <= self.buffer_limit as u64,
            None => !parts.headers.contains_key(TRANSFER_ENCODING),
        }
    }
}

fn declared_length(parts: &Parts) -> Option<u64> {
    parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}
