//! Inbound request identification.
//!
//! # Responsibilities
//! - Keep a well-formed inbound `X-Request-Id`, mint a UUID v4 otherwise
//!
//! # Design Decisions
//! - Inbound ids are echoed and forwarded, so they must be header- and log-safe

use axum::http::HeaderMap;
use uuid::Uuid;

pub use crate::security::headers::X_REQUEST_ID;

const MAX_REQUEST_ID_LEN: usize = 128;

/// 1..=128 characters of `[A-Za-z0-9._-]`.
pub fn is_valid_request_id(id: &str) -> bool {
    (1..=MAX_REQUEST_ID_LEN).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// The request id to use for a request with these headers.
pub fn resolve_request_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|id| is_valid_request_id(id))
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
