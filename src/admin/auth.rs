use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::admin::handlers::AdminError;
use crate::admin::AdminState;

/// Require `Authorization: Bearer <admin.api_key>`.
///
/// The key is read from the live config, so a reload rotates it.
pub async fn admin_auth_middleware(
    State(state): State<AdminState>,
    request: Request,
    next: Next,
) -> Response {
    let config = state.gateway.config();
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(key) if constant_time_eq(key.as_bytes(), config.admin.api_key.as_bytes()) => {
            next.run(request).await
        }
        _ => {
            tracing::warn!("Rejected admin request with missing or wrong key");
            AdminError::Unauthorized.into_response()
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
