//! Gateway error taxonomy.
//!
//! Every pipeline stage fails with a [`GatewayError`]. The orchestrator turns
//! it into a JSON response and an audit event; the `code` string is stable and
//! shared by both.

use std::time::Duration;

use axum::http::header::{HeaderValue, RETRY_AFTER, WWW_AUTHENTICATE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::security::headers::X_REQUEST_ID;
use crate::security::rate_limit::Denial;
use crate::security::sanitize::Rejection;
use crate::security::token::TokenRejection;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("request rejected: {0}")]
    Malformed(Rejection),

    #[error("authentication required")]
    AuthRequired,

    #[error("invalid token: {0}")]
    AuthInvalid(TokenRejection),

    #[error("forbidden: {0}")]
    AuthForbidden(&'static str),

    #[error("rate limited: {reason}")]
    RateLimited {
        reason: &'static str,
        retry_after: Duration,
    },

    #[error("no upstream available")]
    NoUpstream,

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("upstream unreachable")]
    UpstreamUnreachable,

    #[error("client cancelled")]
    ClientCancelled,

    #[error("internal error")]
    Internal,
}

impl GatewayError {
    /// Stable code used in responses and audit events.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Malformed(_) => "REQUEST_MALFORMED",
            GatewayError::AuthRequired => "AUTH_REQUIRED",
            GatewayError::AuthInvalid(_) => "AUTH_INVALID",
            GatewayError::AuthForbidden(_) => "AUTH_FORBIDDEN",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::NoUpstream => "NO_UPSTREAM",
            GatewayError::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            GatewayError::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
            GatewayError::ClientCancelled => "CLIENT_CANCELLED",
            GatewayError::Internal => "INTERNAL",
        }
    }

    /// Sub-reason, when the code alone is not specific.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            GatewayError::Malformed(r) => Some(r.as_str()),
            GatewayError::AuthRequired => Some(TokenRejection::Missing.as_str()),
            GatewayError::AuthInvalid(r) => Some(r.as_str()),
            GatewayError::AuthForbidden(reason) => Some(reason),
            GatewayError::RateLimited { reason, .. } => Some(reason),
            GatewayError::NoUpstream => Some("NO_UPSTREAM_AVAILABLE"),
            _ => None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Malformed(r) => match r {
                Rejection::PayloadTooLarge | Rejection::HeaderTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                Rejection::PathTraversal => StatusCode::FORBIDDEN,
                Rejection::InvalidContentType | Rejection::TooManyParts => StatusCode::BAD_REQUEST,
            },
            GatewayError::AuthRequired | GatewayError::AuthInvalid(_) => StatusCode::UNAUTHORIZED,
            GatewayError::AuthForbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NoUpstream => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            // 499: nobody reads it, but access logs show the cancellation.
            GatewayError::ClientCancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            GatewayError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render the error for a request.
    pub fn into_response_for(self, request_id: &str) -> Response {
        let status = self.status();

        if matches!(self, GatewayError::ClientCancelled) {
            return status.into_response();
        }

        let body = match (&self, self.reason()) {
            (GatewayError::Internal, _) | (_, None) => json!({
                "code": self.code(),
                "request_id": request_id,
            }),
            (_, Some(reason)) => json!({
                "code": self.code(),
                "reason": reason,
                "request_id": request_id,
            }),
        };

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        if let Ok(id) = HeaderValue::from_str(request_id) {
            headers.insert(X_REQUEST_ID, id);
        }
        match &self {
            GatewayError::RateLimited { retry_after, .. } => {
                let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
                headers.insert(RETRY_AFTER, HeaderValue::from(secs));
            }
            GatewayError::AuthRequired => {
                headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            GatewayError::AuthInvalid(_) => {
                headers.insert(
                    WWW_AUTHENTICATE,
                    HeaderValue::from_static("Bearer error=\"invalid_token\""),
                );
            }
            _ => {}
        }
        response
    }
}

impl From<Rejection> for GatewayError {
    fn from(r: Rejection) -> Self {
        GatewayError::Malformed(r)
    }
}

impl From<TokenRejection> for GatewayError {
    fn from(r: TokenRejection) -> Self {
        match r {
            TokenRejection::Missing => GatewayError::AuthRequired,
            other => GatewayError::AuthInvalid(other),
        }
    }
}

impl From<Denial> for GatewayError {
    fn from(d: Denial) -> Self {
        match d {
            Denial::Blocked => GatewayError::AuthForbidden("IP_BLOCKED"),
            Denial::RateLimitExceeded { retry_after } | Denial::TooManyConnections { retry_after } => {
                GatewayError::RateLimited {
                    reason: d.as_str(),
                    retry_after,
                }
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.into_response_for("")
    }
}
