//! Upstream request construction and response cleanup.

use axum::body::Body;
use axum::http::header::HOST;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request, Response};

use crate::error::GatewayError;
use crate::load_balancer::Backend;
use crate::pipeline::context::RequestContext;
use crate::security::headers::{
    strip_gateway_owned, strip_hop_by_hop, X_AUTH_ROLES, X_AUTH_SUBJECT, X_REQUEST_ID,
};

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Copy the admitted request onto `backend`.
///
/// Method, path and query are preserved. Hop-by-hop and gateway-owned
/// headers are replaced by the gateway's own view of the client.
pub fn build_request(
    parts: &Parts,
    ctx: &RequestContext,
    backend: &Backend,
    body: Body,
) -> Result<Request<Body>, GatewayError> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = backend.upstream_uri(path_and_query).map_err(|e| {
        tracing::error!(request_id = %ctx.request_id, error = %e, "Cannot build upstream URI");
        GatewayError::Internal
    })?;

    let mut headers = parts.headers.clone();
    forwarding_headers(&mut headers, ctx)?;

    let mut request = Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .body(body)
        .map_err(|_| GatewayError::Internal)?;
    *request.headers_mut() = headers;
    Ok(request)
}

fn forwarding_headers(headers: &mut HeaderMap, ctx: &RequestContext) -> Result<(), GatewayError> {
    strip_hop_by_hop(headers);
    strip_gateway_owned(headers);
    // The client sets Host from the upstream URI.
    headers.remove(HOST);

    let value = |s: &str| HeaderValue::from_str(s).map_err(|_| GatewayError::Internal);

    headers.insert(X_FORWARDED_FOR, value(&ctx.identity.ip.to_string())?);
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(ctx.proto));
    headers.insert(X_REQUEST_ID, value(&ctx.request_id)?);

    if let Some(principal) = ctx.principal.as_ref() {
        // Subjects are not trusted to be header-safe.
        match HeaderValue::from_str(&principal.subject) {
            Ok(subject) => {
                headers.insert(X_AUTH_SUBJECT, subject);
            }
            Err(_) => return Err(GatewayError::AuthInvalid(crate::security::TokenRejection::Malformed)),
        }
        if !principal.roles.is_empty() {
            if let Ok(roles) = HeaderValue::from_str(&principal.roles_header()) {
                headers.insert(X_AUTH_ROLES, roles);
            }
        }
    }
    Ok(())
}

/// Strip hop-by-hop headers from an upstream response and echo the request id.
pub fn clean_response<B>(response: &mut Response<B>, request_id: &str) {
    let headers = response.headers_mut();
    strip_hop_by_hop(headers);
    if let Ok(id) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::Deadline;
    use crate::security::token::Principal;
    use std::collections::BTreeSet;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::{Duration, Instant};

    fn ctx() -> RequestContext {
        let peer = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let client = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7));
        let deadline = Deadline::new(Instant::now(), None, Duration::from_secs(30));
        let mut ctx = RequestContext::new(peer, client, "https", "/v1/orders".into(), deadline);
        ctx.request_id = "req-42".into();
        ctx
    }

    fn parts(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn rewrites_onto_backend_and_injects_forwarding() {
        let backend = Backend::parse("http://127.0.0.1:9000/api", 1).unwrap();
        let parts = parts(
            Request::post("/v1/orders?page=2")
                .header("host", "gateway.example")
                .header("connection", "close, x-secret")
                .header("x-secret", "1")
                .header("keep-alive", "timeout=5")
                .header("x-forwarded-for", "6.6.6.6")
                .header("x-auth-subject", "admin")
                .header("accept", "application/json"),
        );

        let request = build_request(&parts, &ctx(), &backend, Body::empty()).unwrap();
        assert_eq!(request.method(), "POST");
        assert_eq!(request.uri(), "http://127.0.0.1:9000/api/v1/orders?page=2");

        let headers = request.headers();
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "198.51.100.7");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "https");
        assert_eq!(headers.get(X_REQUEST_ID).unwrap(), "req-42");
        assert_eq!(headers.get("accept").unwrap(), "application/json");
        for gone in ["host", "connection", "x-secret", "keep-alive", "x-auth-subject"] {
            assert!(!headers.contains_key(gone), "{gone} leaked upstream");
        }
    }

    #[test]
    fn principal_is_forwarded_as_headers() {
        let backend = Backend::parse("http://127.0.0.1:9000", 1).unwrap();
        let mut ctx = ctx();
        ctx.principal = Some(Principal {
            subject: "user-1".into(),
            roles: BTreeSet::from(["write".to_string(), "read".to_string()]),
            expires_at: 0,
        });

        let request = build_request(&parts(Request::get("/")), &ctx, &backend, Body::empty()).unwrap();
        assert_eq!(request.headers().get(X_AUTH_SUBJECT).unwrap(), "user-1");
        assert_eq!(request.headers().get(X_AUTH_ROLES).unwrap(), "read,write");
    }

    #[test]
    fn response_loses_hop_headers() {
        let mut response = Response::builder()
            .header("transfer-encoding", "chunked")
            .header("upgrade", "h2c")
            .header("content-type", "text/plain")
            .body(())
            .unwrap();
        clean_response(&mut response, "req-9");
        assert!(!response.headers().contains_key("transfer-encoding"));
        assert!(!response.headers().contains_key("upgrade"));
        assert_eq!(response.headers().get(X_REQUEST_ID).unwrap(), "req-9");
    }
}
