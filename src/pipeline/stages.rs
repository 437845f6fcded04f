//! Pipeline stages.
//!
//! The orchestrator only knows the two traits below. Each stage either
//! passes the exchange on, possibly rewritten, or fails with a typed
//! [`GatewayError`]; stages never build responses themselves.

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::response::Response;
use futures_util::future::BoxFuture;

use crate::error::GatewayError;
use crate::http::request::resolve_request_id;
use crate::load_balancer::BackendPool;
use crate::observability::{AuditEvent, AuditSink, AuditTag, Verdict};
use crate::pipeline::context::{Exchange, RequestContext};
use crate::security::headers::X_REQUEST_ID;
use crate::security::rate_limit::{Admission, RateLimiter};
use crate::security::sanitize::Sanitizer;
use crate::security::token::TokenValidator;

/// A synchronous gate over the request head.
pub trait Check: Send + Sync {
    /// Stage name used in metrics labels.
    fn name(&self) -> &'static str;

    fn check(&self, ctx: &mut RequestContext, exchange: &mut Exchange) -> Result<(), GatewayError>;
}

/// The terminal stage: turns an admitted exchange into a response.
pub trait Forward: Send + Sync {
    fn forward<'a>(
        &'a self,
        ctx: &'a RequestContext,
        exchange: Exchange,
    ) -> BoxFuture<'a, Result<Response, GatewayError>>;
}

/// Keeps a well-formed `X-Request-Id`, otherwise mints a UUID v4.
#[derive(Debug, Default)]
pub struct RequestIdStage;

impl Check for RequestIdStage {
    fn name(&self) -> &'static str {
        "request_id"
    }

    fn check(&self, ctx: &mut RequestContext, exchange: &mut Exchange) -> Result<(), GatewayError> {
        let id = resolve_request_id(&exchange.parts.headers);
        let value = HeaderValue::from_str(&id).map_err(|_| GatewayError::Internal)?;
        exchange.parts.headers.insert(X_REQUEST_ID, value);
        ctx.request_id = id;
        Ok(())
    }
}

#[derive(Debug)]
pub struct SanitizeStage {
    sanitizer: Sanitizer,
}

impl SanitizeStage {
    pub fn new(sanitizer: Sanitizer) -> Self {
        Self { sanitizer }
    }
}

impl Check for SanitizeStage {
    fn name(&self) -> &'static str {
        "sanitize"
    }

    fn check(&self, ctx: &mut RequestContext, exchange: &mut Exchange) -> Result<(), GatewayError> {
        ctx.stripped = self.sanitizer.check_head(&mut exchange.parts)?;
        let body = std::mem::take(&mut exchange.body);
        let (body, trip) = self.sanitizer.guard_body(&exchange.parts, body);
        exchange.body = body;
        ctx.trip = trip;
        Ok(())
    }
}

/// Token validation. Without a validator, requests pass unauthenticated.
#[derive(Debug)]
pub struct ValidateStage {
    validator: Option<TokenValidator>,
}

impl ValidateStage {
    pub fn new(validator: Option<TokenValidator>) -> Self {
        Self { validator }
    }
}

impl Check for ValidateStage {
    fn name(&self) -> &'static str {
        "validate"
    }

    fn check(&self, ctx: &mut RequestContext, exchange: &mut Exchange) -> Result<(), GatewayError> {
        let Some(validator) = self.validator.as_ref() else {
            return Ok(());
        };

        let source = validator.extract(&exchange.parts.headers);
        validator.strip(&mut exchange.parts.headers);

        if validator.is_public(exchange.parts.uri.path()) {
            return Ok(());
        }

        let principal = validator.verify(source.as_ref().map(|s| s.token()))?;
        ctx.identity = ctx.identity.clone().with_principal(principal.subject.clone());
        ctx.principal = Some(principal);
        Ok(())
    }
}

pub struct RateLimitStage {
    limiter: Arc<RateLimiter>,
    audit: Arc<dyn AuditSink>,
}

impl RateLimitStage {
    pub fn new(limiter: Arc<RateLimiter>, audit: Arc<dyn AuditSink>) -> Self {
        Self { limiter, audit }
    }
}

impl Check for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn check(&self, ctx: &mut RequestContext, _exchange: &mut Exchange) -> Result<(), GatewayError> {
        match self.limiter.check(&ctx.identity)? {
            Admission::Admitted => {}
            Admission::Bypassed => {
                ctx.bypassed = true;
                self.audit.emit(
                    AuditEvent::new(AuditTag::AllowlistBypass, Verdict::Allow)
                        .request_id(ctx.request_id.clone())
                        .client(ctx.identity.clone())
                        .path(ctx.path.clone()),
                );
            }
        }
        Ok(())
    }
}

/// Picks the backend. Fails with `NO_UPSTREAM` when none is active.
pub struct SelectStage {
    pool: Arc<BackendPool>,
}

impl SelectStage {
    pub fn new(pool: Arc<BackendPool>) -> Self {
        Self { pool }
    }
}

impl Check for SelectStage {
    fn name(&self) -> &'static str {
        "select"
    }

    fn check(&self, ctx: &mut RequestContext, _exchange: &mut Exchange) -> Result<(), GatewayError> {
        let backend = self.pool.select(&ctx.identity).ok_or(GatewayError::NoUpstream)?;
        ctx.backend = Some(backend);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::observability::CollectingSink;
    use crate::resilience::Deadline;
    use crate::store::{ManualClock, MemoryRateStore};
    use axum::body::Body;
    use axum::http::Request;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::{Duration, Instant};

    fn exchange(request: Request<Body>) -> (RequestContext, Exchange) {
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));
        let (parts, body) = request.into_parts();
        let deadline = Deadline::new(Instant::now(), None, Duration::from_secs(30));
        let ctx = RequestContext::new(ip, ip, "http", parts.uri.path().to_string(), deadline);
        (ctx, Exchange::new(parts, body))
    }

    #[test]
    fn request_id_is_kept_or_replaced() {
        let (mut ctx, mut ex) = exchange(
            Request::get("/").header("x-request-id", "abc-123.x_y").body(Body::empty()).unwrap(),
        );
        RequestIdStage.check(&mut ctx, &mut ex).unwrap();
        assert_eq!(ctx.request_id, "abc-123.x_y");

        let (mut ctx, mut ex) = exchange(
            Request::get("/").header("x-request-id", "bad id;drop").body(Body::empty()).unwrap(),
        );
        RequestIdStage.check(&mut ctx, &mut ex).unwrap();
        assert_ne!(ctx.request_id, "bad id;drop");
        assert!(uuid::Uuid::parse_str(&ctx.request_id).is_ok());
        assert_eq!(ex.parts.headers.get(X_REQUEST_ID).unwrap(), ctx.request_id.as_str());
    }

    #[test]
    fn allowlisted_client_is_audited() {
        let config = CoreConfig {
            ip_allowlist: vec!["203.0.113.0/24".into()],
            ..CoreConfig::default()
        };
        let clock = Arc::new(ManualClock::new());
        let limiter = Arc::new(
            RateLimiter::new(&config, Arc::new(MemoryRateStore::new()), clock).unwrap(),
        );
        let sink = Arc::new(CollectingSink::new());
        let stage = RateLimitStage::new(limiter, sink.clone());

        let (mut ctx, mut ex) = exchange(Request::get("/a").body(Body::empty()).unwrap());
        stage.check(&mut ctx, &mut ex).unwrap();
        assert!(ctx.bypassed);
        assert_eq!(sink.tags(), vec![AuditTag::AllowlistBypass]);
    }

    #[test]
    fn select_without_backends_is_no_upstream() {
        let pool = Arc::new(BackendPool::new(
            Default::default(),
            Arc::new(CollectingSink::new()),
        ));
        let stage = SelectStage::new(pool);
        let (mut ctx, mut ex) = exchange(Request::get("/a").body(Body::empty()).unwrap());
        assert_eq!(stage.check(&mut ctx, &mut ex), Err(GatewayError::NoUpstream));
    }
}
