//! Pipeline orchestrator.
//!
//! # Data Flow
//! ```text
//! request
//!     → snapshot the stage set (one read per request)
//!     → request_id → sanitize → validate → rate_limit → select   (Check)
//!     → dispatch                                                 (Forward)
//!     → response | GatewayError → JSON error + audit event
//! ```
//!
//! # Design Decisions
//! - The orchestrator is the single place panics are caught
//! - Stages are rebuilt on reload; limiter state and backends are shared
//!   across stage sets and survive
//! - Checks are synchronous, so a client can only cancel during dispatch

pub mod context;
pub mod stages;

use std::any::Any;
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::http::{HeaderMap, Request};
use axum::response::Response;
use futures_util::FutureExt;
use thiserror::Error;

use crate::config::{validate_config, ConfigError, CoreConfig};
use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::load_balancer::{BackendError, BackendPool};
use crate::observability::{metrics, AuditEvent, AuditSink, AuditTag, Verdict};
use crate::resilience::timeouts::{client_deadline, Deadline};
use crate::security::access_control::{AddressError, IpMatcher};
use crate::security::headers::{log_safe, normalize_ip, ClientIpResolver};
use crate::security::rate_limit::RateLimiter;
use crate::security::sanitize::Sanitizer;
use crate::security::token::{TokenConfigError, TokenValidator};
use crate::store::{Clock, MemoryRateStore, SystemClock};

use self::context::{Exchange, RequestContext};
use self::stages::{
    Check, Forward, RateLimitStage, RequestIdStage, SanitizeStage, SelectStage, ValidateStage,
};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid configuration: {0}")]
    Invalid(#[from] ConfigError),

    #[error("token validator: {0}")]
    Token(#[from] TokenConfigError),

    #[error("seed backend: {0}")]
    Backend(#[from] BackendError),

    #[error("address list: {0}")]
    AddressList(#[from] AddressError),
}

/// Everything derived from one config generation.
pub struct StageSet {
    config: Arc<CoreConfig>,
    resolver: ClientIpResolver,
    metrics_allowed: IpMatcher,
    checks: Vec<Box<dyn Check>>,
    forward: Arc<dyn Forward>,
}

impl StageSet {
    fn build(
        config: Arc<CoreConfig>,
        pool: &Arc<BackendPool>,
        limiter: &Arc<RateLimiter>,
        clock: &Arc<dyn Clock>,
        audit: &Arc<dyn AuditSink>,
    ) -> Result<Self, BuildError> {
        let trusted = IpMatcher::parse(&config.trusted_proxies)?;
        let resolver = ClientIpResolver::new(trusted, &config.trusted_client_ip_headers);
        let metrics_allowed = IpMatcher::parse(&config.observability.metrics_allowed)?;

        let validator = if config.token.enabled {
            Some(TokenValidator::from_config(&config.token, clock.clone())?)
        } else {
            None
        };

        let checks: Vec<Box<dyn Check>> = vec![
            Box::new(RequestIdStage),
            Box::new(SanitizeStage::new(Sanitizer::new(config.limits.clone()))),
            Box::new(ValidateStage::new(validator)),
            Box::new(RateLimitStage::new(limiter.clone(), audit.clone())),
            Box::new(SelectStage::new(pool.clone())),
        ];
        let forward: Arc<dyn Forward> =
            Arc::new(Dispatcher::new(&config.upstream, pool.clone(), audit.clone()));

        Ok(Self {
            config,
            resolver,
            metrics_allowed,
            checks,
            forward,
        })
    }

    pub fn config(&self) -> &Arc<CoreConfig> {
        &self.config
    }

    pub fn resolver(&self) -> &ClientIpResolver {
        &self.resolver
    }

    /// Whether `ip` may scrape `/metrics`.
    pub fn metrics_allowed(&self, ip: IpAddr) -> bool {
        self.metrics_allowed.contains(ip)
    }
}

/// The gateway core: shared state plus the current stage set.
pub struct Gateway {
    config: Arc<ArcSwap<CoreConfig>>,
    stages: ArcSwap<StageSet>,
    pool: Arc<BackendPool>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl Gateway {
    pub fn new(config: CoreConfig, audit: Arc<dyn AuditSink>) -> Result<Self, BuildError> {
        Self::with_clock(config, Arc::new(SystemClock), audit)
    }

    pub fn with_clock(
        config: CoreConfig,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, BuildError> {
        let pool = Arc::new(BackendPool::from_config(&config, audit.clone())?);
        let limiter = Arc::new(RateLimiter::new(&config, Arc::new(MemoryRateStore::new()), clock.clone())?);
        let config = Arc::new(config);
        let stages = StageSet::build(config.clone(), &pool, &limiter, &clock, &audit)?;

        if !config.token.enabled {
            tracing::warn!("Token validation is disabled; requests are forwarded unauthenticated");
        }

        Ok(Self {
            config: Arc::new(ArcSwap::new(config)),
            stages: ArcSwap::from_pointee(stages),
            pool,
            limiter,
            clock,
            audit,
        })
    }

    /// Current config generation.
    pub fn config(&self) -> Arc<CoreConfig> {
        self.config.load_full()
    }

    /// The swappable config, shared with background tasks.
    pub fn config_handle(&self) -> Arc<ArcSwap<CoreConfig>> {
        self.config.clone()
    }

    pub fn stages(&self) -> Arc<StageSet> {
        self.stages.load_full()
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Publish a new config. On error the running generation is untouched.
    pub fn reload(&self, config: CoreConfig) -> Result<(), BuildError> {
        validate_config(&config).map_err(|e| BuildError::Invalid(ConfigError::Validation(e)))?;

        let config = Arc::new(config);
        let stages = StageSet::build(config.clone(), &self.pool, &self.limiter, &self.clock, &self.audit)?;
        self.limiter.reconfigure(&config)?;
        self.pool.set_strategy(config.strategy);

        self.config.store(config);
        self.stages.store(Arc::new(stages));

        tracing::info!("Configuration reloaded");
        self.audit
            .emit(AuditEvent::new(AuditTag::ConfigReloaded, Verdict::Allow));
        Ok(())
    }

    /// Run one request through the pipeline.
    pub async fn handle(&self, peer: SocketAddr, request: Request<Body>) -> Response {
        let stages = self.stages.load_full();
        let (parts, body) = request.into_parts();

        let peer_ip = normalize_ip(peer.ip());
        let client_ip = stages.resolver.resolve(peer_ip, &parts.headers);
        let proto = forwarded_proto(&stages.resolver, peer_ip, &parts.headers);
        let deadline = Deadline::new(
            Instant::now(),
            client_deadline(&parts.headers),
            stages.config.upstream.request_timeout(),
        );
        let mut ctx = RequestContext::new(peer_ip, client_ip, proto, parts.uri.path().to_string(), deadline);
        let mut exchange = Exchange::new(parts, body);

        let checked = std::panic::catch_unwind(AssertUnwindSafe(|| {
            for check in &stages.checks {
                check
                    .check(&mut ctx, &mut exchange)
                    .map_err(|err| (check.name(), err))?;
            }
            Ok::<(), (&'static str, GatewayError)>(())
        }));
        match checked {
            Ok(Ok(())) => {}
            Ok(Err((stage, err))) => return self.reject(&ctx, stage, err),
            Err(payload) => return self.fault(&ctx, payload),
        }

        let mut watch = CancelWatch::new(self.audit.clone(), &ctx);
        let forwarded = AssertUnwindSafe(stages.forward.forward(&ctx, exchange))
            .catch_unwind()
            .await;
        watch.disarm();

        match forwarded {
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                metrics::record_request("FORWARDED", status, ctx.started);
                let backend = ctx.backend.as_ref().map(|b| b.url().to_string()).unwrap_or_default();
                tracing::debug!(
                    request_id = %ctx.request_id,
                    client_ip = %ctx.identity.ip,
                    backend = %backend,
                    status,
                    "Request forwarded"
                );
                self.audit.emit(
                    self.event(&ctx, AuditTag::RequestForwarded, Verdict::Forward)
                        .reason(backend),
                );
                response
            }
            Ok(Err(err)) => self.reject(&ctx, "dispatch", err),
            Err(payload) => self.fault(&ctx, payload),
        }
    }

    fn event(&self, ctx: &RequestContext, tag: AuditTag, verdict: Verdict) -> AuditEvent {
        AuditEvent::new(tag, verdict)
            .request_id(ctx.request_id.clone())
            .client(ctx.identity.clone())
            .path(ctx.path.clone())
            .stripped(ctx.stripped.clone())
            .elapsed(ctx.started.elapsed())
    }

    fn reject(&self, ctx: &RequestContext, stage: &'static str, err: GatewayError) -> Response {
        let reason = err.reason().unwrap_or(err.code());
        metrics::record_rejection(stage, reason);
        metrics::record_request(err.code(), err.status().as_u16(), ctx.started);

        let tag = match err {
            GatewayError::ClientCancelled => AuditTag::ClientCancelled,
            GatewayError::Internal => AuditTag::InternalFault,
            _ => AuditTag::RequestRejected,
        };
        self.audit.emit(
            self.event(ctx, tag, Verdict::Deny)
                .reason(format!("{}: {}", err.code(), reason)),
        );
        err.into_response_for(&ctx.request_id)
    }

    fn fault(&self, ctx: &RequestContext, payload: Box<dyn Any + Send>) -> Response {
        let message = panic_message(payload.as_ref());
        tracing::error!(
            request_id = %ctx.request_id,
            panic = %log_safe(&message),
            "Pipeline stage panicked"
        );
        metrics::record_request(GatewayError::Internal.code(), 500, ctx.started);
        self.audit.emit(
            self.event(ctx, AuditTag::InternalFault, Verdict::Deny)
                .reason(format!("panic: {}", message)),
        );
        GatewayError::Internal.into_response_for(&ctx.request_id)
    }
}

/// Emits `CLIENT_CANCELLED` if dropped before the response is ready.
struct CancelWatch {
    pending: Option<(Arc<dyn AuditSink>, AuditEvent, Instant)>,
}

impl CancelWatch {
    fn new(audit: Arc<dyn AuditSink>, ctx: &RequestContext) -> Self {
        let event = AuditEvent::new(AuditTag::ClientCancelled, Verdict::Deny)
            .request_id(ctx.request_id.clone())
            .client(ctx.identity.clone())
            .path(ctx.path.clone())
            .reason("client closed before response");
        Self {
            pending: Some((audit, event, ctx.started)),
        }
    }

    fn disarm(&mut self) {
        self.pending = None;
    }
}

impl Drop for CancelWatch {
    fn drop(&mut self) {
        if let Some((audit, event, started)) = self.pending.take() {
            metrics::record_request(GatewayError::ClientCancelled.code(), 499, started);
            audit.emit(event.elapsed(started.elapsed()));
        }
    }
}

fn forwarded_proto(resolver: &ClientIpResolver, peer: IpAddr, headers: &HeaderMap) -> &'static str {
    let https = resolver.is_trusted(peer)
        && headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().eq_ignore_ascii_case("https"))
            .unwrap_or(false);
    if https {
        "https"
    } else {
        "http"
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
