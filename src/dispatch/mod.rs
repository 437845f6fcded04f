//! Upstream dispatch.
//!
//! # Data Flow
//! ```text
//! admitted exchange + selected backend
//!     → (optional) buffer body for replay
//!     → upstream.rs (rewrite URI, forwarding headers)
//!     → hyper client, bounded by the request deadline
//!     → connect failure? retry once on another backend
//!     → body.rs (stream response, settle load + latency at end)
//! ```
//!
//! # Design Decisions
//! - Bodies stream both ways; only replayable requests are buffered
//! - The load slot is a guard, so every exit path releases it
//! - A tripped body limit wins over the transport error it caused

pub mod body;
pub mod upstream;

use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::response::Response;
use futures_util::future::BoxFuture;
use futures_util::{future, stream, FutureExt, StreamExt};
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::config::UpstreamConfig;
use crate::error::GatewayError;
use crate::load_balancer::BackendPool;
use crate::observability::{AuditEvent, AuditSink, AuditTag, Verdict};
use crate::pipeline::context::{Exchange, RequestContext};
use crate::pipeline::stages::Forward;
use crate::resilience::RetryPolicy;

use self::body::{CancelNotice, MeteredStream};
use self::upstream::{build_request, clean_response};

pub type UpstreamClient = Client<HttpConnector, Body>;

/// Build the shared upstream client with the configured connect timeout.
pub fn build_client(config: &UpstreamConfig) -> UpstreamClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(config.connect_timeout()));
    connector.set_nodelay(true);
    Client::builder(TokioExecutor::new()).build(connector)
}

/// Why one upstream attempt failed.
#[derive(Debug)]
enum AttemptError {
    /// The backend never received the request.
    Connect(String),
    TimedOut,
    Transport(String),
}

pub struct Dispatcher {
    client: UpstreamClient,
    pool: Arc<BackendPool>,
    audit: Arc<dyn AuditSink>,
    config: UpstreamConfig,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(config: &UpstreamConfig, pool: Arc<BackendPool>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            client: build_client(config),
            pool,
            audit,
            config: config.clone(),
            retry: RetryPolicy::from_config(config),
        }
    }

    async fn dispatch(&self, ctx: &RequestContext, exchange: Exchange) -> Result<Response, GatewayError> {
        let mut target = ctx.backend.clone().ok_or(GatewayError::NoUpstream)?;
        let Exchange { parts, body } = exchange;

        let (mut body, replay) = if self.retry.eligible(&parts) {
            match buffer_for_replay(body, self.retry.buffer_limit()).await {
                Ok(Replay::Whole(bytes)) => (Body::from(bytes.clone()), Some(bytes)),
                Ok(Replay::Overflow(body)) => {
                    tracing::debug!(request_id = %ctx.request_id, "Body exceeds replay buffer, retry disabled");
                    (body, None)
                }
                Err(_) => {
                    return Err(match ctx.trip.tripped() {
                        Some(rejection) => GatewayError::Malformed(rejection),
                        None => GatewayError::ClientCancelled,
                    })
                }
            }
        } else {
            (body, None)
        };

        let mut retried = false;
        loop {
            let started = Instant::now();
            let guard = self.pool.note_dispatch_start(&target);
            let request = build_request(&parts, ctx, &target, body)?;

            match self.send(ctx, request).await {
                Ok(mut response) => {
                    clean_response(&mut response, &ctx.request_id);
                    let (head, upstream) = response.into_parts();
                    let notice = CancelNotice {
                        audit: self.audit.clone(),
                        event: AuditEvent::new(AuditTag::ClientCancelled, Verdict::Deny)
                            .request_id(ctx.request_id.clone())
                            .client(ctx.identity.clone())
                            .path(ctx.path.clone())
                            .reason("response body abandoned"),
                    };
                    let stream = MeteredStream::new(upstream, guard, self.pool.clone(), started, notice);
                    return Ok(Response::from_parts(head, stream.into_body()));
                }
                Err(AttemptError::Connect(error)) => {
                    drop(guard);
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        backend = %target.url(),
                        error = %error,
                        "Upstream connect failed"
                    );
                    let next = match (&replay, retried) {
                        (Some(bytes), false) => self
                            .pool
                            .select_excluding(&ctx.identity, &target)
                            .map(|next| (next, bytes.clone())),
                        _ => None,
                    };
                    let Some((next, bytes)) = next else {
                        return Err(GatewayError::UpstreamUnreachable);
                    };
                    tracing::info!(
                        request_id = %ctx.request_id,
                        backend = %next.url(),
                        "Retrying on another backend"
                    );
                    retried = true;
                    target = next;
                    body = Body::from(bytes);
                }
                Err(AttemptError::TimedOut) => {
                    tracing::warn!(request_id = %ctx.request_id, backend = %target.url(), "Upstream timed out");
                    return Err(GatewayError::UpstreamTimeout);
                }
                Err(AttemptError::Transport(error)) => {
                    if let Some(rejection) = ctx.trip.tripped() {
                        return Err(GatewayError::Malformed(rejection));
                    }
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        backend = %target.url(),
                        error = %error,
                        "Upstream request failed"
                    );
                    return Err(GatewayError::UpstreamUnreachable);
                }
            }
        }
    }

    /// One attempt, bounded by the request deadline and the read timeout.
    async fn send(
        &self,
        ctx: &RequestContext,
        request: axum::http::Request<Body>,
    ) -> Result<Response, AttemptError> {
        let budget = ctx.deadline.capped(self.config.read_timeout());
        if budget.is_zero() {
            return Err(AttemptError::TimedOut);
        }
        match tokio::time::timeout(budget, self.client.request(request)).await {
            Err(_) => Err(AttemptError::TimedOut),
            Ok(Err(e)) if e.is_connect() => Err(AttemptError::Connect(e.to_string())),
            Ok(Err(e)) => Err(AttemptError::Transport(e.to_string())),
            Ok(Ok(response)) => Ok(response.map(Body::new)),
        }
    }
}

/// A request body read ahead for a possible retry.
enum Replay {
    /// The whole body fit in the buffer.
    Whole(Bytes),
    /// The body outgrew the buffer: what was read, followed by the rest.
    Overflow(Body),
}

/// Buffer `body` up to `limit` bytes. A body without a declared length (HTTP/2,
/// or HTTP/1 with neither header) may still be larger; it then streams on
/// without replay instead of failing.
async fn buffer_for_replay(mut body: Body, limit: usize) -> Result<Replay, axum::Error> {
    let mut buffered: Vec<u8> = Vec::new();
    while let Some(frame) = body.frame().await {
        let Ok(data) = frame?.into_data() else {
            continue;
        };
        buffered.extend_from_slice(&data);
        if buffered.len() > limit {
            let head = stream::once(future::ready(Ok::<_, axum::Error>(Bytes::from(buffered))));
            return Ok(Replay::Overflow(Body::from_stream(head.chain(body.into_data_stream()))));
        }
    }
    Ok(Replay::Whole(Bytes::from(buffered)))
}

impl Forward for Dispatcher {
    fn forward<'a>(
        &'a self,
        ctx: &'a RequestContext,
        exchange: Exchange,
    ) -> BoxFuture<'a, Result<Response, GatewayError>> {
        self.dispatch(ctx, exchange).boxed()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pool", &self.pool)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked(chunks: &[&'static str]) -> Body {
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            chunks.iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))).collect();
        Body::from_stream(stream::iter(chunks))
    }

    #[tokio::test]
    async fn small_unsized_body_is_buffered_whole() {
        match buffer_for_replay(chunked(&["ab", "cd"]), 16).await.unwrap() {
            Replay::Whole(bytes) => assert_eq!(&bytes[..], b"abcd"),
            Replay::Overflow(_) => panic!("expected a whole body"),
        }
    }

    #[tokio::test]
    async fn oversized_unsized_body_streams_on_intact() {
        let replay = buffer_for_replay(chunked(&["abcd", "efgh", "ij"]), 6).await.unwrap();
        let Replay::Overflow(body) = replay else {
            panic!("expected overflow");
        };
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"abcdefghij");
    }
}
