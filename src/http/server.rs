//! HTTP server setup.
//!
//! # Responsibilities
//! - Create the Axum router: reserved paths plus the forwarding fallback
//! - Bound concurrent requests to `listener.max_connections`
//! - Serve with graceful shutdown bounded by `shutdown.grace_secs`

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::Request;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tower_http::trace::TraceLayer;

use crate::http::request::resolve_request_id;
use crate::http::response::{health_response, metrics_response};
use crate::lifecycle::InFlightTracker;
use crate::pipeline::Gateway;
use crate::security::headers::normalize_ip;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub tracker: Arc<InFlightTracker>,
    pub metrics: Option<PrometheusHandle>,
    slots: Arc<Semaphore>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, metrics: Option<PrometheusHandle>) -> Self {
        let max = gateway.config().listener.max_connections.max(1);
        Self {
            gateway,
            tracker: Arc::new(InFlightTracker::new()),
            metrics,
            slots: Arc::new(Semaphore::new(max)),
        }
    }
}

/// Build the Axum router with all middleware layers.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// The public listener.
pub struct HttpServer {
    state: AppState,
}

impl HttpServer {
    pub fn new(gateway: Arc<Gateway>, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            state: AppState::new(gateway, metrics),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Serve until `shutdown` fires, then drain for at most the grace period.
    pub async fn run(
        self,
        listener: TcpListener,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        let grace = self.state.gateway.config().shutdown.grace();
        let tracker = self.state.tracker.clone();
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();

        // Two subscribers: one stops accepting, one starts the grace clock.
        let mut deadline_rx = shutdown.resubscribe();
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(crate::lifecycle::shutdown::wait(shutdown))
            .into_future();

        tokio::select! {
            result = serve => result?,
            _ = async {
                let _ = deadline_rx.recv().await;
                if !tracker.wait_idle(grace).await {
                    tracing::warn!(in_flight = tracker.count(), "Grace period elapsed with requests in flight");
                }
                // Let connections that finished their last request close.
                tokio::time::sleep(grace.min(Duration::from_millis(250))).await;
            } => {
                tracing::warn!("Forcing shutdown after grace period");
            }
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn health_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let request_id = resolve_request_id(request.headers());
    health_response(&state.gateway, &request_id)
}

async fn metrics_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let request_id = resolve_request_id(request.headers());
    let stages = state.gateway.stages();
    let client = stages.resolver().resolve(normalize_ip(peer.ip()), request.headers());
    let enabled = stages.config().observability.metrics_enabled;
    let handle = state.metrics.as_ref().filter(|_| enabled);
    metrics_response(handle, stages.metrics_allowed(client), &request_id)
}

/// Everything that is not a reserved path goes through the pipeline.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let _in_flight = state.tracker.enter();
    // Closed only at shutdown, when nothing new is accepted anyway.
    let _slot = state.slots.acquire().await.ok();
    state.gateway.handle(peer, request).await
}
