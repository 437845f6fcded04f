//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe backends
//! - Update backend health state based on results

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::http::Request;
use futures_util::future::join_all;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::CoreConfig;
use crate::health::state::{HealthResult, ProbeOutcome};
use crate::load_balancer::{Backend, BackendPool};
use crate::store::Clock;

pub struct HealthMonitor {
    pool: Arc<BackendPool>,
    config: Arc<ArcSwap<CoreConfig>>,
    client: Client<HttpConnector, Body>,
    clock: Arc<dyn Clock>,
}

impl HealthMonitor {
    pub fn new(pool: Arc<BackendPool>, config: Arc<ArcSwap<CoreConfig>>, clock: Arc<dyn Clock>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.load().health.timeout()));
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            pool,
            config,
            client,
            clock,
        }
    }

    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        {
            let config = self.config.load();
            tracing::info!(
                enabled = config.health.enabled,
                interval_secs = config.health.interval_secs,
                path = %config.health.path,
                "Health monitor starting"
            );
        }

        // Fixed-rate ticks: probe time must not stretch the cycle, or a
        // backend that times out is only marked down after N·(interval + timeout).
        let mut period = self.period();
        let mut ticker = Self::ticker(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.config.load().health.enabled {
                        self.check_all().await;
                    }
                    let next = self.period();
                    if next != period {
                        tracing::info!(interval_ms = next.as_millis() as u64, "Health check interval changed");
                        period = next;
                        ticker = Self::ticker(period);
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    fn period(&self) -> Duration {
        self.config.load().health.interval().max(Duration::from_millis(10))
    }

    fn ticker(period: Duration) -> time::Interval {
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        ticker
    }

    /// Probe every registered backend once, concurrently, and apply the results.
    pub async fn check_all(&self) -> Vec<HealthResult> {
        let config = self.config.load_full();
        let backends = self.pool.backends();

        let results = join_all(backends.iter().map(|backend| {
            self.probe(backend, &config.health.path, config.health.timeout())
        }))
        .await;

        for (backend, result) in backends.iter().zip(&results) {
            self.pool.record_probe(
                backend,
                result.outcome.is_ok(),
                result.latency,
                config.health.unhealthy_threshold,
                self.clock.now(),
            );
        }
        results
    }

    /// Issue one GET to `base_url + path`.
    pub async fn probe(&self, backend: &Arc<Backend>, path: &str, timeout: Duration) -> HealthResult {
        let mut result = HealthResult {
            backend: backend.url().to_string(),
            outcome: ProbeOutcome::Unreachable,
            latency: None,
            status: None,
        };

        let uri = match backend.upstream_uri(path) {
            Ok(uri) => uri,
            Err(e) => {
                tracing::error!(backend = %backend.url(), error = %e, "Failed to build health check URI");
                return result;
            }
        };
        let request = match Request::builder()
            .method("GET")
            .uri(uri)
            .header("user-agent", "front-door-health-check")
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(e) => {
                tracing::error!("Failed to build health check request: {}", e);
                return result;
            }
        };

        let started = Instant::now();
        match time::timeout(timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                result.latency = Some(started.elapsed());
                result.status = Some(response.status().as_u16());
                if response.status().is_success() {
                    result.outcome = ProbeOutcome::Ok;
                } else {
                    tracing::warn!(
                        backend = %backend.url(),
                        status = %response.status(),
                        "Health check failed: non-success status"
                    );
                    result.outcome = ProbeOutcome::BadStatus;
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(backend = %backend.url(), error = %e, "Health check failed: connection error");
            }
            Err(_) => {
                tracing::warn!(backend = %backend.url(), "Health check failed: timeout");
                result.outcome = ProbeOutcome::TimedOut;
            }
        }
        result
    }
}
