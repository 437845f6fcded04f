//! Backend pool management.
//!
//! # Responsibilities
//! - Own the registered backends in insertion order
//! - Apply the configured strategy to the active subset
//! - Hand out load guards for in-flight accounting
//! - Apply probe results and report state transitions
//!
//! # Design Decisions
//! - Readers (select) take the read lock; add/remove, health transitions
//!   and strategy changes take the write lock
//! - One counter and one RNG per pool, shared by the strategies that need them

use std::net::IpAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::CoreConfig;
use crate::load_balancer::{
    backend::{canonical_url, parse_base_url, Backend, BackendError, LoadGuard, Transition},
    ip_hash::IpHash,
    least_conn::LeastConnections,
    least_time::LeastResponseTime,
    random::Random,
    round_robin::RoundRobin,
    weighted::WeightedRoundRobin,
    LoadBalancer, Strategy,
};
use crate::observability::audit::{AuditEvent, AuditSink, AuditTag, Verdict};
use crate::observability::metrics;
use crate::security::headers::ClientIdentity;

#[derive(Debug)]
struct PoolState {
    backends: Vec<Arc<Backend>>,
    strategy: Strategy,
    balancer: Box<dyn LoadBalancer>,
}

/// The set of upstream replicas and the strategy that picks among them.
pub struct BackendPool {
    state: RwLock<PoolState>,
    counter: Arc<AtomicU64>,
    rng: Arc<Mutex<StdRng>>,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for BackendPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("BackendPool")
            .field("strategy", &state.strategy)
            .field("backends", &state.backends.len())
            .finish()
    }
}

impl BackendPool {
    /// Create an empty pool with an RNG seeded from the current time.
    pub fn new(strategy: Strategy, audit: Arc<dyn AuditSink>) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self::with_seed(strategy, seed, audit)
    }

    /// Create an empty pool with a fixed RNG seed.
    pub fn with_seed(strategy: Strategy, seed: u64, audit: Arc<dyn AuditSink>) -> Self {
        let counter = Arc::new(AtomicU64::new(0));
        let rng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed)));
        let balancer = build_balancer(strategy, &counter, &rng);
        Self {
            state: RwLock::new(PoolState {
                backends: Vec::new(),
                strategy,
                balancer,
            }),
            counter,
            rng,
            audit,
        }
    }

    /// Create a pool with the configured strategy and seed backends.
    pub fn from_config(config: &CoreConfig, audit: Arc<dyn AuditSink>) -> Result<Self, BackendError> {
        let pool = Self::new(config.strategy, audit);
        for backend in &config.backends {
            pool.add_backend(&backend.url, backend.weight)?;
        }
        Ok(pool)
    }

    /// Register a backend. It starts active.
    pub fn add_backend(&self, url: &str, weight: u32) -> Result<Arc<Backend>, BackendError> {
        let base_url = parse_base_url(url)?;
        let key = canonical_url(&base_url);

        let backend = {
            let mut state = self.state.write();
            if state.backends.iter().any(|b| b.url() == key) {
                return Err(BackendError::Duplicate(key));
            }
            let backend = Arc::new(Backend::new(base_url, weight));
            state.backends.push(backend.clone());
            backend
        };

        tracing::info!(backend = %key, weight, "Backend added");
        metrics::record_backend_health(&key, true);
        self.audit.emit(
            AuditEvent::new(AuditTag::BackendAdded, Verdict::Allow).reason(format!("{} weight={}", key, weight)),
        );
        Ok(backend)
    }

    /// Unregister a backend. In-flight dispatches finish normally.
    pub fn remove_backend(&self, url: &str) -> Result<Arc<Backend>, BackendError> {
        let key = parse_base_url(url)
            .map(|u| canonical_url(&u))
            .unwrap_or_else(|_| url.trim().trim_end_matches('/').to_string());

        let removed = {
            let mut state = self.state.write();
            let index = state
                .backends
                .iter()
                .position(|b| b.url() == key)
                .ok_or_else(|| BackendError::NotFound(key.clone()))?;
            state.backends.remove(index)
        };

        tracing::info!(backend = %key, "Backend removed");
        self.audit
            .emit(AuditEvent::new(AuditTag::BackendRemoved, Verdict::Deny).reason(key));
        Ok(removed)
    }

    /// Pick an active backend for `client`, or `None` when none is active.
    pub fn select(&self, client: &ClientIdentity) -> Option<Arc<Backend>> {
        self.select_where(client.ip, |_| true)
    }

    /// Like [`BackendPool::select`] but never returns `exclude`.
    pub fn select_excluding(&self, client: &ClientIdentity, exclude: &Arc<Backend>) -> Option<Arc<Backend>> {
        self.select_where(client.ip, |b| !Arc::ptr_eq(b, exclude))
    }

    fn select_where<F>(&self, client_ip: IpAddr, keep: F) -> Option<Arc<Backend>>
    where
        F: Fn(&Arc<Backend>) -> bool,
    {
        let state = self.state.read();
        let active: Vec<Arc<Backend>> = state
            .backends
            .iter()
            .filter(|b| b.is_active() && keep(b))
            .cloned()
            .collect();
        state.balancer.next_server(&active, client_ip)
    }

    /// Swap the strategy. Returns the previous one.
    pub fn set_strategy(&self, strategy: Strategy) -> Strategy {
        let previous = {
            let mut state = self.state.write();
            let previous = state.strategy;
            if previous != strategy {
                state.balancer = build_balancer(strategy, &self.counter, &self.rng);
                state.strategy = strategy;
            }
            previous
        };

        if previous != strategy {
            tracing::info!(from = %previous, to = %strategy, "Load balancing strategy changed");
            self.audit.emit(
                AuditEvent::new(AuditTag::StrategyChanged, Verdict::Allow)
                    .reason(format!("{} -> {}", previous, strategy)),
            );
        }
        previous
    }

    pub fn strategy(&self) -> Strategy {
        self.state.read().strategy
    }

    /// All registered backends in insertion order.
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.state.read().backends.clone()
    }

    pub fn active_count(&self) -> usize {
        self.state.read().backends.iter().filter(|b| b.is_active()).count()
    }

    pub fn len(&self) -> usize {
        self.state.read().backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count a dispatch to `backend` as in flight.
    pub fn note_dispatch_start(&self, backend: &Arc<Backend>) -> LoadGuard {
        backend.acquire()
    }

    /// Finish a dispatch: fold its end-to-end time into the EWMA and release the load.
    pub fn note_dispatch_end(&self, guard: LoadGuard, latency: Duration) {
        guard.record_latency(latency);
        drop(guard);
    }

    /// Apply one probe outcome under the write lock.
    pub fn record_probe(
        &self,
        backend: &Arc<Backend>,
        ok: bool,
        latency: Option<Duration>,
        threshold: u32,
        now: Instant,
    ) -> Transition {
        let transition = {
            let _state = self.state.write();
            if let Some(latency) = latency {
                backend.record_latency(latency);
            }
            if ok {
                backend.mark_success(now)
            } else {
                backend.mark_failure(threshold, now)
            }
        };

        match transition {
            Transition::Activated => {
                tracing::info!(backend = %backend.url(), "Backend back in rotation");
                metrics::record_backend_health(backend.url(), true);
                self.audit.emit(
                    AuditEvent::new(AuditTag::BackendActivated, Verdict::Allow)
                        .reason(backend.url().to_string()),
                );
            }
            Transition::Deactivated => {
                tracing::warn!(
                    backend = %backend.url(),
                    failures = backend.failures(),
                    "Backend taken out of rotation"
                );
                metrics::record_backend_health(backend.url(), false);
                self.audit.emit(
                    AuditEvent::new(AuditTag::BackendDeactivated, Verdict::Deny)
                        .reason(backend.url().to_string()),
                );
            }
            Transition::Unchanged => {}
        }
        transition
    }
}

fn build_balancer(
    strategy: Strategy,
    counter: &Arc<AtomicU64>,
    rng: &Arc<Mutex<StdRng>>,
) -> Box<dyn LoadBalancer> {
    match strategy {
        Strategy::RoundRobin => Box::new(RoundRobin::new(counter.clone())),
        Strategy::WeightedRoundRobin => Box::new(WeightedRoundRobin::new(counter.clone())),
        Strategy::LeastConnections => Box::new(LeastConnections::new()),
        Strategy::LeastResponseTime => Box::new(LeastResponseTime::new()),
        Strategy::IpHash => Box::new(IpHash::new()),
        Strategy::Random => Box::new(Random::new(rng.clone())),
    }
}
