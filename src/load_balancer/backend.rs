//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single upstream replica by its base URL
//! - Track in-flight dispatches (for Least Connections)
//! - Track EWMA latency (for Least Response Time)
//! - Track liveness and consecutive probe failures
//!
//! # Design Decisions
//! - Every counter is an atomic; selection never blocks on a backend
//! - EWMA is stored as f64 bits and updated with a compare-and-swap loop
//! - In-flight load is released by a RAII guard on every exit path

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::Uri;
use parking_lot::Mutex;
use thiserror::Error;
use url::Url;

use crate::observability::metrics;

/// Weight of the previous average in the EWMA.
const EWMA_DECAY: f64 = 0.8;

/// Sentinel meaning "no latency sample yet".
const NO_SAMPLE: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("invalid backend URL '{0}'")]
    InvalidUrl(String),
    #[error("unsupported scheme in '{0}': only http:// is accepted")]
    UnsupportedScheme(String),
    #[error("backend '{0}' is already registered")]
    Duplicate(String),
    #[error("backend '{0}' is not registered")]
    NotFound(String),
}

/// Parse and canonicalize a backend base URL.
pub fn parse_base_url(raw: &str) -> Result<Url, BackendError> {
    let url = Url::parse(raw.trim()).map_err(|_| BackendError::InvalidUrl(raw.to_string()))?;
    if url.scheme() != "http" {
        return Err(BackendError::UnsupportedScheme(raw.to_string()));
    }
    if url.host_str().is_none() || url.query().is_some() || url.fragment().is_some() {
        return Err(BackendError::InvalidUrl(raw.to_string()));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(BackendError::InvalidUrl(raw.to_string()));
    }
    Ok(url)
}

/// Canonical identity of a base URL (no trailing slash).
pub fn canonical_url(url: &Url) -> String {
    url.as_str().trim_end_matches('/').to_string()
}

/// Outcome of a state update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Activated,
    Deactivated,
}

/// A single upstream replica.
#[derive(Debug)]
pub struct Backend {
    base_url: Url,
    key: String,
    weight: u32,
    active: AtomicBool,
    current_load: AtomicUsize,
    latency_ewma: AtomicU64,
    consecutive_failures: AtomicU32,
    last_probe: Mutex<Option<Instant>>,
}

impl Backend {
    /// Create a backend. Backends start active.
    pub fn new(base_url: Url, weight: u32) -> Self {
        let key = canonical_url(&base_url);
        Self {
            base_url,
            key,
            weight,
            active: AtomicBool::new(true),
            current_load: AtomicUsize::new(0),
            latency_ewma: AtomicU64::new(NO_SAMPLE),
            consecutive_failures: AtomicU32::new(0),
            last_probe: Mutex::new(None),
        }
    }

    /// Parse `raw` and create a backend.
    pub fn parse(raw: &str, weight: u32) -> Result<Self, BackendError> {
        Ok(Self::new(parse_base_url(raw)?, weight))
    }

    pub fn url(&self) -> &str {
        &self.key
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn load(&self) -> usize {
        self.current_load.load(Ordering::Acquire)
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn last_probe(&self) -> Option<Instant> {
        *self.last_probe.lock()
    }

    /// EWMA latency in milliseconds; 0 before the first sample.
    pub fn latency_ms(&self) -> f64 {
        match self.latency_ewma.load(Ordering::Acquire) {
            NO_SAMPLE => 0.0,
            bits => f64::from_bits(bits),
        }
    }

    /// Fold a latency sample into the EWMA. The first sample initializes it.
    pub fn record_latency(&self, sample: Duration) {
        let sample_ms = sample.as_micros() as f64 / 1000.0;
        let mut current = self.latency_ewma.load(Ordering::Acquire);
        loop {
            let next = if current == NO_SAMPLE {
                sample_ms
            } else {
                EWMA_DECAY * f64::from_bits(current) + (1.0 - EWMA_DECAY) * sample_ms
            };
            match self.latency_ewma.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        metrics::record_backend_latency(&self.key, self.latency_ms());
    }

    /// A probe succeeded: clear failures and reactivate.
    pub fn mark_success(&self, now: Instant) -> Transition {
        *self.last_probe.lock() = Some(now);
        self.consecutive_failures.store(0, Ordering::Release);
        if self.active.swap(true, Ordering::AcqRel) {
            Transition::Unchanged
        } else {
            Transition::Activated
        }
    }

    /// A probe failed: deactivate once `threshold` consecutive failures accumulate.
    pub fn mark_failure(&self, threshold: u32, now: Instant) -> Transition {
        *self.last_probe.lock() = Some(now);
        let failures = self
            .consecutive_failures
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        if failures >= threshold && self.active.swap(false, Ordering::AcqRel) {
            Transition::Deactivated
        } else {
            Transition::Unchanged
        }
    }

    /// Count a dispatch as in flight until the guard is dropped.
    pub fn acquire(self: &Arc<Self>) -> LoadGuard {
        let load = self.current_load.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::record_backend_load(&self.key, load);
        LoadGuard {
            backend: self.clone(),
        }
    }

    fn release(&self) {
        let previous = self
            .current_load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        metrics::record_backend_load(&self.key, previous.saturating_sub(1));
    }

    /// Absolute upstream URI for an inbound path and query.
    pub fn upstream_uri(&self, path_and_query: &str) -> Result<Uri, BackendError> {
        let base_path = self.base_url.path().trim_end_matches('/');
        let authority = match self.base_url.port() {
            Some(port) => format!("{}:{}", self.base_url.host_str().unwrap_or_default(), port),
            None => self.base_url.host_str().unwrap_or_default().to_string(),
        };
        format!("http://{}{}{}", authority, base_path, path_and_query)
            .parse()
            .map_err(|_| BackendError::InvalidUrl(self.key.clone()))
    }
}

/// A RAII guard for one in-flight dispatch.
#[derive(Debug)]
pub struct LoadGuard {
    backend: Arc<Backend>,
}

impl LoadGuard {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl std::ops::Deref for LoadGuard {
    type Target = Backend;
    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.backend.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> Arc<Backend> {
        Arc::new(Backend::parse("http://127.0.0.1:9000/", 1).unwrap())
    }

    #[test]
    fn only_plain_http_urls() {
        assert!(matches!(
            Backend::parse("https://example.com", 1),
            Err(BackendError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            Backend::parse("not a url", 1),
            Err(BackendError::InvalidUrl(_))
        ));
        assert!(matches!(
            Backend::parse("http://example.com/?q=1", 1),
            Err(BackendError::InvalidUrl(_))
        ));
        assert_eq!(backend().url(), "http://127.0.0.1:9000");
    }

    #[test]
    fn ewma_first_sample_then_decay() {
        let b = backend();
        assert_eq!(b.latency_ms(), 0.0);
        b.record_latency(Duration::from_millis(100));
        assert_eq!(b.latency_ms(), 100.0);
        b.record_latency(Duration::from_millis(200));
        assert!((b.latency_ms() - 120.0).abs() < 1e-9);
    }

    #[test]
    fn third_failure_deactivates_and_success_restores() {
        let b = backend();
        let now = Instant::now();
        assert_eq!(b.mark_failure(3, now), Transition::Unchanged);
        assert_eq!(b.mark_failure(3, now), Transition::Unchanged);
        assert_eq!(b.mark_failure(3, now), Transition::Deactivated);
        assert!(!b.is_active());
        assert_eq!(b.mark_failure(3, now), Transition::Unchanged);
        assert_eq!(b.failures(), 4);

        assert_eq!(b.mark_success(now), Transition::Activated);
        assert!(b.is_active());
        assert_eq!(b.failures(), 0);
        assert_eq!(b.mark_success(now), Transition::Unchanged);
    }

    #[test]
    fn guard_releases_load_once() {
        let b = backend();
        let g1 = b.acquire();
        let g2 = b.acquire();
        assert_eq!(b.load(), 2);
        drop(g1);
        assert_eq!(b.load(), 1);
        drop(g2);
        assert_eq!(b.load(), 0);
    }

    #[test]
    fn upstream_uri_keeps_base_path() {
        let b = Backend::parse("http://10.0.0.5:8080/api/", 1).unwrap();
        assert_eq!(
            b.upstream_uri("/v1/users?id=7").unwrap().to_string(),
            "http://10.0.0.5:8080/api/v1/users?id=7"
        );
    }
}
