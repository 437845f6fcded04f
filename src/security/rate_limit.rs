//! Per-client admission control.
//!
//! A token bucket bounds request rate and an optional sliding ledger bounds
//! arrivals per window, both keyed by [`ClientIdentity`]. Blocked IPs are
//! refused before any bucket is touched; allow-listed IPs skip both
//! mechanisms (the caller audits the bypass).

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::CoreConfig;
use crate::observability::metrics;
use crate::security::access_control::{parse_net, AddressError, BlockList, IpMatcher};
use crate::security::headers::ClientIdentity;
use crate::store::{
    BucketPolicy, Clock, LedgerPolicy, RateStore, SlotDecision, TokenDecision,
};

/// A refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Denial {
    #[error("IP_BLOCKED")]
    Blocked,
    #[error("RATE_LIMIT_EXCEEDED")]
    RateLimitExceeded { retry_after: Duration },
    #[error("TOO_MANY_CONNECTIONS")]
    TooManyConnections { retry_after: Duration },
}

impl Denial {
    pub fn as_str(&self) -> &'static str {
        match self {
            Denial::Blocked => "IP_BLOCKED",
            Denial::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Denial::TooManyConnections { .. } => "TOO_MANY_CONNECTIONS",
        }
    }
}

/// A granted admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Allow-listed: neither bucket nor ledger was consulted.
    Bypassed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct LimiterPolicy {
    bucket: Option<BucketPolicy>,
    ledger: Option<LedgerPolicy>,
    idle: Duration,
}

impl LimiterPolicy {
    fn from_config(config: &CoreConfig) -> Self {
        let mut longest = Duration::ZERO;
        if config.rate.enabled {
            longest = longest.max(config.rate.window());
        }
        if config.conn.enabled {
            longest = longest.max(config.conn.window());
        }
        let idle = (longest * 2).max(Duration::from_secs(1));

        let bucket = config.rate.enabled.then(|| BucketPolicy {
            rate_per_sec: config.rate.rate_per_sec(),
            burst: config.rate.burst as f64,
            idle_ttl: idle,
        });
        let ledger = config.conn.enabled.then(|| LedgerPolicy {
            window: config.conn.window(),
            max_per_window: config.conn.max_per_window,
        });

        Self { bucket, ledger, idle }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    store: Arc<dyn RateStore>,
    clock: Arc<dyn Clock>,
    policy: RwLock<LimiterPolicy>,
    allowlist: RwLock<IpMatcher>,
    blocklist: Arc<BlockList>,
}

impl RateLimiter {
    /// Build from a validated config.
    pub fn new(
        config: &CoreConfig,
        store: Arc<dyn RateStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AddressError> {
        let allowlist = IpMatcher::parse(&config.ip_allowlist)?;
        let blocklist = BlockList::new(IpMatcher::parse(&config.ip_blocklist)?, clock.clone());
        Ok(Self {
            store,
            clock,
            policy: RwLock::new(LimiterPolicy::from_config(config)),
            allowlist: RwLock::new(allowlist),
            blocklist: Arc::new(blocklist),
        })
    }

    /// Admit or refuse one request from `identity`.
    pub fn check(&self, identity: &ClientIdentity) -> Result<Admission, Denial> {
        if self.allowlist.read().contains(identity.ip) {
            return Ok(Admission::Bypassed);
        }
        if self.blocklist.is_blocked(identity.ip) {
            return Err(Denial::Blocked);
        }

        let policy = *self.policy.read();
        let key = identity.rate_key();
        let now = self.clock.now();

        // Ledger first: it counts arrivals, so a rate-limited request still
        // occupies a slot, but a request refused by the ledger never spends a token.
        if let Some(ledger) = policy.ledger.as_ref() {
            if let SlotDecision::Full { retry_after } = self.store.reserve_slot(&key, ledger, now) {
                tracing::debug!(client = %identity, "Connection cap reached");
                return Err(Denial::TooManyConnections { retry_after });
            }
        }

        if let Some(bucket) = policy.bucket.as_ref() {
            if let TokenDecision::Denied { retry_after } = self.store.take_token(&key, bucket, now) {
                tracing::debug!(client = %identity, "Rate limit exceeded");
                return Err(Denial::RateLimitExceeded { retry_after });
            }
        }

        Ok(Admission::Admitted)
    }

    /// Apply new limits and lists. Bucket state is kept.
    pub fn reconfigure(&self, config: &CoreConfig) -> Result<(), AddressError> {
        let allowlist = IpMatcher::parse(&config.ip_allowlist)?;
        let fixed_blocks = IpMatcher::parse(&config.ip_blocklist)?;
        *self.policy.write() = LimiterPolicy::from_config(config);
        *self.allowlist.write() = allowlist;
        self.blocklist.replace_fixed(fixed_blocks);
        Ok(())
    }

    pub fn allow(&self, entry: &str) -> Result<bool, AddressError> {
        let net = parse_net(entry)?;
        Ok(self.allowlist.write().insert(net))
    }

    pub fn disallow(&self, entry: &str) -> Result<bool, AddressError> {
        let net = parse_net(entry)?;
        Ok(self.allowlist.write().remove(&net))
    }

    pub fn allowlist(&self) -> Vec<String> {
        self.allowlist.read().entries()
    }

    pub fn is_allowlisted(&self, ip: IpAddr) -> bool {
        self.allowlist.read().contains(ip)
    }

    /// Temporarily block `ip`. Allow-listed IPs cannot be blocked.
    pub fn block(&self, ip: IpAddr, ttl: Duration) -> bool {
        if self.is_allowlisted(ip) {
            return false;
        }
        self.blocklist.block_for(ip, ttl);
        true
    }

    pub fn blocklist(&self) -> &BlockList {
        &self.blocklist
    }

    /// Identities with live rate-limit state.
    pub fn tracked(&self) -> usize {
        self.store.len()
    }

    /// Evict idle identities and expired blocks.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let idle = self.policy.read().idle;
        let evicted = self.store.sweep(now, idle);
        self.blocklist.purge(now);
        metrics::record_rate_limit_buckets(self.store.len());
        evicted
    }

    /// Run [`RateLimiter::sweep`] every `period` until shutdown.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.sweep();
                        if evicted > 0 {
                            tracing::debug!(evicted, "Evicted idle rate-limit state");
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::info!("Rate-limit sweeper stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Sweep period: half the idle horizon.
    pub fn sweep_period(&self) -> Duration {
        self.policy.read().idle / 2
    }
}
