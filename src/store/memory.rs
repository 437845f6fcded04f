//! In-process rate-limit store.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::store::{BucketPolicy, LedgerPolicy, RateStore, SlotDecision, TokenDecision};

/// Float slack so that exact refills (0.1s × 10/s) never land just under one token.
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl Bucket {
    fn full(policy: &BucketPolicy, now: Instant) -> Self {
        Self {
            tokens: policy.burst,
            last_refill: now,
            last_seen: now,
        }
    }
}

#[derive(Debug, Clone)]
struct Ledger {
    arrivals: VecDeque<Instant>,
    last_seen: Instant,
}

/// Sharded in-memory implementation of [`RateStore`].
///
/// `DashMap::entry` holds the shard's write lock for the duration of the
/// refill computation, so two callers for one identity are serialized.
#[derive(Debug, Default)]
pub struct MemoryRateStore {
    buckets: DashMap<String, Bucket>,
    ledgers: DashMap<String, Ledger>,
}

impl MemoryRateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current token count for `key`, if tracked.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        self.buckets.get(key).map(|b| b.tokens)
    }

    /// Current ledger length for `key`, if tracked.
    pub fn ledger_len(&self, key: &str) -> Option<usize> {
        self.ledgers.get(key).map(|l| l.arrivals.len())
    }
}

impl RateStore for MemoryRateStore {
    fn take_token(&self, key: &str, policy: &BucketPolicy, now: Instant) -> TokenDecision {
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::full(policy, now));

        // Lazy eviction: an idle bucket behaves like a brand-new one.
        if now.saturating_duration_since(bucket.last_seen) > policy.idle_ttl {
            *bucket = Bucket::full(policy, now);
        }
        bucket.last_seen = now;

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        let refilled = elapsed > 0.0;
        bucket.tokens = (bucket.tokens + elapsed * policy.rate_per_sec).min(policy.burst);

        if bucket.tokens + TOKEN_EPSILON >= 1.0 {
            bucket.tokens = (bucket.tokens - 1.0).max(0.0);
            bucket.last_refill = now;
            TokenDecision::Allowed {
                remaining: bucket.tokens,
            }
        } else {
            if refilled {
                bucket.last_refill = now;
            }
            let deficit = 1.0 - bucket.tokens;
            let secs = if policy.rate_per_sec > 0.0 {
                (deficit / policy.rate_per_sec).ceil().max(1.0)
            } else {
                policy.idle_ttl.as_secs_f64().max(1.0)
            };
            TokenDecision::Denied {
                retry_after: Duration::from_secs_f64(secs),
            }
        }
    }

    fn reserve_slot(&self, key: &str, policy: &LedgerPolicy, now: Instant) -> SlotDecision {
        let mut ledger = self.ledgers.entry(key.to_string()).or_insert_with(|| Ledger {
            arrivals: VecDeque::with_capacity(policy.max_per_window.min(64)),
            last_seen: now,
        });
        ledger.last_seen = now;

        while let Some(front) = ledger.arrivals.front() {
            if now.saturating_duration_since(*front) > policy.window {
                ledger.arrivals.pop_front();
            } else {
                break;
            }
        }

        if ledger.arrivals.len() >= policy.max_per_window {
            let oldest_age = ledger
                .arrivals
                .front()
                .map(|t| now.saturating_duration_since(*t))
                .unwrap_or_default();
            let wait = policy.window.saturating_sub(oldest_age);
            return SlotDecision::Full {
                retry_after: wait.max(Duration::from_secs(1)),
            };
        }

        ledger.arrivals.push_back(now);
        SlotDecision::Reserved {
            in_window: ledger.arrivals.len(),
        }
    }

    fn sweep(&self, now: Instant, idle: Duration) -> usize {
        // Counted per removal: keys may arrive while the shards are walked.
        let mut evicted = 0;
        self.buckets.retain(|_, b| {
            let keep = now.saturating_duration_since(b.last_seen) <= idle;
            evicted += usize::from(!keep);
            keep
        });
        self.ledgers.retain(|_, l| {
            let keep = now.saturating_duration_since(l.last_seen) <= idle;
            evicted += usize::from(!keep);
            keep
        });
        evicted
    }

    fn len(&self) -> usize {
        self.buckets.len().max(self.ledgers.len())
    }
}
