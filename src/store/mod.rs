//! Shared state for admission control.
//!
//! # Data Flow
//! ```text
//! rate limiter
//!     → RateStore::take_token   (get-and-refill a token bucket)
//!     → RateStore::reserve_slot (sliding connection ledger)
//!     → RateStore::sweep        (evict idle identities)
//!
//! access control
//!     → TtlMap (dynamic IP blocks with expiry)
//! ```
//!
//! # Design Decisions
//! - Both store operations are atomic per key; implementations pick how
//! - Callers pass `now` explicitly so a single clock reading drives a decision
//! - The in-memory store shards by key (one lock per shard)

pub mod clock;
pub mod memory;
pub mod ttl;

use std::time::{Duration, Instant};

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::MemoryRateStore;
pub use ttl::TtlMap;

/// Token bucket parameters for one identity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketPolicy {
    /// Refill rate in tokens per second.
    pub rate_per_sec: f64,
    /// Burst capacity (also the initial token count).
    pub burst: f64,
    /// Buckets untouched for this long are treated as new.
    pub idle_ttl: Duration,
}

/// Sliding-window ledger parameters for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerPolicy {
    pub window: Duration,
    pub max_per_window: usize,
}

/// Outcome of a get-and-refill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokenDecision {
    Allowed { remaining: f64 },
    Denied { retry_after: Duration },
}

impl TokenDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, TokenDecision::Allowed { .. })
    }
}

/// Outcome of a slot reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDecision {
    Reserved { in_window: usize },
    Full { retry_after: Duration },
}

impl SlotDecision {
    pub fn is_reserved(&self) -> bool {
        matches!(self, SlotDecision::Reserved { .. })
    }
}

/// Backing store for rate-limit counters.
///
/// Any implementation (in-process, external cache) must make each call atomic
/// with respect to other calls for the same key.
pub trait RateStore: Send + Sync + std::fmt::Debug {
    /// Refill the bucket for `key` up to `now` and try to take one token.
    fn take_token(&self, key: &str, policy: &BucketPolicy, now: Instant) -> TokenDecision;

    /// Trim the ledger for `key` to the window ending at `now` and try to append `now`.
    fn reserve_slot(&self, key: &str, policy: &LedgerPolicy, now: Instant) -> SlotDecision;

    /// Remove identities untouched for longer than `idle`. Returns how many were removed.
    fn sweep(&self, now: Instant, idle: Duration) -> usize;

    /// Number of identities currently tracked.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
