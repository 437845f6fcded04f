//! Time sources.
//!
//! Everything time-dependent in the core (token buckets, connection ledgers,
//! token expiry, probe bookkeeping) reads time through [`Clock`] so tests can
//! drive it deterministically with [`ManualClock`].

use std::fmt::Debug;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// A monotonic time source plus a wall-clock reading for token expiry.
pub trait Clock: Send + Sync + Debug {
    /// Monotonic instant.
    fn now(&self) -> Instant;

    /// Seconds since the Unix epoch.
    fn unix_now(&self) -> u64;
}

/// The process clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// A clock that only moves when told to.
///
/// Both readings advance together, so a test can expire a token and refill a
/// bucket with the same call.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    unix_origin: u64,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(1_700_000_000)
    }

    /// Create a clock whose wall reading starts at `unix_secs`.
    pub fn starting_at(unix_secs: u64) -> Self {
        Self {
            origin: Instant::now(),
            unix_origin: unix_secs,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Time elapsed since construction.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }

    fn unix_now(&self) -> u64 {
        self.unix_origin + self.offset.lock().as_secs()
    }
}
