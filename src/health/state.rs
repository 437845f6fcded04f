//! Probe results.
//!
//! # State Transitions
//! ```text
//! active → inactive: consecutive failures >= unhealthy_threshold
//! inactive → active: one successful probe
//! ```

use std::fmt;
use std::time::Duration;

/// How a probe ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// 2xx response.
    Ok,
    /// Non-2xx response.
    BadStatus,
    /// Connection refused, reset, or protocol error.
    Unreachable,
    TimedOut,
}

impl ProbeOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ProbeOutcome::Ok)
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProbeOutcome::Ok => "ok",
            ProbeOutcome::BadStatus => "bad_status",
            ProbeOutcome::Unreachable => "unreachable",
            ProbeOutcome::TimedOut => "timed_out",
        })
    }
}

/// One probe of one backend. Consumed to update the backend, then dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthResult {
    pub backend: String,
    pub outcome: ProbeOutcome,
    /// Time to response headers; `None` when no response arrived.
    pub latency: Option<Duration>,
    pub status: Option<u16>,
}
