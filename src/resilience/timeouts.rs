//! Timeout enforcement.
//!
//! # Responsibilities
//! - Derive the per-request deadline from the client hint and the configured cap
//! - Hand out the time left for each upstream step
//!
//! # Design Decisions
//! - The client may shorten the deadline, never extend it
//! - Timed-out requests return 504 Gateway Timeout

use std::time::{Duration, Instant};

use axum::http::HeaderMap;

pub const X_REQUEST_TIMEOUT: &str = "x-request-timeout";

/// Client-supplied deadline, in decimal seconds.
pub fn client_deadline(headers: &HeaderMap) -> Option<Duration> {
    let secs: f64 = headers
        .get(X_REQUEST_TIMEOUT)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    if !secs.is_finite() || secs <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

/// Total time budget for one request.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    /// `min(client, cap)`; the cap alone when the client sent nothing usable.
    pub fn new(started: Instant, client: Option<Duration>, cap: Duration) -> Self {
        let budget = client.map_or(cap, |c| c.min(cap));
        Self { started, budget }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Time left, further capped by a per-step limit.
    pub fn capped(&self, step: Duration) -> Duration {
        self.remaining().min(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn client_can_only_shorten() {
        let now = Instant::now();
        let cap = Duration::from_secs(30);
        assert_eq!(Deadline::new(now, Some(Duration::from_secs(5)), cap).budget(), Duration::from_secs(5));
        assert_eq!(Deadline::new(now, Some(Duration::from_secs(90)), cap).budget(), cap);
        assert_eq!(Deadline::new(now, None, cap).budget(), cap);
    }

    #[test]
    fn parses_decimal_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(X_REQUEST_TIMEOUT, HeaderValue::from_static("1.5"));
        assert_eq!(client_deadline(&headers), Some(Duration::from_millis(1500)));

        for bad in ["-1", "0", "soon", "NaN"] {
            headers.insert(X_REQUEST_TIMEOUT, HeaderValue::from_static(bad));
            assert_eq!(client_deadline(&headers), None, "{bad}");
        }
    }

    #[test]
    fn capped_never_exceeds_remaining() {
        let deadline = Deadline::new(Instant::now(), None, Duration::from_millis(100));
        assert!(deadline.capped(Duration::from_secs(10)) <= Duration::from_millis(100));
        assert_eq!(deadline.capped(Duration::ZERO), Duration::ZERO);
        assert!(!deadline.expired());
    }
}
