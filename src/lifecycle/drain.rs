//! In-flight request accounting for graceful drain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct InFlightTracker {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request until the guard drops.
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            tracker: self.clone(),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until nothing is in flight, at most `grace`. Returns true when drained.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.idle.notified();
                if self.count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, drained).await.is_ok()
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    tracker: Arc<InFlightTracker>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drains_when_last_guard_drops() {
        let tracker = Arc::new(InFlightTracker::new());
        let guard = tracker.enter();
        let second = tracker.enter();
        assert_eq!(tracker.count(), 2);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle(Duration::from_secs(5)).await })
        };
        drop(guard);
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(second);

        assert!(waiter.await.unwrap());
        assert_eq!(tracker.count(), 0);
    }

    #[tokio::test]
    async fn gives_up_after_grace() {
        let tracker = Arc::new(InFlightTracker::new());
        let _stuck = tracker.enter();
        assert!(!tracker.wait_idle(Duration::from_millis(50)).await);
    }
}
