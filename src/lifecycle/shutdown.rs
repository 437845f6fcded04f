//! Shutdown coordination.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

/// Broadcasts the shutdown signal to every long-running task.
#[derive(Debug)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    triggered: AtomicBool,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            triggered: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Signal every subscriber. Returns false if shutdown was already under way.
    pub fn trigger(&self) -> bool {
        if self.triggered.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(());
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Number of tasks still listening.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve once `rx` fires or its sender is gone.
pub async fn wait(mut rx: broadcast::Receiver<()>) {
    let _ = rx.recv().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_one_trigger() {
        let shutdown = Shutdown::new();
        let mut a = shutdown.subscribe();
        let b = shutdown.subscribe();
        assert_eq!(shutdown.receiver_count(), 2);

        assert!(shutdown.trigger());
        assert!(!shutdown.trigger());
        assert!(shutdown.is_triggered());

        assert!(a.recv().await.is_ok());
        wait(b).await;
    }
}
