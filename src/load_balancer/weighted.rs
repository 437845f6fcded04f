//! Weighted round-robin load balancing strategy.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::load_balancer::{backend::Backend, LoadBalancer};

/// Maps the shared counter onto weight slots.
///
/// With weights A=1, B=2, C=1 the slots are `A B B C`, so the sequence
/// repeats with period 4. All-zero weights fall back to plain rotation.
#[derive(Debug)]
pub struct WeightedRoundRobin {
    counter: Arc<AtomicU64>,
}

impl WeightedRoundRobin {
    pub fn new(counter: Arc<AtomicU64>) -> Self {
        Self { counter }
    }
}

impl LoadBalancer for WeightedRoundRobin {
    fn next_server(&self, backends: &[Arc<Backend>], _client_ip: IpAddr) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }

        let ticket = self.counter.fetch_add(1, Ordering::Relaxed);
        let total: u64 = backends.iter().map(|b| b.weight() as u64).sum();
        if total == 0 {
            let index = (ticket % backends.len() as u64) as usize;
            return Some(backends[index].clone());
        }

        let slot = ticket % total;
        let mut cumulative = 0u64;
        for backend in backends {
            cumulative += backend.weight() as u64;
            if slot < cumulative {
                return Some(backend.clone());
            }
        }
        backends.last().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn backend(port: u16, weight: u32) -> Arc<Backend> {
        Arc::new(Backend::parse(&format!("http://127.0.0.1:{}", port), weight).unwrap())
    }

    #[test]
    fn sequence_follows_weights() {
        let lb = WeightedRoundRobin::new(Arc::new(AtomicU64::new(0)));
        let backends = vec![backend(1, 1), backend(2, 2), backend(3, 1)];
        let client = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let picks: Vec<u16> = (0..20)
            .map(|_| {
                lb.next_server(&backends, client)
                    .unwrap()
                    .base_url()
                    .port()
                    .unwrap()
            })
            .collect();

        assert_eq!(&picks[..8], &[1, 2, 2, 3, 1, 2, 2, 3]);
        assert_eq!(picks.iter().filter(|p| **p == 1).count(), 5);
        assert_eq!(picks.iter().filter(|p| **p == 2).count(), 10);
        assert_eq!(picks.iter().filter(|p| **p == 3).count(), 5);
    }

    #[test]
    fn zero_weights_fall_back_to_rotation() {
        let lb = WeightedRoundRobin::new(Arc::new(AtomicU64::new(0)));
        let backends = vec![backend(1, 0), backend(2, 0)];
        let client = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert_eq!(lb.next_server(&backends, client).unwrap().base_url().port(), Some(1));
        assert_eq!(lb.next_server(&backends, client).unwrap().base_url().port(), Some(2));
    }

    #[test]
    fn zero_weight_backend_is_skipped() {
        let lb = WeightedRoundRobin::new(Arc::new(AtomicU64::new(0)));
        let backends = vec![backend(1, 0), backend(2, 3)];
        let client = IpAddr::V4(Ipv4Addr::LOCALHOST);
        for _ in 0..6 {
            assert_eq!(lb.next_server(&backends, client).unwrap().base_url().port(), Some(2));
        }
    }
}
