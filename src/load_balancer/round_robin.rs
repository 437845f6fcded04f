//! Round-robin load balancing strategy.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::load_balancer::{backend::Backend, LoadBalancer};

/// Round-robin selector.
/// Rotates through the active set using the pool's shared counter.
#[derive(Debug)]
pub struct RoundRobin {
    counter: Arc<AtomicU64>,
}

impl RoundRobin {
    pub fn new(counter: Arc<AtomicU64>) -> Self {
        Self { counter }
    }
}

impl LoadBalancer for RoundRobin {
    fn next_server(&self, backends: &[Arc<Backend>], _client_ip: IpAddr) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }
        let ticket = self.counter.fetch_add(1, Ordering::Relaxed);
        let index = (ticket % backends.len() as u64) as usize;
        Some(backends[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    fn backends(n: u16) -> Vec<Arc<Backend>> {
        (0..n)
            .map(|i| Arc::new(Backend::parse(&format!("http://127.0.0.1:{}", 8080 + i), 1).unwrap()))
            .collect()
    }

    #[test]
    fn test_round_robin() {
        let lb = RoundRobin::new(Arc::new(AtomicU64::new(0)));
        let backends = backends(2);
        let client = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let s1 = lb.next_server(&backends, client).unwrap();
        assert_eq!(s1.url(), backends[0].url());

        let s2 = lb.next_server(&backends, client).unwrap();
        assert_eq!(s2.url(), backends[1].url());

        let s3 = lb.next_server(&backends, client).unwrap();
        assert_eq!(s3.url(), backends[0].url());
    }

    #[test]
    fn fair_within_one_under_contention() {
        let lb = Arc::new(RoundRobin::new(Arc::new(AtomicU64::new(0))));
        let backends = Arc::new(backends(3));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lb = lb.clone();
                let backends = backends.clone();
                std::thread::spawn(move || {
                    (0..250)
                        .map(|_| {
                            lb.next_server(&backends, IpAddr::V4(Ipv4Addr::LOCALHOST))
                                .unwrap()
                                .url()
                                .to_string()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for handle in handles {
            for url in handle.join().unwrap() {
                *counts.entry(url).or_default() += 1;
            }
        }
        let max = counts.values().max().copied().unwrap();
        let min = counts.values().min().copied().unwrap();
        assert!(max - min <= 1, "counts: {:?}", counts);
    }

    #[test]
    fn empty_set_yields_none() {
        let lb = RoundRobin::new(Arc::new(AtomicU64::new(0)));
        assert!(lb.next_server(&[], IpAddr::V4(Ipv4Addr::LOCALHOST)).is_none());
    }
}
