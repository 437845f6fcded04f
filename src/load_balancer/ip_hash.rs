//! IP-hash load balancing strategy.

use std::net::IpAddr;
use std::sync::Arc;

use crate::load_balancer::{backend::Backend, LoadBalancer};

/// Sticky selection by client IP.
///
/// The same client lands on the same backend as long as the active set is
/// stable.
#[derive(Debug, Default)]
pub struct IpHash;

impl IpHash {
    pub fn new() -> Self {
        Self
    }
}

/// `h = 31·h + c` over the textual IP, with wrapping 64-bit arithmetic.
pub fn hash_ip(ip: &IpAddr) -> i64 {
    ip.to_string()
        .bytes()
        .fold(0i64, |h, c| h.wrapping_mul(31).wrapping_add(c as i64))
}

impl LoadBalancer for IpHash {
    fn next_server(&self, backends: &[Arc<Backend>], client_ip: IpAddr) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }
        let index = (hash_ip(&client_ip).unsigned_abs() % backends.len() as u64) as usize;
        Some(backends[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends(n: u16) -> Vec<Arc<Backend>> {
        (0..n)
            .map(|i| Arc::new(Backend::parse(&format!("http://127.0.0.1:{}", 9000 + i), 1).unwrap()))
            .collect()
    }

    #[test]
    fn hash_matches_polynomial() {
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let expected = "1.2.3.4"
            .bytes()
            .fold(0i64, |h, c| 31 * h + c as i64);
        assert_eq!(hash_ip(&ip), expected);
    }

    #[test]
    fn same_client_same_backend() {
        let lb = IpHash::new();
        let backends = backends(4);
        let client: IpAddr = "203.0.113.77".parse().unwrap();
        let first = lb.next_server(&backends, client).unwrap();
        for _ in 0..10 {
            assert_eq!(lb.next_server(&backends, client).unwrap().url(), first.url());
        }
    }

    #[test]
    fn long_ipv6_hash_wraps_without_panic() {
        let lb = IpHash::new();
        let client: IpAddr = "2001:db8:ffff:ffff:ffff:ffff:ffff:ffff".parse().unwrap();
        assert!(lb.next_server(&backends(3), client).is_some());
    }
}
