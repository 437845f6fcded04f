//! Least Response Time load balancing strategy.

use std::net::IpAddr;
use std::sync::Arc;

use crate::load_balancer::{backend::Backend, LoadBalancer};

/// Selects the backend with the lowest EWMA latency.
#[derive(Debug, Default)]
pub struct LeastResponseTime;

impl LeastResponseTime {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastResponseTime {
    fn next_server(&self, backends: &[Arc<Backend>], _client_ip: IpAddr) -> Option<Arc<Backend>> {
        let mut best: Option<&Arc<Backend>> = None;
        for backend in backends {
            match best {
                Some(current) if current.latency_ms() <= backend.latency_ms() => {}
                _ => best = Some(backend),
            }
        }
        best.cloned()
    }
}
