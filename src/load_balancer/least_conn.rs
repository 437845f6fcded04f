//! Least Connections load balancing strategy.

use std::net::IpAddr;
use std::sync::Arc;

use crate::load_balancer::{backend::Backend, LoadBalancer};

/// Least connections selector.
/// Selects the backend with the fewest in-flight dispatches.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn next_server(&self, backends: &[Arc<Backend>], _client_ip: IpAddr) -> Option<Arc<Backend>> {
        // min_by_key keeps the first minimum, so ties go to insertion order
        backends.iter().min_by_key(|b| b.load()).cloned()
    }
}
