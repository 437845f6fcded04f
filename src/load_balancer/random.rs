//! Random load balancing strategy.

use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;

use crate::load_balancer::{backend::Backend, LoadBalancer};

/// Uniform draw from the pool's own RNG.
#[derive(Debug)]
pub struct Random {
    rng: Arc<Mutex<StdRng>>,
}

impl Random {
    pub fn new(rng: Arc<Mutex<StdRng>>) -> Self {
        Self { rng }
    }
}

impl LoadBalancer for Random {
    fn next_server(&self, backends: &[Arc<Backend>], _client_ip: IpAddr) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }
        let index = self.rng.lock().gen_range(0..backends.len());
        Some(backends[index].clone())
    }
}
