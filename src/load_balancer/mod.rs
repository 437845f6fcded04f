//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Request admitted → ClientIdentity
//!     → pool.rs (snapshot active backends under the read lock)
//!     → Apply the configured strategy:
//!         - round_robin.rs (rotate through backends)
//!         - weighted.rs (rotate through weight slots)
//!         - least_conn.rs (fewest in-flight dispatches)
//!         - least_time.rs (lowest EWMA latency)
//!         - ip_hash.rs (sticky by client IP)
//!         - random.rs (uniform draw)
//!     → backend.rs (LoadGuard counts the dispatch until dropped)
//! ```
//!
//! # Design Decisions
//! - Strategies are stateless apart from the pool-owned counter and RNG
//! - Inactive backends are excluded before the strategy runs
//! - Ties go to the backend inserted first

pub mod backend;
pub mod ip_hash;
pub mod least_conn;
pub mod least_time;
pub mod pool;
pub mod random;
pub mod round_robin;
pub mod weighted;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use backend::{Backend, BackendError, LoadGuard, Transition};
pub use pool::BackendPool;

/// A backend selection algorithm.
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    /// Pick one of `backends` (all active, in insertion order).
    fn next_server(&self, backends: &[Arc<Backend>], client_ip: IpAddr) -> Option<Arc<Backend>>;
}

/// The configured selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    LeastResponseTime,
    IpHash,
    Random,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::WeightedRoundRobin => "weighted_round_robin",
            Strategy::LeastConnections => "least_connections",
            Strategy::LeastResponseTime => "least_response_time",
            Strategy::IpHash => "ip_hash",
            Strategy::Random => "random",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "round_robin" => Ok(Strategy::RoundRobin),
            "weighted_round_robin" => Ok(Strategy::WeightedRoundRobin),
            "least_connections" => Ok(Strategy::LeastConnections),
            "least_response_time" => Ok(Strategy::LeastResponseTime),
            "ip_hash" => Ok(Strategy::IpHash),
            "random" => Ok(Strategy::Random),
            other => Err(format!("unknown strategy '{}'", other)),
        }
    }
}
