//! IP-based access control.
//!
//! # Responsibilities
//! - Parse IP and CIDR lists from configuration
//! - Static block-list plus dynamic blocks with expiry
//! - Restrict operational endpoints (`/metrics`) to known callers
//!
//! # Design Decisions
//! - Bare addresses are treated as host networks (/32 or /128)
//! - IPv4-mapped IPv6 peers match IPv4 entries
//! - Allow-listed IPs are never blocked

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use parking_lot::RwLock;
use thiserror::Error;

use crate::security::headers::normalize_ip;
use crate::store::{Clock, TtlMap};

/// An IP/CIDR list entry that does not parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{0}' is not an IP address or CIDR")]
pub struct AddressError(pub String);

/// A set of networks that an address can be tested against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpMatcher {
    nets: Vec<IpNet>,
}

impl IpMatcher {
    /// Parse IPs and CIDRs. The error names the first bad entry.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, AddressError> {
        let mut nets = Vec::with_capacity(entries.len());
        for entry in entries {
            nets.push(parse_net(entry.as_ref())?);
        }
        Ok(Self { nets })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = normalize_ip(ip);
        self.nets.iter().any(|net| net.contains(&ip))
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn insert(&mut self, net: IpNet) -> bool {
        if self.nets.contains(&net) {
            return false;
        }
        self.nets.push(net);
        true
    }

    pub fn remove(&mut self, net: &IpNet) -> bool {
        let before = self.nets.len();
        self.nets.retain(|n| n != net);
        before != self.nets.len()
    }

    pub fn entries(&self) -> Vec<String> {
        self.nets.iter().map(|n| n.to_string()).collect()
    }
}

/// Parse "10.0.0.0/8" or a bare address.
pub fn parse_net(entry: &str) -> Result<IpNet, AddressError> {
    let entry = entry.trim();
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    let host = match entry.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => Ipv4Net::new(v4, 32).map(IpNet::V4).ok(),
        Ok(IpAddr::V6(v6)) => Ipv6Net::new(v6, 128).map(IpNet::V6).ok(),
        Err(_) => None,
    };
    host.ok_or_else(|| AddressError(entry.to_string()))
}

/// Static networks plus time-limited dynamic blocks.
#[derive(Debug)]
pub struct BlockList {
    fixed: RwLock<IpMatcher>,
    dynamic: TtlMap<IpAddr, ()>,
    clock: Arc<dyn Clock>,
}

impl BlockList {
    pub fn new(fixed: IpMatcher, clock: Arc<dyn Clock>) -> Self {
        Self {
            fixed: RwLock::new(fixed),
            dynamic: TtlMap::new(),
            clock,
        }
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        let ip = normalize_ip(ip);
        self.fixed.read().contains(ip) || self.dynamic.get(&ip, self.clock.now()).is_some()
    }

    /// Block `ip` until `ttl` elapses. A second block for the same IP extends it.
    pub fn block_for(&self, ip: IpAddr, ttl: Duration) {
        let ip = normalize_ip(ip);
        self.dynamic.insert(ip, (), ttl, self.clock.now());
        tracing::warn!(client_ip = %ip, ttl_secs = ttl.as_secs(), "Client IP blocked");
    }

    pub fn unblock(&self, ip: IpAddr) -> bool {
        self.dynamic.remove(&normalize_ip(ip)).is_some()
    }

    /// Replace the static part (config reload). Dynamic blocks survive.
    pub fn replace_fixed(&self, fixed: IpMatcher) {
        *self.fixed.write() = fixed;
    }

    /// Drop expired dynamic blocks.
    pub fn purge(&self, now: Instant) -> usize {
        self.dynamic.purge(now)
    }

    /// Active dynamic blocks with their remaining time.
    pub fn dynamic_entries(&self) -> Vec<(IpAddr, Duration)> {
        self.dynamic
            .snapshot(self.clock.now())
            .into_iter()
            .map(|(ip, _, ttl)| (ip, ttl))
            .collect()
    }
}
