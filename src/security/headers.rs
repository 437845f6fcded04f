//! Header trust and hygiene.
//!
//! # Responsibilities
//! - Resolve the client IP, believing forwarding headers only from trusted proxies
//! - Strip hop-by-hop headers and headers a client could use to impersonate the gateway
//! - Escape request-derived values before they reach a log line
//!
//! # Design Decisions
//! - The socket peer is authoritative unless it is a configured trusted proxy
//! - For X-Forwarded-For the right-most untrusted hop is the client
//! - Never trust existing X-Forwarded-* / X-Auth-* from clients

use std::fmt;
use std::net::IpAddr;

use axum::http::header::CONNECTION;
use axum::http::{HeaderMap, HeaderName};

use crate::security::access_control::IpMatcher;

/// Headers meaningful only for a single transport hop.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers the gateway sets itself; inbound copies are discarded.
pub const GATEWAY_OWNED: &[&str] = &[
    "x-forwarded-for",
    "x-forwarded-proto",
    "x-forwarded-host",
    "x-real-ip",
    "forwarded",
    "x-auth-subject",
    "x-auth-roles",
];

pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_AUTH_SUBJECT: &str = "x-auth-subject";
pub const X_AUTH_ROLES: &str = "x-auth-roles";

const MAX_LOG_VALUE: usize = 512;

/// Key for per-client admission state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    pub ip: IpAddr,
    pub principal: Option<String>,
}

impl ClientIdentity {
    pub fn anonymous(ip: IpAddr) -> Self {
        Self {
            ip: normalize_ip(ip),
            principal: None,
        }
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// The rate-limit key: the IP, plus the principal when authenticated.
    pub fn rate_key(&self) -> String {
        match &self.principal {
            Some(p) => format!("{}|{}", self.ip, p),
            None => self.ip.to_string(),
        }
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.principal {
            Some(p) => write!(f, "{} ({})", self.ip, log_safe(p)),
            None => write!(f, "{}", self.ip),
        }
    }
}

/// Collapse IPv4-mapped IPv6 addresses to IPv4.
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Works out which address a request really came from.
#[derive(Debug, Clone, Default)]
pub struct ClientIpResolver {
    trusted: IpMatcher,
    headers: Vec<HeaderName>,
}

impl ClientIpResolver {
    /// Header names that fail to parse are skipped (validation reports them).
    pub fn new<S: AsRef<str>>(trusted: IpMatcher, headers: &[S]) -> Self {
        let headers = headers
            .iter()
            .filter_map(|h| HeaderName::from_bytes(h.as_ref().trim().as_bytes()).ok())
            .collect();
        Self { trusted, headers }
    }

    /// Whether forwarding headers from `peer` are believed.
    pub fn is_trusted(&self, peer: IpAddr) -> bool {
        self.trusted.contains(normalize_ip(peer))
    }

    pub fn resolve(&self, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
        let peer = normalize_ip(peer);
        if !self.trusted.contains(peer) {
            return peer;
        }

        for name in &self.headers {
            if name.as_str() == "x-forwarded-for" {
                let hops: Vec<&str> = headers
                    .get_all(name)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .flat_map(|v| v.split(','))
                    .collect();
                for hop in hops.iter().rev() {
                    match parse_hop(hop) {
                        Some(ip) if !self.trusted.contains(ip) => return ip,
                        Some(_) => continue,
                        None => break,
                    }
                }
            } else if let Some(ip) = headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_hop)
            {
                return ip;
            }
        }

        peer
    }
}

fn parse_hop(value: &str) -> Option<IpAddr> {
    let value = value.trim();
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(normalize_ip(ip));
    }
    value
        .parse::<std::net::SocketAddr>()
        .ok()
        .map(|addr| normalize_ip(addr.ip()))
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Remove forwarding and identity headers a client may have forged.
pub fn strip_gateway_owned(headers: &mut HeaderMap) {
    for name in GATEWAY_OWNED {
        headers.remove(*name);
    }
}

/// Escape a request-derived value for logging.
///
/// Control characters never survive: CR, LF and TAB become `\r`, `\n`, `\t`,
/// others become `\xNN`. Quotes and backslashes are escaped so the escaped form
/// cannot be mistaken for a real escape. Long values are truncated.
pub fn log_safe(value: &str) -> String {
    let mut out = String::with_capacity(value.len().min(MAX_LOG_VALUE) + 8);
    for (count, c) in value.chars().enumerate() {
        if count >= MAX_LOG_VALUE {
            out.push_str("...");
            break;
        }
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}
