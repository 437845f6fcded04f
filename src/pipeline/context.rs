//! Per-request state carried through the stages.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::request::Parts;

use crate::load_balancer::Backend;
use crate::resilience::Deadline;
use crate::security::headers::ClientIdentity;
use crate::security::limits::LimitTrip;
use crate::security::token::Principal;

#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    /// Socket peer, after IPv4-mapped normalization.
    pub peer: IpAddr,
    pub identity: ClientIdentity,
    pub principal: Option<Principal>,
    /// `http` or `https`, as reported by a trusted proxy.
    pub proto: &'static str,
    pub path: String,
    pub started: Instant,
    pub deadline: Deadline,
    /// Escaped control bytes removed by the sanitizer.
    pub stripped: Vec<String>,
    pub trip: LimitTrip,
    /// Set by the allow-list bypass.
    pub bypassed: bool,
    pub backend: Option<Arc<Backend>>,
}

impl RequestContext {
    pub fn new(peer: IpAddr, client_ip: IpAddr, proto: &'static str, path: String, deadline: Deadline) -> Self {
        Self {
            request_id: String::new(),
            peer,
            identity: ClientIdentity::anonymous(client_ip),
            principal: None,
            proto,
            path,
            started: deadline.started(),
            deadline,
            stripped: Vec::new(),
            trip: LimitTrip::default(),
            bypassed: false,
            backend: None,
        }
    }
}

/// The request as it moves through the pipeline.
#[derive(Debug)]
pub struct Exchange {
    pub parts: Parts,
    pub body: Body,
}

impl Exchange {
    pub fn new(parts: Parts, body: Body) -> Self {
        Self { parts, body }
    }
}
