//! Audit events.
//!
//! Every admission decision and every backend state change produces one
//! [`AuditEvent`] delivered to an injected [`AuditSink`]. The core never
//! stores events itself.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;

use crate::security::headers::{log_safe, ClientIdentity};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditTag {
    RequestRejected,
    RequestForwarded,
    AllowlistBypass,
    ClientCancelled,
    InternalFault,
    BackendActivated,
    BackendDeactivated,
    BackendAdded,
    BackendRemoved,
    StrategyChanged,
    ConfigReloaded,
}

impl AuditTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditTag::RequestRejected => "REQUEST_REJECTED",
            AuditTag::RequestForwarded => "REQUEST_FORWARDED",
            AuditTag::AllowlistBypass => "ALLOWLIST_BYPASS",
            AuditTag::ClientCancelled => "CLIENT_CANCELLED",
            AuditTag::InternalFault => "INTERNAL_FAULT",
            AuditTag::BackendActivated => "BACKEND_ACTIVATED",
            AuditTag::BackendDeactivated => "BACKEND_DEACTIVATED",
            AuditTag::BackendAdded => "BACKEND_ADDED",
            AuditTag::BackendRemoved => "BACKEND_REMOVED",
            AuditTag::StrategyChanged => "STRATEGY_CHANGED",
            AuditTag::ConfigReloaded => "CONFIG_RELOADED",
        }
    }
}

impl fmt::Display for AuditTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
    Forward,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Deny => "deny",
            Verdict::Forward => "forward",
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub tag: AuditTag,
    pub verdict: Verdict,
    pub request_id: Option<String>,
    pub client: Option<ClientIdentity>,
    pub principal: Option<String>,
    pub path: Option<String>,
    pub reason: Option<String>,
    /// Control bytes removed from headers/query, already escaped.
    pub stripped: Vec<String>,
    pub elapsed: Option<Duration>,
}

impl AuditEvent {
    pub fn new(tag: AuditTag, verdict: Verdict) -> Self {
        Self {
            tag,
            verdict,
            request_id: None,
            client: None,
            principal: None,
            path: None,
            reason: None,
            stripped: Vec::new(),
            elapsed: None,
        }
    }

    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn client(mut self, client: ClientIdentity) -> Self {
        self.principal = client.principal.clone();
        self.client = Some(client);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn stripped(mut self, stripped: Vec<String>) -> Self {
        self.stripped = stripped;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }
}

/// Receiver of audit events.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Writes events as structured `tracing` events on target `audit`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        let client = event
            .client
            .as_ref()
            .map(|c| c.ip.to_string())
            .unwrap_or_default();
        let principal = event.principal.as_deref().map(log_safe).unwrap_or_default();
        let path = event.path.as_deref().map(log_safe).unwrap_or_default();
        let reason = event.reason.as_deref().map(log_safe).unwrap_or_default();
        let request_id = event.request_id.as_deref().map(log_safe).unwrap_or_default();
        let stripped = event
            .stripped
            .iter()
            .map(|s| log_safe(s))
            .collect::<Vec<_>>()
            .join(",");
        let elapsed_ms = event.elapsed.map(|d| d.as_millis() as u64).unwrap_or(0);

        match event.verdict {
            Verdict::Deny => tracing::warn!(
                target: "audit",
                tag = %event.tag,
                verdict = event.verdict.as_str(),
                %request_id,
                %client,
                %principal,
                %path,
                %reason,
                %stripped,
                elapsed_ms
            ),
            _ => tracing::info!(
                target: "audit",
                tag = %event.tag,
                verdict = event.verdict.as_str(),
                %request_id,
                %client,
                %principal,
                %path,
                %reason,
                %stripped,
                elapsed_ms
            ),
        }
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn tags(&self) -> Vec<AuditTag> {
        self.events.lock().iter().map(|e| e.tag).collect()
    }

    pub fn take(&self) -> Vec<AuditEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl AuditSink for CollectingSink {
    fn emit(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn client_carries_principal() {
        let event = AuditEvent::new(AuditTag::RequestForwarded, Verdict::Forward).client(
            ClientIdentity {
                ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                principal: Some("alice".to_string()),
            },
        );
        assert_eq!(event.principal.as_deref(), Some("alice"));
    }

    #[test]
    fn collecting_sink_keeps_order() {
        let sink = CollectingSink::new();
        sink.emit(AuditEvent::new(AuditTag::BackendDeactivated, Verdict::Deny));
        sink.emit(AuditEvent::new(AuditTag::BackendActivated, Verdict::Allow));
        assert_eq!(
            sink.tags(),
            vec![AuditTag::BackendDeactivated, AuditTag::BackendActivated]
        );
        assert_eq!(sink.take().len(), 2);
        assert!(sink.events().is_empty());
    }
}
