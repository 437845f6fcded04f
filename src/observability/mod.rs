//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms)
//!     → audit.rs (admission and backend-state events to an injected sink)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//!     → Audit sink (tracing target "audit", or an embedder's own sink)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows through all subsystems
//! - Metrics are cheap (atomic increments)
//! - Request-derived values are escaped before they reach a log field

pub mod audit;
pub mod logging;
pub mod metrics;

pub use audit::{AuditEvent, AuditSink, AuditTag, CollectingSink, TracingAuditSink, Verdict};
