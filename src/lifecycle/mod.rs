//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain in-flight (drain.rs) → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!     SIGHUP → Trigger config reload
//! ```
//!
//! # Design Decisions
//! - Background loops subscribe to one broadcast and stop on it
//! - Draining is bounded by `shutdown.grace_secs`; then the process exits anyway

pub mod drain;
pub mod shutdown;
pub mod signals;

pub use drain::{InFlightGuard, InFlightTracker};
pub use shutdown::Shutdown;
