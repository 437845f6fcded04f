//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Periodic timer
//!     → Probe every backend concurrently (base_url + health.path)
//!     → HealthResult (state.rs)
//!     → BackendPool::record_probe (EWMA, failure count, transitions)
//!
//! State machine (per backend):
//!     active ←→ inactive
//!     active → inactive on the Nth consecutive failure (default 3)
//!     inactive → active on any success
//! ```
//!
//! # Design Decisions
//! - Backends start active (assume good until disproved)
//! - Probe errors never surface as responses; they only mutate backend state
//! - Settings are re-read every cycle so a reload takes effect without restart

pub mod active;
pub mod state;

pub use active::HealthMonitor;
pub use state::{HealthResult, ProbeOutcome};
