//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to backend:
//!     → timeouts.rs (total deadline, connect and read caps)
//!     → On connect failure: retries.rs (eligible for one retry on another backend?)
//! ```
//!
//! # Design Decisions
//! - Every upstream call has a deadline
//! - At most one retry, only after a connect failure, only for replayable requests

pub mod retries;
pub mod timeouts;

pub use retries::RetryPolicy;
pub use timeouts::Deadline;
