//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → headers.rs (resolve client IP from trusted proxies only)
//!     → sanitize.rs + limits.rs (size caps, path traversal, control bytes)
//!     → token.rs (bearer token → Principal)
//!     → rate_limit.rs + access_control.rs (block-list, bucket, ledger)
//!     → headers.rs (strip hop-by-hop and gateway-owned headers before dispatch)
//! ```
//!
//! # Design Decisions
//! - Defense in depth: multiple layers of protection
//! - Fail closed: reject on any security check failure
//! - No trust in client input

pub mod access_control;
pub mod headers;
pub mod limits;
pub mod rate_limit;
pub mod sanitize;
pub mod token;

pub use headers::{log_safe, ClientIdentity, ClientIpResolver};
pub use rate_limit::{Admission, Denial, RateLimiter};
pub use sanitize::{Rejection, Sanitizer};
pub use token::{Principal, TokenRejection, TokenValidator};
