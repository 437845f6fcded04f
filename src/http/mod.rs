//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (TLS already terminated upstream of us)
//!     → server.rs (Axum setup, reserved paths)
//!     → request.rs (request id)
//!     → pipeline (checks, selection, dispatch)
//!     → response.rs (reserved-path bodies)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{resolve_request_id, X_REQUEST_ID};
pub use server::{build_router, AppState, HttpServer};
