//! front-door: per-client admission, health-aware load balancing and
//! request hygiene in front of a set of HTTP backends.

pub mod admin;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod observability;
pub mod pipeline;
pub mod resilience;
pub mod security;
pub mod store;

pub use config::CoreConfig;
pub use error::GatewayError;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use pipeline::Gateway;
