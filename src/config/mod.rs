//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → CoreConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! On reload (file change or SIGHUP):
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → atomic swap of Arc<CoreConfig>
//!     → pipeline observes new config on its next request
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - No process-wide config singleton; the config is passed at construction

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, BackendConfig, ConnectionLimitConfig, CoreConfig, HealthCheckConfig,
    LimitsConfig, ListenerConfig, ObservabilityConfig, RateConfig, ShutdownConfig,
    TokenConfig, UpstreamConfig,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::{reload_into, ConfigWatcher};
