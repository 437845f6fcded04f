//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::load_balancer::Strategy;

/// Root configuration for the front door.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Load balancing strategy.
    pub strategy: Strategy,

    /// Peers whose forwarding headers are believed (IPs or CIDRs).
    pub trusted_proxies: Vec<String>,

    /// Headers consulted, in order, for the client IP behind a trusted proxy.
    pub trusted_client_ip_headers: Vec<String>,

    /// Client IPs/CIDRs that bypass rate limiting.
    pub ip_allowlist: Vec<String>,

    /// Client IPs/CIDRs that are always refused.
    pub ip_blocklist: Vec<String>,

    /// Listener configuration (bind address, connection cap).
    pub listener: ListenerConfig,

    /// Backends registered at start-up.
    pub backends: Vec<BackendConfig>,

    /// Health check settings.
    pub health: HealthCheckConfig,

    /// Token bucket settings.
    pub rate: RateConfig,

    /// Sliding connection ledger settings.
    pub conn: ConnectionLimitConfig,

    /// Sanitizer caps.
    pub limits: LimitsConfig,

    /// Bearer token policy.
    pub token: TokenConfig,

    /// Dispatcher behavior.
    pub upstream: UpstreamConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    pub admin: AdminConfig,

    /// Shutdown behavior.
    pub shutdown: ShutdownConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
            trusted_proxies: Vec::new(),
            trusted_client_ip_headers: vec!["X-Forwarded-For".to_string(), "X-Real-IP".to_string()],
            ip_allowlist: Vec::new(),
            ip_blocklist: Vec::new(),
            listener: ListenerConfig::default(),
            backends: Vec::new(),
            health: HealthCheckConfig::default(),
            rate: RateConfig::default(),
            conn: ConnectionLimitConfig::default(),
            limits: LimitsConfig::default(),
            token: TokenConfig::default(),
            upstream: UpstreamConfig::default(),
            observability: ObservabilityConfig::default(),
            admin: AdminConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent in-flight requests (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// A backend registered from the config file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BackendConfig {
    /// Absolute base URL (e.g., "http://10.0.0.5:8080").
    pub url: String,

    /// Weight for weighted round-robin (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Path appended to each backend's base URL.
    pub path: String,

    /// Probe period in seconds.
    pub interval_secs: u64,

    /// Probe timeout in milliseconds.
    pub timeout_ms: u64,

    /// Consecutive failures before a backend is taken out of rotation.
    pub unhealthy_threshold: u32,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/health".to_string(),
            interval_secs: 10,
            timeout_ms: 2_000,
            unhealthy_threshold: 3,
        }
    }
}

/// Token bucket configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateConfig {
    /// Enable request-rate limiting.
    pub enabled: bool,

    /// Tokens refilled per window.
    pub requests_per_window: u32,

    /// Window length in seconds.
    pub window_secs: u64,

    /// Burst capacity.
    pub burst: u32,
}

impl RateConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Refill rate in tokens per second.
    pub fn rate_per_sec(&self) -> f64 {
        if self.window_secs == 0 {
            return 0.0;
        }
        self.requests_per_window as f64 / self.window_secs as f64
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_window: 100,
            window_secs: 60,
            burst: 200,
        }
    }
}

/// Sliding connection ledger configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionLimitConfig {
    /// Enable the ledger.
    pub enabled: bool,

    /// Arrivals allowed per window.
    pub max_per_window: usize,

    /// Window length in seconds.
    pub window_secs: u64,
}

impl ConnectionLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for ConnectionLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_per_window: 100,
            window_secs: 60,
        }
    }
}

/// Sanitizer caps.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum request body size in bytes.
    pub max_body_bytes: u64,

    /// Maximum total header size (names + values) in bytes.
    pub max_header_bytes: usize,

    /// Maximum multipart parts per request.
    pub max_files_per_request: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 10 * 1024 * 1024, // 10MB
            max_header_bytes: 64 * 1024,
            max_files_per_request: 10,
        }
    }
}

/// Bearer token validation policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Require a valid token on forwarded requests.
    pub enabled: bool,

    /// Accepted signing algorithms (e.g. "HS256", "RS256").
    pub algorithms: Vec<String>,

    /// Clock skew tolerated on `exp`/`nbf`, in seconds.
    pub leeway_secs: u64,

    /// Required `aud` value.
    pub audience: Option<String>,

    /// Required `iss` value.
    pub issuer: Option<String>,

    /// Shared secret for HMAC algorithms.
    pub hmac_secret: Option<String>,

    /// PEM public key for RSA/PSS/EC algorithms.
    pub public_key_pem: Option<String>,

    /// Session cookie carrying a token when no Authorization header is sent.
    pub cookie_name: Option<String>,

    /// Path prefixes forwarded without a token.
    pub public_paths: Vec<String>,
}

impl TokenConfig {
    pub fn leeway(&self) -> Duration {
        Duration::from_secs(self.leeway_secs)
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            algorithms: vec!["HS256".to_string()],
            leeway_secs: 0,
            audience: None,
            issuer: None,
            hmac_secret: None,
            public_key_pem: None,
            cookie_name: None,
            public_paths: Vec::new(),
        }
    }
}

/// Dispatcher behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Upstream connect timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Time allowed for upstream response headers, in milliseconds.
    pub read_timeout_ms: u64,

    /// Per-request total deadline in seconds.
    pub request_timeout_secs: u64,

    /// Retry once on a different backend after a connect failure.
    pub retry_once: bool,

    /// Methods eligible for the retry.
    pub retry_methods: Vec<String>,

    /// Largest declared body that is buffered so it can be replayed.
    pub retry_buffer_bytes: u64,
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2_000,
            read_timeout_ms: 15_000,
            request_timeout_secs: 30,
            retry_once: true,
            retry_methods: ["GET", "HEAD", "OPTIONS", "PUT", "DELETE"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            retry_buffer_bytes: 64 * 1024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// "pretty" or "json".
    pub log_format: String,

    /// Serve `/metrics`.
    pub metrics_enabled: bool,

    /// IPs/CIDRs allowed to scrape `/metrics`.
    pub metrics_allowed: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
            metrics_allowed: vec!["127.0.0.1".to_string(), "::1".to_string()],
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

/// Placeholder key rejected by validation when the admin API is enabled.
pub const PLACEHOLDER_ADMIN_KEY: &str = "CHANGE_ME_IN_PRODUCTION";

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: PLACEHOLDER_ADMIN_KEY.to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long in-flight requests may drain before the process stops.
    pub grace_secs: u64,
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_secs: 15 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_uses_defaults() {
        let config: CoreConfig = toml::from_str(
            r#"
            strategy = "least_response_time"

            [[backends]]
            url = "http://127.0.0.1:9000"

            [rate]
            requests_per_window = 10
            window_secs = 1
            burst = 20
            "#,
        )
        .unwrap();

        assert_eq!(config.strategy, Strategy::LeastResponseTime);
        assert_eq!(config.backends[0].weight, 1);
        assert_eq!(config.rate.rate_per_sec(), 10.0);
        assert_eq!(config.health.path, "/health");
        assert_eq!(config.health.unhealthy_threshold, 3);
        assert_eq!(config.token.leeway_secs, 0);
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let parsed: Result<CoreConfig, _> = toml::from_str(r#"strategy = "fastest""#);
        assert!(parsed.is_err());
    }
}
