//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (windows and intervals > 0)
//! - Check that token policy has key material for its algorithms
//! - Check IP/CIDR lists and seed backend URLs
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: CoreConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use thiserror::Error;

use crate::config::schema::{CoreConfig, PLACEHOLDER_ADMIN_KEY};
use crate::load_balancer::backend::parse_base_url;
use crate::security::access_control::IpMatcher;
use crate::security::token::{parse_algorithm, AlgorithmFamily};

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &CoreConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(ValidationError::new("listener.bind_address", "not a socket address"));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }

    for (i, backend) in config.backends.iter().enumerate() {
        if let Err(e) = parse_base_url(&backend.url) {
            errors.push(ValidationError::new(format!("backends[{}].url", i), e.to_string()));
        }
    }

    let health = &config.health;
    if health.path.is_empty() || !health.path.starts_with('/') {
        errors.push(ValidationError::new("health.path", "must be an absolute path"));
    }
    if health.interval_secs == 0 {
        errors.push(ValidationError::new("health.interval_secs", "must be > 0"));
    }
    if health.timeout_ms == 0 {
        errors.push(ValidationError::new("health.timeout_ms", "must be > 0"));
    }
    if health.unhealthy_threshold == 0 {
        errors.push(ValidationError::new("health.unhealthy_threshold", "must be > 0"));
    }

    if config.rate.enabled {
        if config.rate.window_secs == 0 {
            errors.push(ValidationError::new("rate.window_secs", "must be > 0"));
        }
        if config.rate.requests_per_window == 0 {
            errors.push(ValidationError::new("rate.requests_per_window", "must be > 0"));
        }
        if config.rate.burst == 0 {
            errors.push(ValidationError::new("rate.burst", "must be > 0"));
        }
    }
    if config.conn.enabled {
        if config.conn.window_secs == 0 {
            errors.push(ValidationError::new("conn.window_secs", "must be > 0"));
        }
        if config.conn.max_per_window == 0 {
            errors.push(ValidationError::new("conn.max_per_window", "must be > 0"));
        }
    }

    if config.limits.max_body_bytes == 0 {
        errors.push(ValidationError::new("limits.max_body_bytes", "must be > 0"));
    }
    if config.limits.max_header_bytes == 0 {
        errors.push(ValidationError::new("limits.max_header_bytes", "must be > 0"));
    }

    validate_token(config, &mut errors);

    if config.upstream.connect_timeout_ms == 0 {
        errors.push(ValidationError::new("upstream.connect_timeout_ms", "must be > 0"));
    }
    if config.upstream.read_timeout_ms == 0 {
        errors.push(ValidationError::new("upstream.read_timeout_ms", "must be > 0"));
    }
    if config.upstream.request_timeout_secs == 0 {
        errors.push(ValidationError::new("upstream.request_timeout_secs", "must be > 0"));
    }
    for method in &config.upstream.retry_methods {
        if method.parse::<axum::http::Method>().is_err() {
            errors.push(ValidationError::new(
                "upstream.retry_methods",
                format!("invalid method '{}'", method),
            ));
        }
    }

    for (field, list) in [
        ("trusted_proxies", &config.trusted_proxies),
        ("ip_allowlist", &config.ip_allowlist),
        ("ip_blocklist", &config.ip_blocklist),
        ("observability.metrics_allowed", &config.observability.metrics_allowed),
    ] {
        if let Err(e) = IpMatcher::parse(list) {
            errors.push(ValidationError::new(field, e.to_string()));
        }
    }
    for header in &config.trusted_client_ip_headers {
        if header.parse::<axum::http::HeaderName>().is_err() {
            errors.push(ValidationError::new(
                "trusted_client_ip_headers",
                format!("invalid header name '{}'", header),
            ));
        }
    }

    if !matches!(config.observability.log_format.as_str(), "pretty" | "json") {
        errors.push(ValidationError::new("observability.log_format", "must be 'pretty' or 'json'"));
    }

    if config.admin.enabled {
        if config.admin.api_key.is_empty() || config.admin.api_key == PLACEHOLDER_ADMIN_KEY {
            errors.push(ValidationError::new("admin.api_key", "must be set when the admin API is enabled"));
        }
        if config.admin.bind_address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(ValidationError::new("admin.bind_address", "not a socket address"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_token(config: &CoreConfig, errors: &mut Vec<ValidationError>) {
    let token = &config.token;
    if !token.enabled {
        return;
    }
    if token.algorithms.is_empty() {
        errors.push(ValidationError::new("token.algorithms", "at least one algorithm is required"));
    }
    for name in &token.algorithms {
        match parse_algorithm(name) {
            Ok(alg) => match AlgorithmFamily::of(alg) {
                AlgorithmFamily::Hmac if token.hmac_secret.as_deref().unwrap_or("").is_empty() => {
                    errors.push(ValidationError::new(
                        "token.hmac_secret",
                        format!("required for {}", name),
                    ));
                }
                AlgorithmFamily::Rsa | AlgorithmFamily::Ec if token.public_key_pem.is_none() => {
                    errors.push(ValidationError::new(
                        "token.public_key_pem",
                        format!("required for {}", name),
                    ));
                }
                _ => {}
            },
            Err(_) => errors.push(ValidationError::new(
                "token.algorithms",
                format!("algorithm '{}' is not allowed", name),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::BackendConfig;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&CoreConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = CoreConfig::default();
        config.health.interval_secs = 0;
        config.rate.burst = 0;
        config.trusted_proxies = vec!["10.0.0.0/40".to_string()];
        config.backends.push(BackendConfig {
            url: "ftp://example.com".to_string(),
            weight: 1,
        });

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"health.interval_secs"));
        assert!(fields.contains(&"rate.burst"));
        assert!(fields.contains(&"trusted_proxies"));
        assert!(fields.contains(&"backends[0].url"));
    }

    #[test]
    fn none_algorithm_is_refused() {
        let mut config = CoreConfig::default();
        config.token.enabled = true;
        config.token.algorithms = vec!["none".to_string()];
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "token.algorithms");
    }

    #[test]
    fn hmac_requires_secret() {
        let mut config = CoreConfig::default();
        config.token.enabled = true;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "token.hmac_secret");

        config.token.hmac_secret = Some("s3cret".to_string());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn admin_placeholder_key_is_refused() {
        let mut config = CoreConfig::default();
        config.admin.enabled = true;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "admin.api_key");
    }
}
