//! Bearer token validation.
//!
//! # Responsibilities
//! - Find the token (Authorization header, else the session cookie)
//! - Enforce an explicit algorithm whitelist before any signature work
//! - Verify signature, audience and issuer, then expiry against the shared clock
//! - Produce a [`Principal`]; the raw token never travels further
//!
//! # Design Decisions
//! - The header is pre-parsed so `none` and unlisted algorithms fail as
//!   `ALG_NOT_ALLOWED` rather than as generic decode errors
//! - Expiry is checked here, not by `jsonwebtoken`, so tests can drive it
//!   with a manual clock; leeway defaults to zero

use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

use crate::config::TokenConfig;
use crate::store::Clock;

/// Why a token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum TokenRejection {
    #[error("MISSING")]
    Missing,
    #[error("MALFORMED")]
    Malformed,
    #[error("BAD_SIGNATURE")]
    BadSignature,
    #[error("EXPIRED")]
    Expired,
    #[error("ALG_NOT_ALLOWED")]
    AlgNotAllowed,
    #[error("AUDIENCE_MISMATCH")]
    AudienceMismatch,
}

impl TokenRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenRejection::Missing => "MISSING",
            TokenRejection::Malformed => "MALFORMED",
            TokenRejection::BadSignature => "BAD_SIGNATURE",
            TokenRejection::Expired => "EXPIRED",
            TokenRejection::AlgNotAllowed => "ALG_NOT_ALLOWED",
            TokenRejection::AudienceMismatch => "AUDIENCE_MISMATCH",
        }
    }
}

/// The verified subject of a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub roles: BTreeSet<String>,
    /// Unix seconds.
    pub expires_at: u64,
}

impl Principal {
    /// Roles as forwarded upstream: sorted, comma-joined.
    pub fn roles_header(&self) -> String {
        self.roles.iter().cloned().collect::<Vec<_>>().join(",")
    }
}

/// Key material a family of algorithms needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmFamily {
    Hmac,
    Rsa,
    Ec,
}

impl AlgorithmFamily {
    pub fn of(alg: Algorithm) -> Self {
        match alg {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => AlgorithmFamily::Hmac,
            Algorithm::ES256 | Algorithm::ES384 => AlgorithmFamily::Ec,
            _ => AlgorithmFamily::Rsa,
        }
    }
}

/// Parse a configured or presented algorithm name.
///
/// `none` and anything outside the supported families is `ALG_NOT_ALLOWED`.
pub fn parse_algorithm(name: &str) -> Result<Algorithm, TokenRejection> {
    if name.trim().eq_ignore_ascii_case("none") {
        return Err(TokenRejection::AlgNotAllowed);
    }
    match Algorithm::from_str(name.trim()) {
        Ok(Algorithm::EdDSA) | Err(_) => Err(TokenRejection::AlgNotAllowed),
        Ok(alg) => Ok(alg),
    }
}

#[derive(Debug, Error)]
pub enum TokenConfigError {
    #[error("algorithm '{0}' is not allowed")]
    Algorithm(String),
    #[error("token.hmac_secret is required for HMAC algorithms")]
    MissingSecret,
    #[error("token.public_key_pem is required for {0:?} algorithms")]
    MissingPublicKey(AlgorithmFamily),
    #[error("invalid public key: {0}")]
    Key(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Deserialize)]
struct JoseHeader {
    alg: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    exp: Option<u64>,
    nbf: Option<u64>,
    #[serde(default)]
    roles: Vec<String>,
    scope: Option<String>,
}

/// Where the token for a request came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    Header(String),
    Cookie(String),
}

impl TokenSource {
    pub fn token(&self) -> &str {
        match self {
            TokenSource::Header(t) | TokenSource::Cookie(t) => t,
        }
    }
}

/// Verifies already-issued tokens.
pub struct TokenValidator {
    algorithms: Vec<Algorithm>,
    hmac: Option<DecodingKey>,
    rsa: Option<DecodingKey>,
    ec: Option<DecodingKey>,
    audience: Option<String>,
    issuer: Option<String>,
    leeway: u64,
    cookie_name: Option<String>,
    public_paths: Vec<String>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("algorithms", &self.algorithms)
            .field("audience", &self.audience)
            .field("issuer", &self.issuer)
            .field("leeway", &self.leeway)
            .finish_non_exhaustive()
    }
}

impl TokenValidator {
    pub fn from_config(config: &TokenConfig, clock: Arc<dyn Clock>) -> Result<Self, TokenConfigError> {
        let mut algorithms = Vec::with_capacity(config.algorithms.len());
        for name in &config.algorithms {
            let alg = parse_algorithm(name).map_err(|_| TokenConfigError::Algorithm(name.clone()))?;
            if !algorithms.contains(&alg) {
                algorithms.push(alg);
            }
        }

        let needs = |family| algorithms.iter().any(|a| AlgorithmFamily::of(*a) == family);
        let pem = config.public_key_pem.as_deref();

        let hmac = if needs(AlgorithmFamily::Hmac) {
            match config.hmac_secret.as_deref() {
                Some(secret) if !secret.is_empty() => Some(DecodingKey::from_secret(secret.as_bytes())),
                _ => return Err(TokenConfigError::MissingSecret),
            }
        } else {
            None
        };
        let rsa = if needs(AlgorithmFamily::Rsa) {
            let pem = pem.ok_or(TokenConfigError::MissingPublicKey(AlgorithmFamily::Rsa))?;
            Some(DecodingKey::from_rsa_pem(pem.as_bytes())?)
        } else {
            None
        };
        let ec = if needs(AlgorithmFamily::Ec) {
            let pem = pem.ok_or(TokenConfigError::MissingPublicKey(AlgorithmFamily::Ec))?;
            Some(DecodingKey::from_ec_pem(pem.as_bytes())?)
        } else {
            None
        };

        Ok(Self {
            algorithms,
            hmac,
            rsa,
            ec,
            audience: config.audience.clone(),
            issuer: config.issuer.clone(),
            leeway: config.leeway_secs,
            cookie_name: config.cookie_name.clone(),
            public_paths: config.public_paths.clone(),
            clock,
        })
    }

    /// Whether `path` is forwarded without a token.
    pub fn is_public(&self, path: &str) -> bool {
        self.public_paths.iter().any(|prefix| {
            let Some(rest) = path.strip_prefix(prefix.as_str()) else {
                return false;
            };
            rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/')
        })
    }

    /// Find the token: the Authorization header wins over the cookie.
    pub fn extract(&self, headers: &HeaderMap) -> Option<TokenSource> {
        if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            let token = value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
                .unwrap_or("")
                .trim();
            return Some(TokenSource::Header(token.to_string()));
        }

        let cookie_name = self.cookie_name.as_deref()?;
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == cookie_name)
            .map(|(_, value)| TokenSource::Cookie(value.trim().to_string()))
    }

    /// Remove every token carrier from `headers` before forwarding.
    pub fn strip(&self, headers: &mut HeaderMap) {
        headers.remove(AUTHORIZATION);

        let Some(cookie_name) = self.cookie_name.as_deref() else {
            return;
        };
        let kept: Vec<String> = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .filter(|pair| pair.split_once('=').map(|(n, _)| n) != Some(cookie_name))
            .map(str::to_string)
            .collect();

        headers.remove(COOKIE);
        if !kept.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&kept.join("; ")) {
                headers.insert(COOKIE, value);
            }
        }
    }

    /// Verify a bearer token.
    pub fn verify(&self, bearer: Option<&str>) -> Result<Principal, TokenRejection> {
        let token = match bearer.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => return Err(TokenRejection::Missing),
        };

        let alg = self.presented_algorithm(token)?;
        let key = match AlgorithmFamily::of(alg) {
            AlgorithmFamily::Hmac => self.hmac.as_ref(),
            AlgorithmFamily::Rsa => self.rsa.as_ref(),
            AlgorithmFamily::Ec => self.ec.as_ref(),
        }
        .ok_or(TokenRejection::AlgNotAllowed)?;

        let mut validation = Validation::new(alg);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.required_spec_claims = HashSet::new();
        validation.leeway = self.leeway;
        // A configured audience or issuer must be present, not just matching when present.
        match &self.audience {
            Some(aud) => {
                validation.set_audience(&[aud.as_str()]);
                validation.required_spec_claims.insert("aud".to_string());
            }
            None => validation.validate_aud = false,
        }
        if let Some(iss) = &self.issuer {
            validation.set_issuer(&[iss.as_str()]);
            validation.required_spec_claims.insert("iss".to_string());
        }

        let claims = jsonwebtoken::decode::<Claims>(token, key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => TokenRejection::BadSignature,
                ErrorKind::InvalidAudience | ErrorKind::InvalidIssuer => {
                    TokenRejection::AudienceMismatch
                }
                ErrorKind::MissingRequiredClaim(claim) if claim == "aud" || claim == "iss" => {
                    TokenRejection::AudienceMismatch
                }
                ErrorKind::InvalidAlgorithm => TokenRejection::AlgNotAllowed,
                _ => TokenRejection::Malformed,
            })?
            .claims;

        let now = self.clock.unix_now();
        let expires_at = claims.exp.ok_or(TokenRejection::Malformed)?;
        if now >= expires_at.saturating_add(self.leeway) {
            return Err(TokenRejection::Expired);
        }
        if let Some(nbf) = claims.nbf {
            if nbf > now.saturating_add(self.leeway) {
                return Err(TokenRejection::Expired);
            }
        }

        let subject = claims
            .sub
            .filter(|s| !s.is_empty())
            .ok_or(TokenRejection::Malformed)?;

        let mut roles: BTreeSet<String> = claims.roles.into_iter().collect();
        if let Some(scope) = claims.scope {
            roles.extend(scope.split_whitespace().map(str::to_string));
        }

        Ok(Principal {
            subject,
            roles,
            expires_at,
        })
    }

    fn presented_algorithm(&self, token: &str) -> Result<Algorithm, TokenRejection> {
        let mut segments = token.split('.');
        let (Some(header), Some(_), Some(_), None) =
            (segments.next(), segments.next(), segments.next(), segments.next())
        else {
            return Err(TokenRejection::Malformed);
        };

        let header = URL_SAFE_NO_PAD
            .decode(header.trim_end_matches('='))
            .map_err(|_| TokenRejection::Malformed)?;
        let header: JoseHeader =
            serde_json::from_slice(&header).map_err(|_| TokenRejection::Malformed)?;

        let alg = parse_algorithm(&header.alg)?;
        if !self.algorithms.contains(&alg) {
            return Err(TokenRejection::AlgNotAllowed);
        }
        Ok(alg)
    }
}
