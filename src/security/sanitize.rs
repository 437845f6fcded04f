//! Request sanitizer.
//!
//! Stateless checks that run before anything else looks at a request:
//! header size, path traversal, control-character stripping in headers and
//! query values, declared body size, and multipart shape. The body itself is
//! checked while it streams (see [`crate::security::limits`]).

use std::borrow::Cow;

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::request::Parts;
use axum::http::uri::PathAndQuery;
use axum::http::{HeaderValue, Uri};
use thiserror::Error;

use crate::config::LimitsConfig;
use crate::security::headers::log_safe;
use crate::security::limits::{limit_body, multipart_boundary, LimitTrip, PartCounter};

/// Why the sanitizer refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Rejection {
    #[error("PAYLOAD_TOO_LARGE")]
    PayloadTooLarge,
    #[error("HEADER_TOO_LARGE")]
    HeaderTooLarge,
    #[error("PATH_TRAVERSAL")]
    PathTraversal,
    #[error("INVALID_CONTENT_TYPE")]
    InvalidContentType,
    #[error("TOO_MANY_PARTS")]
    TooManyParts,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Rejection::HeaderTooLarge => "HEADER_TOO_LARGE",
            Rejection::PathTraversal => "PATH_TRAVERSAL",
            Rejection::InvalidContentType => "INVALID_CONTENT_TYPE",
            Rejection::TooManyParts => "TOO_MANY_PARTS",
        }
    }
}

/// Literal traversal markers, matched case-insensitively on the raw and decoded path.
const TRAVERSAL_TOKENS: &[&str] = &[
    "../",
    "..\\",
    "%2e%2e%2f",
    "%252e%252e%252f",
    "..%2f",
    "..%252f",
    "....//",
];

#[derive(Debug, Clone)]
pub struct Sanitizer {
    limits: LimitsConfig,
}

impl Sanitizer {
    pub fn new(limits: LimitsConfig) -> Self {
        Self { limits }
    }

    /// Check and clean the request head in place.
    ///
    /// Returns the escaped control bytes that were removed, for the audit trail.
    pub fn check_head(&self, parts: &mut Parts) -> Result<Vec<String>, Rejection> {
        let header_bytes: usize = parts
            .headers
            .iter()
            .map(|(name, value)| name.as_str().len() + value.len())
            .sum();
        if header_bytes > self.limits.max_header_bytes {
            return Err(Rejection::HeaderTooLarge);
        }

        check_path(parts.uri.path())?;

        let mut stripped = strip_header_controls(parts);
        if let Some(query) = parts.uri.query() {
            if let Some((clean, removed)) = strip_query_controls(query) {
                parts.uri = replace_query(&parts.uri, &clean)?;
                stripped.extend(removed);
            }
        }

        if let Some(declared) = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            if declared > self.limits.max_body_bytes {
                return Err(Rejection::PayloadTooLarge);
            }
        }

        if let Some(content_type) = parts.headers.get(CONTENT_TYPE) {
            let content_type = content_type
                .to_str()
                .map_err(|_| Rejection::InvalidContentType)?;
            multipart_boundary(content_type)?;
        }

        Ok(stripped)
    }

    /// Wrap the body with the streaming size and part caps.
    pub fn guard_body(&self, parts: &Parts, body: Body) -> (Body, LimitTrip) {
        let counter = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|ct| multipart_boundary(ct).ok().flatten())
            .map(|boundary| PartCounter::new(&boundary, self.limits.max_files_per_request));
        limit_body(body, self.limits.max_body_bytes, counter)
    }
}

/// Reject traversal attempts and non-canonical paths.
///
/// The path is percent-decoded once; the decoded form must already be in
/// normal form (no `.`/`..` segments, no empty segments) and neither form
/// may carry a traversal token.
pub fn check_path(raw: &str) -> Result<(), Rejection> {
    let lowered = raw.to_ascii_lowercase();
    if TRAVERSAL_TOKENS.iter().any(|t| lowered.contains(t)) {
        return Err(Rejection::PathTraversal);
    }

    let decoded_bytes = urlencoding::decode_binary(raw.as_bytes());
    let decoded = String::from_utf8_lossy(&decoded_bytes);
    let decoded_lower = decoded.to_ascii_lowercase();
    if TRAVERSAL_TOKENS.iter().any(|t| decoded_lower.contains(t))
        || decoded.split(['/', '\\']).any(|segment| segment == "..")
        || decoded.chars().any(|c| c.is_control())
    {
        return Err(Rejection::PathTraversal);
    }

    if normalize_path(&decoded) != decoded {
        return Err(Rejection::PathTraversal);
    }

    Ok(())
}

/// Lexically normalize an absolute path, keeping a trailing slash.
pub fn normalize_path(path: &str) -> String {
    let trailing = path.len() > 1 && path.ends_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut out = String::with_capacity(path.len());
    out.push('/');
    out.push_str(&segments.join("/"));
    if trailing && !segments.is_empty() {
        out.push('/');
    }
    out
}

fn is_stripped_control(b: u8) -> bool {
    b < 0x20 && b != b'\t'
}

fn strip_header_controls(parts: &mut Parts) -> Vec<String> {
    let mut removed = Vec::new();
    for (name, value) in parts.headers.iter_mut() {
        if !value.as_bytes().iter().copied().any(is_stripped_control) {
            continue;
        }
        let (kept, dropped): (Vec<u8>, Vec<u8>) = value
            .as_bytes()
            .iter()
            .partition(|b| !is_stripped_control(**b));
        if let Ok(clean) = HeaderValue::from_bytes(&kept) {
            *value = clean;
        }
        removed.push(format!(
            "header:{}={}",
            name.as_str(),
            log_safe(&String::from_utf8_lossy(&dropped))
        ));
    }
    removed
}

/// Returns the rewritten query and what was removed, or `None` if already clean.
fn strip_query_controls(query: &str) -> Option<(String, Vec<String>)> {
    let mut changed = false;
    let mut removed = Vec::new();
    let mut pairs = Vec::new();

    for pair in query.split('&') {
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (pair, None),
        };
        let clean_key = clean_component(key, &mut removed, "query-key");
        let clean_value = value.map(|v| clean_component(v, &mut removed, "query"));

        changed |= matches!(clean_key, Cow::Owned(_))
            || matches!(clean_value, Some(Cow::Owned(_)));
        pairs.push(match clean_value {
            Some(v) => format!("{}={}", clean_key, v),
            None => clean_key.into_owned(),
        });
    }

    changed.then(|| (pairs.join("&"), removed))
}

fn clean_component<'a>(raw: &'a str, removed: &mut Vec<String>, location: &str) -> Cow<'a, str> {
    let decoded = urlencoding::decode_binary(raw.replace('+', " ").as_bytes()).into_owned();
    if !decoded.iter().copied().any(is_stripped_control) {
        return Cow::Borrowed(raw);
    }
    let (kept, dropped): (Vec<u8>, Vec<u8>) =
        decoded.into_iter().partition(|b| !is_stripped_control(*b));
    removed.push(format!(
        "{}:{}",
        location,
        log_safe(&String::from_utf8_lossy(&dropped))
    ));
    Cow::Owned(urlencoding::encode_binary(&kept).into_owned())
}

fn replace_query(uri: &Uri, query: &str) -> Result<Uri, Rejection> {
    let path_and_query = if query.is_empty() {
        uri.path().to_string()
    } else {
        format!("{}?{}", uri.path(), query)
    };
    let mut parts = uri.clone().into_parts();
    // An unrepresentable rewritten URI cannot be forwarded safely.
    parts.path_and_query =
        Some(PathAndQuery::try_from(path_and_query).map_err(|_| Rejection::PathTraversal)?);
    Uri::from_parts(parts).map_err(|_| Rejection::PathTraversal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(uri: &str) -> Parts {
        Request::builder().uri(uri).body(()).unwrap().into_parts().0
    }

    fn sanitizer() -> Sanitizer {
        Sanitizer::new(LimitsConfig {
            max_body_bytes: 1024,
            max_header_bytes: 256,
            max_files_per_request: 2,
        })
    }

    #[test]
    fn encoded_traversal_is_rejected() {
        assert_eq!(check_path("/files/%2e%2e%2fetc/passwd"), Err(Rejection::PathTraversal));
        assert_eq!(check_path("/files/%2E%2E%2Fetc/passwd"), Err(Rejection::PathTraversal));
        assert_eq!(check_path("/files/%252e%252e%252fetc"), Err(Rejection::PathTraversal));
        assert_eq!(check_path("/a/../b"), Err(Rejection::PathTraversal));
        assert_eq!(check_path("/a/.."), Err(Rejection::PathTraversal));
        assert_eq!(check_path("/a/%2e%2e"), Err(Rejection::PathTraversal));
        assert_eq!(check_path("/a/....//b"), Err(Rejection::PathTraversal));
        assert_eq!(check_path("/a\\..\\b"), Err(Rejection::PathTraversal));
    }

    #[test]
    fn non_canonical_paths_are_rejected() {
        assert_eq!(check_path("/a//b"), Err(Rejection::PathTraversal));
        assert_eq!(check_path("/a/./b"), Err(Rejection::PathTraversal));
        assert_eq!(check_path("/a/%00b"), Err(Rejection::PathTraversal));
    }

    #[test]
    fn ordinary_paths_pass() {
        assert!(check_path("/").is_ok());
        assert!(check_path("/v1/accounts/42").is_ok());
        assert!(check_path("/v1/accounts/").is_ok());
        assert!(check_path("/docs/my%20file.pdf").is_ok());
        assert!(check_path("/v1/file.tar.gz").is_ok());
    }

    #[test]
    fn header_size_cap() {
        let mut p = parts("/");
        p.headers
            .insert("x-big", HeaderValue::from_str(&"a".repeat(300)).unwrap());
        assert_eq!(sanitizer().check_head(&mut p), Err(Rejection::HeaderTooLarge));
    }

    #[test]
    fn declared_length_over_cap() {
        let mut p = parts("/upload");
        p.headers.insert(CONTENT_LENGTH, HeaderValue::from_static("4096"));
        assert_eq!(sanitizer().check_head(&mut p), Err(Rejection::PayloadTooLarge));
    }

    #[test]
    fn multipart_without_boundary() {
        let mut p = parts("/upload");
        p.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("multipart/form-data"));
        assert_eq!(sanitizer().check_head(&mut p), Err(Rejection::InvalidContentType));
    }

    #[test]
    fn query_controls_are_stripped_and_recorded() {
        let mut p = parts("/search?q=abc%0d%0aSet-Cookie:x&page=2");
        let stripped = sanitizer().check_head(&mut p).unwrap();

        assert_eq!(p.uri.query(), Some("q=abcSet-Cookie%3Ax&page=2"));
        assert_eq!(stripped, vec!["query:\\r\\n".to_string()]);
    }

    #[test]
    fn sanitizing_twice_is_stable() {
        let s = sanitizer();
        let mut first = parts("/search?q=a%07b&x=1");
        s.check_head(&mut first).unwrap();
        let once = first.uri.clone();

        let stripped_again = s.check_head(&mut first).unwrap();
        assert!(stripped_again.is_empty());
        assert_eq!(first.uri, once);

        let mut bad = parts("/x/%2e%2e%2fy");
        assert_eq!(s.check_head(&mut bad), s.check_head(&mut bad));
    }

    #[test]
    fn normalize_keeps_trailing_slash() {
        assert_eq!(normalize_path("/a/b/"), "/a/b/");
        assert_eq!(normalize_path("/a/./b/../c"), "/a/c");
        assert_eq!(normalize_path("/"), "/");
    }
}
