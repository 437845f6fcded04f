//! Streaming request body limits.
//!
//! # Responsibilities
//! - Enforce maximum request body size without buffering
//! - Count multipart parts as they stream past
//! - Record which limit tripped so the dispatcher can answer 413/400
//!
//! # Design Decisions
//! - The body is wrapped, not collected; at most one chunk is held at a time
//! - A tripped limit ends the stream with an error, which aborts the upstream call

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use axum::body::{Body, Bytes};
use futures_util::StreamExt;

use crate::security::sanitize::Rejection;

const NOT_TRIPPED: u8 = 0;
const TRIPPED_SIZE: u8 = 1;
const TRIPPED_PARTS: u8 = 2;

/// Shared flag set when a streaming limit is exceeded.
#[derive(Debug, Clone, Default)]
pub struct LimitTrip(Arc<AtomicU8>);

impl LimitTrip {
    fn trip(&self, rejection: Rejection) {
        let code = match rejection {
            Rejection::TooManyParts => TRIPPED_PARTS,
            _ => TRIPPED_SIZE,
        };
        let _ = self
            .0
            .compare_exchange(NOT_TRIPPED, code, Ordering::AcqRel, Ordering::Acquire);
    }

    /// The limit that ended the body stream, if any.
    pub fn tripped(&self) -> Option<Rejection> {
        match self.0.load(Ordering::Acquire) {
            TRIPPED_SIZE => Some(Rejection::PayloadTooLarge),
            TRIPPED_PARTS => Some(Rejection::TooManyParts),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("request body rejected: {0}")]
struct BodyLimitExceeded(Rejection);

/// Counts multipart delimiters across chunk boundaries.
#[derive(Debug)]
pub struct PartCounter {
    delimiter: Vec<u8>,
    tail: Vec<u8>,
    delimiters_seen: usize,
    max_parts: usize,
}

impl PartCounter {
    pub fn new(boundary: &str, max_parts: usize) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary.as_bytes());
        Self {
            delimiter,
            tail: Vec::new(),
            delimiters_seen: 0,
            max_parts,
        }
    }

    /// Feed the next chunk. Returns false once the part cap is exceeded.
    ///
    /// N parts use N+1 delimiters (the last one closes the body).
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        let mut window = std::mem::take(&mut self.tail);
        window.extend_from_slice(chunk);

        let d = self.delimiter.len();
        if window.len() >= d {
            let mut i = 0;
            while i + d <= window.len() {
                if window[i..i + d] == self.delimiter[..] {
                    self.delimiters_seen += 1;
                    i += d;
                } else {
                    i += 1;
                }
            }
        }

        let keep = d.saturating_sub(1).min(window.len());
        self.tail = window.split_off(window.len() - keep);

        self.delimiters_seen <= self.max_parts + 1
    }

    /// Parts seen so far, once the closing delimiter has arrived.
    pub fn parts(&self) -> usize {
        self.delimiters_seen.saturating_sub(1)
    }
}

/// Wrap `body` so it fails once it exceeds `max_bytes` or `parts`' cap.
pub fn limit_body(body: Body, max_bytes: u64, parts: Option<PartCounter>) -> (Body, LimitTrip) {
    let trip = LimitTrip::default();
    let flag = trip.clone();
    let mut seen: u64 = 0;
    let mut parts = parts;

    let stream = body.into_data_stream().map(move |chunk| -> Result<Bytes, axum::Error> {
        let chunk = chunk?;
        seen = seen.saturating_add(chunk.len() as u64);
        if seen > max_bytes {
            flag.trip(Rejection::PayloadTooLarge);
            return Err(axum::Error::new(BodyLimitExceeded(Rejection::PayloadTooLarge)));
        }
        if let Some(counter) = parts.as_mut() {
            if !counter.feed(&chunk) {
                flag.trip(Rejection::TooManyParts);
                return Err(axum::Error::new(BodyLimitExceeded(Rejection::TooManyParts)));
            }
        }
        Ok(chunk)
    });

    (Body::from_stream(stream), trip)
}

/// Extract the multipart boundary from a Content-Type value.
///
/// `Ok(None)` when the type is not multipart; `Err` when it is multipart but
/// the boundary is missing or not a valid RFC 2046 boundary.
pub fn multipart_boundary(content_type: &str) -> Result<Option<String>, Rejection> {
    let mut params = content_type.split(';');
    let mime = params.next().unwrap_or("").trim().to_ascii_lowercase();
    if !mime.starts_with("multipart/") {
        return Ok(None);
    }

    let boundary = params
        .filter_map(|p| {
            let (k, v) = p.split_once('=')?;
            k.trim().eq_ignore_ascii_case("boundary").then(|| v.trim().trim_matches('"').to_string())
        })
        .next()
        .ok_or(Rejection::InvalidContentType)?;

    let valid_char = |c: char| c.is_ascii_alphanumeric() || "'()+_,-./:=? ".contains(c);
    if boundary.is_empty()
        || boundary.len() > 70
        || boundary.ends_with(' ')
        || !boundary.chars().all(valid_char)
    {
        return Err(Rejection::InvalidContentType);
    }

    Ok(Some(boundary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn multipart(boundary: &str, parts: usize) -> Vec<u8> {
        let mut body = Vec::new();
        for i in 0..parts {
            body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
            body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"f{}\"\r\n\r\nvalue\r\n", i)
                    .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
        body
    }

    #[test]
    fn counts_parts_split_across_chunks() {
        let body = multipart("XyZ", 3);
        let mut counter = PartCounter::new("XyZ", 10);
        for chunk in body.chunks(2) {
            assert!(counter.feed(chunk));
        }
        assert_eq!(counter.parts(), 3);
    }

    #[test]
    fn too_many_parts_trips() {
        let body = multipart("b", 4);
        let mut counter = PartCounter::new("b", 3);
        let ok = body.chunks(7).all(|c| counter.feed(c));
        assert!(!ok);
    }

    #[test]
    fn boundary_parsing() {
        assert_eq!(multipart_boundary("application/json").unwrap(), None);
        assert_eq!(
            multipart_boundary("multipart/form-data; boundary=\"abc-123\"").unwrap(),
            Some("abc-123".to_string())
        );
        assert_eq!(
            multipart_boundary("multipart/form-data"),
            Err(Rejection::InvalidContentType)
        );
        assert_eq!(
            multipart_boundary("multipart/form-data; boundary=bad\u{7f}"),
            Err(Rejection::InvalidContentType)
        );
    }

    #[tokio::test]
    async fn oversized_stream_is_cut_off() {
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            (0..10).map(|_| Ok(Bytes::from(vec![b'x'; 100]))).collect();
        let body = Body::from_stream(futures_util::stream::iter(chunks));

        let (limited, trip) = limit_body(body, 450, None);
        assert!(limited.collect().await.is_err());
        assert_eq!(trip.tripped(), Some(Rejection::PayloadTooLarge));
    }

    #[tokio::test]
    async fn body_within_limit_passes_untouched() {
        let (limited, trip) = limit_body(Body::from("hello"), 5, None);
        let bytes = limited.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"hello");
        assert_eq!(trip.tripped(), None);
    }
}
