//! Response body that holds the backend's load slot until it is fully sent.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::{Body, BodyDataStream, Bytes, HttpBody};
use futures_util::Stream;

use crate::load_balancer::{BackendPool, LoadGuard};
use crate::observability::{AuditEvent, AuditSink};

/// What to do if the client goes away mid-body.
pub struct CancelNotice {
    pub audit: Arc<dyn AuditSink>,
    pub event: AuditEvent,
}

struct InFlight {
    guard: LoadGuard,
    pool: Arc<BackendPool>,
    started: Instant,
}

/// Streams an upstream body and settles the dispatch when it ends.
///
/// End of stream records the end-to-end latency and releases the load slot.
/// An upstream error releases the slot without a latency sample. Dropping
/// the stream early (client gone) releases it and emits the cancel notice.
/// A body that is empty by construction settles at once: hyper never polls
/// HEAD, 204 or 304 bodies, and dropping them is not a cancellation.
pub struct MeteredStream {
    inner: BodyDataStream,
    in_flight: Option<InFlight>,
    cancel: Option<CancelNotice>,
}

impl MeteredStream {
    pub fn new(
        upstream: Body,
        guard: LoadGuard,
        pool: Arc<BackendPool>,
        started: Instant,
        cancel: CancelNotice,
    ) -> Self {
        let empty = upstream.is_end_stream();
        let mut stream = Self {
            inner: upstream.into_data_stream(),
            in_flight: Some(InFlight {
                guard,
                pool,
                started,
            }),
            cancel: Some(cancel),
        };
        if empty {
            stream.settle(true);
        }
        stream
    }

    pub fn into_body(self) -> Body {
        Body::from_stream(self)
    }

    fn settle(&mut self, completed: bool) {
        self.cancel = None;
        if let Some(in_flight) = self.in_flight.take() {
            if completed {
                let latency = in_flight.started.elapsed();
                in_flight.pool.note_dispatch_end(in_flight.guard, latency);
            }
        }
    }
}

impl Stream for MeteredStream {
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = Pin::new(&mut self.inner).poll_next(cx);
        match &polled {
            Poll::Ready(None) => self.settle(true),
            Poll::Ready(Some(Err(e))) => {
                tracing::warn!(error = %e, "Upstream body failed mid-stream");
                self.settle(false);
            }
            _ => {}
        }
        polled
    }
}

impl Drop for MeteredStream {
    fn drop(&mut self) {
        if self.in_flight.take().is_some() {
            if let Some(notice) = self.cancel.take() {
                notice.audit.emit(notice.event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::Strategy;
    use crate::observability::{AuditTag, CollectingSink, Verdict};
    use http_body_util::BodyExt;

    fn setup() -> (Arc<BackendPool>, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::new());
        let pool = Arc::new(BackendPool::new(Strategy::RoundRobin, sink.clone()));
        pool.add_backend("http://127.0.0.1:9001", 1).unwrap();
        (pool, sink)
    }

    fn notice(sink: &Arc<CollectingSink>) -> CancelNotice {
        CancelNotice {
            audit: sink.clone(),
            event: AuditEvent::new(AuditTag::ClientCancelled, Verdict::Deny),
        }
    }

    #[tokio::test]
    async fn completed_stream_records_latency_and_releases() {
        let (pool, sink) = setup();
        let backend = pool.backends()[0].clone();
        let guard = pool.note_dispatch_start(&backend);
        assert_eq!(backend.load(), 1);

        let body = MeteredStream::new(Body::from("hello"), guard, pool.clone(), Instant::now(), notice(&sink))
            .into_body();
        let bytes = body.collect().await.unwrap().to_bytes();

        assert_eq!(&bytes[..], b"hello");
        assert_eq!(backend.load(), 0);
        assert!(backend.latency_ms() >= 0.0);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn dropped_stream_releases_and_reports_cancel() {
        let (pool, sink) = setup();
        let backend = pool.backends()[0].clone();
        let guard = pool.note_dispatch_start(&backend);

        let stream = MeteredStream::new(Body::from("never read"), guard, pool.clone(), Instant::now(), notice(&sink));
        drop(stream);

        assert_eq!(backend.load(), 0);
        assert_eq!(sink.tags(), vec![AuditTag::ClientCancelled]);
    }

    #[tokio::test]
    async fn empty_body_settles_without_being_polled() {
        let (pool, sink) = setup();
        let backend = pool.backends()[0].clone();
        let guard = pool.note_dispatch_start(&backend);

        let started = Instant::now() - std::time::Duration::from_millis(5);
        let stream = MeteredStream::new(Body::empty(), guard, pool.clone(), started, notice(&sink));
        assert_eq!(backend.load(), 0);
        drop(stream);

        assert!(sink.events().is_empty());
        assert!(backend.latency_ms() >= 5.0);
    }
}
