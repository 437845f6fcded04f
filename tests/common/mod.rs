//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use front_door::config::{BackendConfig, CoreConfig};
use front_door::http::HttpServer;
use front_door::lifecycle::Shutdown;
use front_door::observability::CollectingSink;
use front_door::pipeline::Gateway;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Request heads seen by a mock backend, in arrival order.
#[derive(Clone, Default)]
pub struct Seen(Arc<Mutex<Vec<String>>>);

impl Seen {
    pub fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn heads(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Value of `name` in the most recent request head, lowercase name match.
    pub fn last_header(&self, name: &str) -> Option<String> {
        let heads = self.heads();
        let head = heads.last()?;
        head.lines().skip(1).find_map(|line| {
            let (n, v) = line.split_once(':')?;
            n.trim().eq_ignore_ascii_case(name).then(|| v.trim().to_string())
        })
    }
}

async fn read_head(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "200 OK",
        204 => "204 No Content",
        404 => "404 Not Found",
        500 => "500 Internal Server Error",
        502 => "502 Bad Gateway",
        503 => "503 Service Unavailable",
        _ => "200 OK",
    }
}

/// Start a backend whose reply is computed per request. Returns its address.
pub async fn start_programmable_backend<F, Fut>(f: F) -> (SocketAddr, Seen)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);
    let seen = Seen::default();
    let log = seen.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let f = f.clone();
            let log = log.clone();
            tokio::spawn(async move {
                let head = read_head(&mut socket).await;
                log.0.lock().unwrap().push(head);
                let (status, body) = f().await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line(status),
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, seen)
}

/// Start a backend that always answers 200 with `body`.
pub async fn start_mock_backend(body: &'static str) -> (SocketAddr, Seen) {
    start_programmable_backend(move || async move { (200, body.to_string()) }).await
}

/// Connections seen by a backend that never answers.
#[derive(Clone, Default)]
pub struct Stalled {
    accepted: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl Stalled {
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Connections the gateway has closed from its side.
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Start a backend that reads requests and never replies.
pub async fn start_stalled_backend() -> (SocketAddr, Stalled) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stalled = Stalled::default();
    let log = stalled.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            log.accepted.fetch_add(1, Ordering::SeqCst);
            let log = log.clone();
            tokio::spawn(async move {
                let mut chunk = [0u8; 1024];
                loop {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                log.closed.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    (addr, stalled)
}

/// Poll `check` every 20ms until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// An address nothing listens on.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Config with the given backends, health probing and rate limiting off.
pub fn config_with(backends: &[SocketAddr]) -> CoreConfig {
    let mut config = CoreConfig::default();
    config.health.enabled = false;
    config.rate.enabled = false;
    config.backends = backends
        .iter()
        .map(|addr| BackendConfig {
            url: format!("http://{}", addr),
            weight: 1,
        })
        .collect();
    config
}

pub struct TestGateway {
    pub addr: SocketAddr,
    pub gateway: Arc<Gateway>,
    pub audit: Arc<CollectingSink>,
    pub shutdown: Arc<Shutdown>,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Serve a gateway on an ephemeral port.
pub async fn start_gateway(config: CoreConfig) -> TestGateway {
    let audit = Arc::new(CollectingSink::new());
    let gateway = Arc::new(Gateway::new(config, audit.clone()).unwrap());
    let shutdown = Arc::new(Shutdown::new());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(gateway.clone(), None);
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, rx).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestGateway {
        addr,
        gateway,
        audit,
        shutdown,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

pub const TEST_SECRET: &str = "integration-test-secret";

/// HS256 token signed with [`TEST_SECRET`].
pub fn mint_token(claims: serde_json::Value) -> String {
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .unwrap()
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}
