//! Reserved paths served by the public router.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use front_door::config::CoreConfig;
use front_door::http::{build_router, AppState};
use front_door::observability::{AuditTag, CollectingSink};
use front_door::pipeline::Gateway;
use http_body_util::BodyExt;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::Value;
use tower::ServiceExt;

mod common;

fn router(config: CoreConfig, peer: &str, with_metrics: bool) -> Router {
    let gateway = Arc::new(Gateway::new(config, Arc::new(CollectingSink::new())).unwrap());
    let handle = with_metrics.then(|| PrometheusBuilder::new().build_recorder().handle());
    let peer: SocketAddr = peer.parse().unwrap();
    build_router(AppState::new(gateway, handle)).layer(MockConnectInfo(peer))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn quiet_config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.health.enabled = false;
    config
}

#[tokio::test]
async fn test_health_reports_ok_without_auth() {
    let mut config = quiet_config();
    config.token.enabled = true;
    config.token.hmac_secret = Some("secret".to_string());
    let app = router(config, "198.51.100.1:4000", false);

    let res = app.oneshot(get("/health")).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().contains_key("x-request-id"));
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["strategy"], "round_robin");
    assert_eq!(body["backends_total"], 0);
}

#[tokio::test]
async fn test_health_degraded_when_no_backend_active() {
    let mut config = quiet_config();
    config.backends.push(front_door::config::BackendConfig {
        url: "http://10.0.0.1:9000".to_string(),
        weight: 1,
    });
    let gateway = Arc::new(Gateway::new(config, Arc::new(CollectingSink::new())).unwrap());
    let backend = gateway.pool().backends()[0].clone();
    for _ in 0..3 {
        gateway
            .pool()
            .record_probe(&backend, false, None, 3, std::time::Instant::now());
    }
    let app = build_router(AppState::new(gateway, None))
        .layer(MockConnectInfo("127.0.0.1:1".parse::<SocketAddr>().unwrap()));

    let res = app.oneshot(get("/health")).await.unwrap();
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["backends_active"], 0);
}

#[tokio::test]
async fn test_metrics_restricted_by_client_ip() {
    let app = router(quiet_config(), "203.0.113.50:5000", true);

    let res = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["code"], "AUTH_FORBIDDEN");
    assert_eq!(body["reason"], "METRICS_RESTRICTED");
}

#[tokio::test]
async fn test_metrics_served_to_loopback() {
    let app = router(quiet_config(), "127.0.0.1:5000", true);

    let res = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert!(res
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
}

#[tokio::test]
async fn test_metrics_disabled_is_404() {
    let mut config = quiet_config();
    config.observability.metrics_enabled = false;
    let app = router(config, "127.0.0.1:5000", true);

    let res = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_fallback_runs_pipeline() {
    let app = router(quiet_config(), "127.0.0.1:5000", false);

    let res = app.oneshot(get("/anything")).await.unwrap();

    // No backends registered.
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(res.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn test_head_response_is_not_a_cancellation() {
    let (backend, seen) = common::start_mock_backend("hello").await;
    let audit = Arc::new(CollectingSink::new());
    let gateway = Arc::new(Gateway::new(common::config_with(&[backend]), audit.clone()).unwrap());
    let app = build_router(AppState::new(gateway.clone(), None))
        .layer(MockConnectInfo("198.51.100.7:4000".parse::<SocketAddr>().unwrap()));

    let request = Request::builder()
        .method("HEAD")
        .uri("/docs")
        .body(Body::empty())
        .unwrap();
    let res = app.oneshot(request).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    drop(res);

    assert_eq!(seen.count(), 1);
    assert!(seen.heads()[0].starts_with("HEAD /docs"));
    let upstream = gateway.pool().backends()[0].clone();
    assert_eq!(upstream.load(), 0);
    assert!(upstream.latency_ms() > 0.0, "HEAD exchange must record a latency sample");
    assert!(!audit.tags().contains(&AuditTag::ClientCancelled));
    assert!(audit.tags().contains(&AuditTag::RequestForwarded));
}
