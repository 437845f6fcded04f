//! Admin API exercised in-process against the router.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use front_door::admin::setup_admin_router;
use front_door::config::CoreConfig;
use front_door::load_balancer::Strategy;
use front_door::observability::CollectingSink;
use front_door::pipeline::Gateway;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

const KEY: &str = "admin-test-key";

fn setup() -> (Router, Arc<Gateway>) {
    let mut config = CoreConfig::default();
    config.health.enabled = false;
    config.admin.enabled = true;
    config.admin.api_key = KEY.to_string();
    let gateway = Arc::new(Gateway::new(config, Arc::new(CollectingSink::new())).unwrap());
    (setup_admin_router(gateway.clone()), gateway)
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", KEY));
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_wrong_key_is_401() {
    let (app, _) = setup();

    let missing = Request::builder().uri("/admin/status").body(Body::empty()).unwrap();
    let res = app.clone().oneshot(missing).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .uri("/admin/status")
        .header("authorization", "Bearer admin-test-kex")
        .body(Body::empty())
        .unwrap();
    let res = app.oneshot(wrong).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert!(json_body(res).await["error"].is_string());
}

#[tokio::test]
async fn test_status_reports_pool() {
    let (app, _) = setup();

    let res = app.oneshot(request("GET", "/admin/status", None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["status"], "operational");
    assert_eq!(body["strategy"], "round_robin");
    assert_eq!(body["backends_total"], 0);
}

#[tokio::test]
async fn test_backend_lifecycle() {
    let (app, gateway) = setup();

    let add = json!({"url": "http://10.0.0.5:8080/", "weight": 3});
    let res = app.clone().oneshot(request("POST", "/admin/backends", Some(add.clone()))).await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let created = json_body(res).await;
    assert_eq!(created["weight"], 3);
    assert_eq!(created["active"], true);
    assert_eq!(gateway.pool().len(), 1);

    // Same URL modulo trailing slash.
    let dup = json!({"url": "http://10.0.0.5:8080"});
    let res = app.clone().oneshot(request("POST", "/admin/backends", Some(dup))).await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let bad = json!({"url": "ftp://10.0.0.6"});
    let res = app.clone().oneshot(request("POST", "/admin/backends", Some(bad))).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = app.clone().oneshot(request("GET", "/admin/backends", None)).await.unwrap();
    let listed = json_body(res).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let remove = json!({"url": "http://10.0.0.5:8080"});
    let res = app.clone().oneshot(request("DELETE", "/admin/backends", Some(remove.clone()))).await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(gateway.pool().len(), 0);

    let res = app.oneshot(request("DELETE", "/admin/backends", Some(remove))).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_strategy_switch() {
    let (app, gateway) = setup();

    let res = app
        .clone()
        .oneshot(request("PUT", "/admin/strategy", Some(json!({"strategy": "least_connections"}))))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["previous"], "round_robin");
    assert_eq!(body["current"], "least_connections");
    assert_eq!(gateway.pool().strategy(), Strategy::LeastConnections);

    let res = app
        .oneshot(request("PUT", "/admin/strategy", Some(json!({"strategy": "fastest"}))))
        .await
        .unwrap();
    assert!(res.status().is_client_error());
}

#[tokio::test]
async fn test_allowlist_and_block_conflict() {
    let (app, gateway) = setup();

    let entry = json!({"ip": "203.0.113.0/24"});
    let res = app.clone().oneshot(request("POST", "/admin/allowlist", Some(entry.clone()))).await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let res = app.clone().oneshot(request("POST", "/admin/allowlist", Some(entry.clone()))).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let block = json!({"ip": "203.0.113.7", "ttl_secs": 60});
    let res = app.clone().oneshot(request("POST", "/admin/blocklist", Some(block))).await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let res = app.clone().oneshot(request("DELETE", "/admin/allowlist", Some(entry.clone()))).await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    let res = app.clone().oneshot(request("DELETE", "/admin/allowlist", Some(entry))).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = app.oneshot(request("POST", "/admin/allowlist", Some(json!({"ip": "not-an-ip"})))).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(gateway.limiter().allowlist().is_empty());
}

#[tokio::test]
async fn test_block_with_ttl() {
    let (app, gateway) = setup();

    let zero = json!({"ip": "198.51.100.9", "ttl_secs": 0});
    let res = app.clone().oneshot(request("POST", "/admin/blocklist", Some(zero))).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let block = json!({"ip": "198.51.100.9", "ttl_secs": 120});
    let res = app.clone().oneshot(request("POST", "/admin/blocklist", Some(block))).await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    assert!(gateway.limiter().blocklist().is_blocked("198.51.100.9".parse().unwrap()));

    let res = app.oneshot(request("GET", "/admin/blocklist", None)).await.unwrap();
    let body = json_body(res).await;
    let dynamic = body["dynamic"].as_array().unwrap();
    assert_eq!(dynamic.len(), 1);
    assert_eq!(dynamic[0]["ip"], "198.51.100.9");
    assert!(dynamic[0]["ttl_secs"].as_u64().unwrap() <= 120);
}
