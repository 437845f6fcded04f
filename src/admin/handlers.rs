use std::net::IpAddr;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::admin::AdminState;
use crate::load_balancer::{Backend, BackendError, Strategy};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("missing or invalid admin key")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match self {
            AdminError::Unauthorized => StatusCode::UNAUTHORIZED,
            AdminError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AdminError::NotFound(_) => StatusCode::NOT_FOUND,
            AdminError::Conflict(_) => StatusCode::CONFLICT,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<BackendError> for AdminError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Duplicate(_) => AdminError::Conflict(e.to_string()),
            BackendError::NotFound(_) => AdminError::NotFound(e.to_string()),
            BackendError::InvalidUrl(_) | BackendError::UnsupportedScheme(_) => {
                AdminError::BadRequest(e.to_string())
            }
        }
    }
}

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub strategy: Strategy,
    pub backends_total: usize,
    pub backends_active: usize,
    pub tracked_identities: usize,
}

#[derive(Serialize)]
pub struct BackendStatus {
    pub url: String,
    pub weight: u32,
    pub active: bool,
    pub load: usize,
    pub latency_ewma_ms: f64,
    pub consecutive_failures: u32,
    pub last_probe_age_ms: Option<u64>,
}

impl BackendStatus {
    fn of(backend: &Backend) -> Self {
        Self {
            url: backend.url().to_string(),
            weight: backend.weight(),
            active: backend.is_active(),
            load: backend.load(),
            latency_ewma_ms: backend.latency_ms(),
            consecutive_failures: backend.failures(),
            last_probe_age_ms: backend
                .last_probe()
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }
}

#[derive(Deserialize)]
pub struct AddBackend {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Deserialize)]
pub struct RemoveBackend {
    pub url: String,
}

#[derive(Deserialize)]
pub struct SetStrategy {
    pub strategy: Strategy,
}

#[derive(Deserialize)]
pub struct IpEntry {
    pub ip: String,
}

#[derive(Deserialize)]
pub struct BlockRequest {
    pub ip: IpAddr,
    pub ttl_secs: u64,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let pool = state.gateway.pool();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        strategy: pool.strategy(),
        backends_total: pool.len(),
        backends_active: pool.active_count(),
        tracked_identities: state.gateway.limiter().tracked(),
    })
}

pub async fn get_backends(State(state): State<AdminState>) -> Json<Vec<BackendStatus>> {
    let backends = state.gateway.pool().backends();
    Json(backends.iter().map(|b| BackendStatus::of(b)).collect())
}

pub async fn add_backend(
    State(state): State<AdminState>,
    Json(body): Json<AddBackend>,
) -> Result<(StatusCode, Json<BackendStatus>), AdminError> {
    let backend = state.gateway.pool().add_backend(&body.url, body.weight)?;
    Ok((StatusCode::CREATED, Json(BackendStatus::of(&backend))))
}

pub async fn remove_backend(
    State(state): State<AdminState>,
    Json(body): Json<RemoveBackend>,
) -> Result<StatusCode, AdminError> {
    state.gateway.pool().remove_backend(&body.url)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_strategy(
    State(state): State<AdminState>,
    Json(body): Json<SetStrategy>,
) -> Json<serde_json::Value> {
    let previous = state.gateway.pool().set_strategy(body.strategy);
    Json(json!({ "previous": previous, "current": body.strategy }))
}

pub async fn get_allowlist(State(state): State<AdminState>) -> Json<Vec<String>> {
    Json(state.gateway.limiter().allowlist())
}

pub async fn allow(
    State(state): State<AdminState>,
    Json(body): Json<IpEntry>,
) -> Result<StatusCode, AdminError> {
    let added = state
        .gateway
        .limiter()
        .allow(&body.ip)
        .map_err(|e| AdminError::BadRequest(e.to_string()))?;
    tracing::info!(entry = %body.ip, "Allow-list entry added");
    Ok(if added { StatusCode::CREATED } else { StatusCode::OK })
}

pub async fn disallow(
    State(state): State<AdminState>,
    Json(body): Json<IpEntry>,
) -> Result<StatusCode, AdminError> {
    let removed = state
        .gateway
        .limiter()
        .disallow(&body.ip)
        .map_err(|e| AdminError::BadRequest(e.to_string()))?;
    if !removed {
        return Err(AdminError::NotFound(format!("{} is not allow-listed", body.ip)));
    }
    tracing::info!(entry = %body.ip, "Allow-list entry removed");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_blocklist(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let entries: Vec<_> = state
        .gateway
        .limiter()
        .blocklist()
        .dynamic_entries()
        .into_iter()
        .map(|(ip, ttl)| json!({ "ip": ip, "ttl_secs": ttl.as_secs() }))
        .collect();
    Json(json!({ "dynamic": entries }))
}

pub async fn block(
    State(state): State<AdminState>,
    Json(body): Json<BlockRequest>,
) -> Result<StatusCode, AdminError> {
    if body.ttl_secs == 0 {
        return Err(AdminError::BadRequest("ttl_secs must be positive".into()));
    }
    if !state
        .gateway
        .limiter()
        .block(body.ip, Duration::from_secs(body.ttl_secs))
    {
        return Err(AdminError::Conflict(format!("{} is allow-listed", body.ip)));
    }
    tracing::info!(ip = %body.ip, ttl_secs = body.ttl_secs, "IP blocked");
    Ok(StatusCode::CREATED)
}
