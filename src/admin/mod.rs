//! Administrative API.
//!
//! Served on its own listener (`admin.bind_address`), guarded by a bearer key.

pub mod auth;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, put};
use axum::{middleware, Router};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::pipeline::Gateway;

use self::auth::admin_auth_middleware;
use self::handlers::*;

#[derive(Clone)]
pub struct AdminState {
    pub gateway: Arc<Gateway>,
}

pub fn setup_admin_router(gateway: Arc<Gateway>) -> Router {
    let state = AdminState { gateway };
    Router::new()
        .route("/admin/status", get(get_status))
        .route(
            "/admin/backends",
            get(get_backends).post(add_backend).delete(remove_backend),
        )
        .route("/admin/strategy", put(set_strategy))
        .route("/admin/allowlist", get(get_allowlist).post(allow).delete(disallow))
        .route("/admin/blocklist", get(get_blocklist).post(block))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}

/// Serve the admin API until shutdown.
pub async fn serve(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "Admin API listening");
    let app = setup_admin_router(gateway).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(crate::lifecycle::shutdown::wait(shutdown))
        .await
}
