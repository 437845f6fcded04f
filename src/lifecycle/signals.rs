//! OS signal handling.
//!
//! # Responsibilities
//! - SIGINT/SIGTERM trigger graceful shutdown
//! - SIGHUP triggers a config reload, not shutdown
//! - A second SIGINT/SIGTERM while draining forces exit

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::lifecycle::Shutdown;

/// Exit code when a second termination signal cuts the drain short.
pub const FORCED_EXIT_CODE: i32 = 1;

/// Listen for process signals until the process exits.
///
/// Each SIGHUP sends `()` on `reload`.
pub fn spawn(shutdown: Arc<Shutdown>, reload: mpsc::UnboundedSender<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = terminate() => {
                    if shutdown.trigger() {
                        tracing::info!("Shutdown signal received, draining");
                    } else {
                        tracing::warn!("Second shutdown signal, exiting now");
                        std::process::exit(FORCED_EXIT_CODE);
                    }
                }
                _ = hangup() => {
                    tracing::info!("SIGHUP received, reloading configuration");
                    let _ = reload.send(());
                }
            }
        }
    })
}

async fn terminate() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn hangup() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::hangup()) {
            Ok(mut hup) => {
                hup.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGHUP handler");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
