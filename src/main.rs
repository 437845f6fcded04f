//! front-door: the request-shaping core of an API gateway.
//!
//! ```text
//!   client ──▶ http::server ──▶ pipeline
//!                                 │ request_id → sanitize → validate → rate_limit → select
//!                                 ▼
//!                              dispatch ──▶ backend (load_balancer::pool)
//!
//!   background: health::HealthMonitor, RateLimiter sweeper, config watcher, signals
//! ```
//!
//! Exit codes: 0 clean shutdown, 2 configuration error, 1 fatal runtime error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use front_door::config::{load_config, reload_into, validate_config, ConfigError, ConfigWatcher, CoreConfig};
use front_door::health::HealthMonitor;
use front_door::http::HttpServer;
use front_door::lifecycle::{signals, Shutdown};
use front_door::observability::{logging, metrics, TracingAuditSink};
use front_door::pipeline::Gateway;

const EXIT_RUNTIME: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(name = "front-door", version, about = "Front-door request-shaping gateway")]
struct Args {
    /// Path to the TOML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    logging::init_logging(&config.observability);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start runtime");
            return ExitCode::from(EXIT_RUNTIME);
        }
    };

    runtime.block_on(run(config, args.config))
}

fn load(path: Option<&std::path::Path>) -> Result<CoreConfig, ConfigError> {
    match path {
        Some(path) => load_config(path),
        None => {
            let config = CoreConfig::default();
            validate_config(&config).map_err(ConfigError::Validation)?;
            Ok(config)
        }
    }
}

async fn run(config: CoreConfig, config_path: Option<PathBuf>) -> ExitCode {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "front-door starting");

    let metrics_handle = if config.observability.metrics_enabled {
        metrics::init_metrics()
    } else {
        None
    };

    let bind_address = config.listener.bind_address.clone();
    let admin = config.admin.clone();

    let gateway = match Gateway::new(config, Arc::new(TracingAuditSink)) {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let shutdown = Arc::new(Shutdown::new());

    // Reloads: file changes and SIGHUP both land in one channel.
    let (hup_tx, mut hup_rx) = mpsc::unbounded_channel::<()>();
    let _signals = signals::spawn(shutdown.clone(), hup_tx);
    let _watcher = config_path.as_ref().and_then(|path| {
        let (watcher, mut updates) = ConfigWatcher::new(path);
        let sighup_tx = watcher.sender();
        let sighup_path = path.clone();
        tokio::spawn(async move {
            while hup_rx.recv().await.is_some() {
                reload_into(&sighup_path, &sighup_tx);
            }
        });
        let reload_gateway = gateway.clone();
        tokio::spawn(async move {
            while let Some(next) = updates.recv().await {
                if let Err(e) = reload_gateway.reload(next) {
                    tracing::error!(error = %e, "Reload rejected, keeping current configuration");
                }
            }
        });
        match watcher.run() {
            Ok(w) => Some(w),
            Err(e) => {
                tracing::warn!(error = %e, "Config file watching unavailable; SIGHUP still reloads");
                None
            }
        }
    });

    let health = HealthMonitor::new(
        gateway.pool().clone(),
        gateway.config_handle(),
        gateway.clock().clone(),
    )
    .spawn(shutdown.subscribe());
    let sweep_period = gateway.limiter().sweep_period();
    let sweeper = gateway
        .limiter()
        .clone()
        .spawn_sweeper(sweep_period, shutdown.subscribe());

    let listener = match TcpListener::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(address = %bind_address, error = %e, "Failed to bind listener");
            return ExitCode::from(EXIT_RUNTIME);
        }
    };

    if admin.enabled {
        match TcpListener::bind(&admin.bind_address).await {
            Ok(admin_listener) => {
                let admin_gateway = gateway.clone();
                let admin_shutdown = shutdown.subscribe();
                tokio::spawn(async move {
                    if let Err(e) = front_door::admin::serve(admin_listener, admin_gateway, admin_shutdown).await {
                        tracing::error!(error = %e, "Admin API failed");
                    }
                });
            }
            Err(e) => {
                tracing::error!(address = %admin.bind_address, error = %e, "Failed to bind admin listener");
                return ExitCode::from(EXIT_RUNTIME);
            }
        }
    }

    let server = HttpServer::new(gateway, metrics_handle);
    let served = server.run(listener, shutdown.subscribe()).await;

    shutdown.trigger();
    let _ = health.await;
    let _ = sweeper.await;

    match served {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Server error");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}
