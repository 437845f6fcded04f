//! Configuration file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::CoreConfig;

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<CoreConfig>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    ///
    /// Returns the watcher and a receiver for validated configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<CoreConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// A sender that pushes reloads into the same channel (used by SIGHUP).
    pub fn sender(&self) -> mpsc::UnboundedSender<CoreConfig> {
        self.update_tx.clone()
    }

    /// Start watching the file in a background thread.
    ///
    /// The returned watcher must be kept alive for as long as reloads are wanted.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx.clone();
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!("Config file change detected, reloading");
                        reload_into(&path, &tx);
                    }
                }
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

/// Load `path` and push it to `tx`; keep the current config on failure.
pub fn reload_into(path: &Path, tx: &mpsc::UnboundedSender<CoreConfig>) {
    match load_config(path) {
        Ok(new_config) => {
            let _ = tx.send(new_config);
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to reload config, keeping current configuration");
        }
    }
}
