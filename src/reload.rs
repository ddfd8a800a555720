//! Hot configuration reload.
//!
//! [`ConfigWatcher`] polls the configuration file and publishes every parsed
//! document on a `watch` channel. Each loop holds a [`ConfigHandle`] and calls
//! [`ConfigHandle::reload`] at the top of an iteration: a new document is
//! applied only if it validates and keeps the node set; otherwise the loop
//! keeps the configuration it already has.

use crate::config::SyncConfig;
use crate::error::SyncError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// A loop's validated configuration plus the feed of candidate updates.
pub struct ConfigHandle {
    current: Arc<SyncConfig>,
    updates: watch::Receiver<SyncConfig>,
    /// Only one loop reports rejected documents, the others stay quiet.
    reports_errors: bool,
}

impl ConfigHandle {
    pub fn new(initial: SyncConfig, updates: watch::Receiver<SyncConfig>) -> Self {
        Self {
            current: Arc::new(initial),
            updates,
            reports_errors: false,
        }
    }

    /// A handle that never sees updates.
    pub fn fixed(config: SyncConfig) -> Self {
        let (_tx, rx) = watch::channel(config.clone());
        Self::new(config, rx)
    }

    /// Log rejected documents at error level from this handle.
    pub fn reporting_errors(mut self) -> Self {
        self.reports_errors = true;
        self
    }

    /// Snapshot of the validated configuration.
    pub fn current(&self) -> Arc<SyncConfig> {
        Arc::clone(&self.current)
    }

    /// Apply a pending update if there is one and it is acceptable.
    ///
    /// Returns `true` if the configuration changed.
    pub fn reload(&mut self) -> bool {
        // A dropped sender just means no further updates.
        if !self.updates.has_changed().unwrap_or(false) {
            return false;
        }
        let candidate = self.updates.borrow_and_update().clone();
        if candidate == *self.current {
            return false;
        }

        match self.check(&candidate) {
            Ok(()) => {
                if self.reports_errors && candidate.commands.pull_batches.is_none() {
                    warn!("No pull batches command configured, pull is disabled");
                }
                self.current = Arc::new(candidate);
                crate::metrics::record_config_reload(true);
                info!("Configuration reloaded successfully");
                true
            }
            Err(e) => {
                crate::metrics::record_config_reload(false);
                if self.reports_errors {
                    error!(error = %e, "Error reloading configuration, keeping the current one");
                } else {
                    debug!(error = %e, "Ignoring rejected configuration");
                }
                false
            }
        }
    }

    fn check(&self, candidate: &SyncConfig) -> crate::Result<()> {
        candidate.validate()?;
        if !self.current.same_topology(candidate) {
            return Err(SyncError::NodeSetChanged);
        }
        Ok(())
    }
}

/// Polls the configuration file's modification time and republishes it.
pub struct ConfigWatcher {
    path: PathBuf,
    interval: Duration,
    tx: watch::Sender<SyncConfig>,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>, interval: Duration, tx: watch::Sender<SyncConfig>) -> Self {
        Self {
            path: path.into(),
            interval,
            tx,
            last_modified: None,
        }
    }

    async fn modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .ok()
    }

    /// Record the current modification time without publishing.
    pub async fn prime(&mut self) {
        self.last_modified = self.modified().await;
    }

    /// Check the file once and publish it if it changed and parses.
    ///
    /// Structural checks are left to each [`ConfigHandle`].
    pub async fn poll(&mut self) -> bool {
        let modified = self.modified().await;
        if modified.is_none() || modified == self.last_modified {
            return false;
        }
        self.last_modified = modified;

        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cannot read configuration");
                return false;
            }
        };
        match serde_json::from_str::<SyncConfig>(&raw) {
            Ok(config) => {
                debug!(path = %self.path.display(), "Configuration file changed");
                self.tx.send_replace(config);
                true
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Error reloading configuration");
                false
            }
        }
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.prime().await;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.poll().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Configuration watcher stopping");
                        return;
                    }
                }
            }
        }
    }
}
