//! Scratch directory tree for end-to-end tests.

#![allow(dead_code)] // Each test binary uses a different subset

use batch_replicator::{BatchLayout, Channels, ConfigHandle, Mode, PullWorker, PushWorker, SyncConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// A temporary batch tree plus the configuration pointing at it.
pub struct Sandbox {
    pub dir: TempDir,
    pub config: SyncConfig,
}

impl Sandbox {
    /// Sandbox for `nodes` with the liveness checkfile present.
    pub fn new(nodes: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::for_testing(dir.path(), nodes);
        config.queue_capacity = Some(64);
        std::fs::create_dir_all(&config.batch_dir).unwrap();
        std::fs::create_dir_all(&config.data_dir).unwrap();
        let sandbox = Self { dir, config };
        sandbox.enable();
        sandbox
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn layout(&self) -> BatchLayout {
        BatchLayout::new(&self.config.batch_dir)
    }

    pub fn handle(&self) -> ConfigHandle {
        ConfigHandle::fixed(self.config.clone())
    }

    pub fn enable(&self) {
        std::fs::write(self.root().join("enabled"), "").unwrap();
    }

    pub fn disable(&self) {
        let _ = std::fs::remove_file(self.root().join("enabled"));
    }

    /// Drop a batch into staging.
    pub fn stage(&self, name: &str, content: &str) -> PathBuf {
        let path = self.config.batch_dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Drop a batch into `<mode>/<node>`.
    pub fn put(&self, mode: Mode, node: &str, name: &str, content: &str) -> PathBuf {
        let dir = self.layout().node_dir(mode, node);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Sorted names in `<mode>/<node>`.
    pub fn list(&self, mode: Mode, node: &str) -> Vec<String> {
        list_sorted(&self.layout().node_dir(mode, node))
    }

    /// Sorted batch names in staging.
    pub fn staged(&self) -> Vec<String> {
        list_sorted(&self.config.batch_dir)
            .into_iter()
            .filter(|n| n.ends_with(".batch"))
            .collect()
    }

    /// Path of a log file that recording commands append to.
    pub fn log_path(&self) -> PathBuf {
        self.root().join("transfer.log")
    }

    pub fn log(&self) -> String {
        std::fs::read_to_string(self.log_path()).unwrap_or_default()
    }

    /// A transfer command that logs its destination and batch list.
    ///
    /// `%b` is either a path or `-`; `cat` reads both.
    pub fn recording_command(&self) -> String {
        format!("echo DEST %d >> {log}; cat %b >> {log}", log = self.log_path().display())
    }

    pub fn channels(&self) -> Arc<Channels> {
        Arc::new(Channels::from_config(&self.config))
    }

    /// Spawn one pull worker and `push` push workers on `channels`.
    pub fn spawn_workers(&self, channels: &Arc<Channels>, push: usize) -> Vec<JoinHandle<()>> {
        let mut handles = vec![tokio::spawn(
            PullWorker::new(Arc::clone(channels), self.handle()).run(),
        )];
        for id in 0..push {
            handles.push(tokio::spawn(
                PushWorker::new(id, Arc::clone(channels), self.handle()).run(),
            ));
        }
        handles
    }
}

pub fn list_sorted(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

/// Backdate a file's modification time.
pub fn age(path: &Path, by: Duration) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - by).unwrap();
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
