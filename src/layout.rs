//! On-disk layout of the batch directories.
//!
//! ```text
//! <batch_dir>/                     staging: locally produced and pulled batches
//! <batch_dir>/push/<node>/         batches waiting to be pushed to <node>
//! <batch_dir>/pull/<node>/         batches fetched from <node>, not yet applied
//! <backup_dir>/<YYYY-MM-DD>/<mode>/<node>/   optional hard-link backups
//! ```
//!
//! A batch is handed from one directory to the next by hard link or rename,
//! so it is never copied and never lost on a crash between two steps.

use crate::error::{Result, SyncError};
use crate::reload::ConfigHandle;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tracing::error;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Push,
    Pull,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::Push, Mode::Pull];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
        }
    }

    /// Stable index for per-mode arrays.
    pub fn index(&self) -> usize {
        match self {
            Self::Push => 0,
            Self::Pull => 1,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Paths derived from the batch root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLayout {
    root: PathBuf,
}

impl BatchLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Where new and pulled batches land.
    pub fn staging(&self) -> &Path {
        &self.root
    }

    /// `<root>/<mode>/<node>`
    pub fn node_dir(&self, mode: Mode, node: &str) -> PathBuf {
        self.root.join(mode.as_str()).join(node)
    }
}

/// `<backup_root>/<date>/<mode>/<node>`
pub fn backup_dir(backup_root: &Path, date: &str, mode: Mode, node: &str) -> PathBuf {
    backup_root.join(date).join(mode.as_str()).join(node)
}

/// Today's local date as `YYYY-MM-DD`.
pub fn today() -> String {
    chrono::Local::now().format("%F").to_string()
}

pub async fn ensure_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| SyncError::io("mkdir", dir, e))
}

/// Hard-link `src` to `dst` unless `dst` already exists.
///
/// Returns `false` if the destination was already present.
pub async fn link_if_absent(src: &Path, dst: &Path) -> Result<bool> {
    if tokio::fs::try_exists(dst).await.unwrap_or(false) {
        return Ok(false);
    }
    if let Some(parent) = dst.parent() {
        ensure_dir(parent).await?;
    }
    match tokio::fs::hard_link(src, dst).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(SyncError::io("link", dst, e)),
    }
}

/// Link `src` to `dst`, retrying every failure interval until it works.
///
/// The configuration is reloaded between attempts so an operator can fix
/// paths without restarting.
pub async fn link_until_done(src: &Path, dst: &Path, config: &mut ConfigHandle) {
    loop {
        match link_if_absent(src, dst).await {
            Ok(_) => return,
            Err(e) => {
                let fail_time = config.current().fail_time();
                error!(
                    src = %src.display(),
                    dst = %dst.display(),
                    error = %e,
                    "Could not link batch, will retry in {}",
                    humantime::format_duration(fail_time)
                );
                crate::metrics::record_link_retry();
                tokio::time::sleep(fail_time).await;
                config.reload();
            }
        }
    }
}

/// Create `dir`, retrying every failure interval until it works.
pub async fn ensure_dir_until_done(dir: &Path, config: &mut ConfigHandle) {
    loop {
        match ensure_dir(dir).await {
            Ok(()) => return,
            Err(e) => {
                let fail_time = config.current().fail_time();
                error!(
                    dir = %dir.display(),
                    error = %e,
                    "Could not create directory, will retry in {}",
                    humantime::format_duration(fail_time)
                );
                tokio::time::sleep(fail_time).await;
                config.reload();
            }
        }
    }
}

/// Names of directory entries, at most `limit` of them, in directory order.
pub async fn list_names(dir: &Path, limit: usize) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| SyncError::io("opendir", dir, e))?;
    let mut names = Vec::new();
    while names.len() < limit {
        match entries
            .next_entry()
            .await
            .map_err(|e| SyncError::io("readdir", dir, e))?
        {
            Some(entry) => {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
            None => break,
        }
    }
    Ok(names)
}
