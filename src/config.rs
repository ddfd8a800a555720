//! Configuration for the batch replicator.
//!
//! Configuration is a JSON document deserialized into [`SyncConfig`]. Every
//! loop keeps its own validated snapshot and refreshes it at the top of each
//! iteration through [`ConfigHandle`](crate::reload::ConfigHandle); everything
//! except the node list may change between iterations.
//!
//! # Quick Start
//!
//! ```rust
//! use batch_replicator::config::{NodeConfig, SyncConfig};
//!
//! let config = SyncConfig {
//!     nodes: vec![
//!         NodeConfig::for_testing("alpha"),
//!         NodeConfig::for_testing("beta"),
//!     ],
//!     ..Default::default()
//! };
//! assert_eq!(config.node_names(), vec!["alpha", "beta"]);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── batch_dir: PathBuf           # staging root, push/<node>, pull/<node>
//! ├── data_dir: String             # local data root (%s on push, %d on pull)
//! ├── checkfile: Option<PathBuf>   # liveness switch
//! ├── backup_dir: Option<PathBuf>  # dated backup tree
//! ├── timers / budgets / caps
//! ├── commands: CommandsConfig     # transfer and pull-source commands
//! └── nodes: Vec<NodeConfig>       # fixed topology, ordered
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "batch_dir": "/var/spool/sfs",
//!   "data_dir": "/srv/data",
//!   "checkfile": "/srv/data/.sync-enabled",
//!   "push_count": 4,
//!   "commands": {
//!     "sync_data_rec": "rsync -a --files-from=%b %s/ %d/",
//!     "sync_data_norec": "rsync -d --files-from=%b %s/ %d/",
//!     "pull_batches": "rsync -a --remove-source-files %s/ %d/"
//!   },
//!   "nodes": [
//!     { "name": "beta", "data": "beta.example.com:/srv/data", "batches": "beta.example.com:/var/spool/sfs/out" }
//!   ]
//! }
//! ```

use crate::batch::BatchType;
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Staging root. `push/<node>` and `pull/<node>` live below it.
    #[serde(default = "default_batch_dir")]
    pub batch_dir: PathBuf,

    /// Local data root handed to transfer commands.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Liveness checkfile. Nothing is scheduled or transferred while it is absent.
    #[serde(default)]
    pub checkfile: Option<PathBuf>,

    /// Optional root of the dated backup tree.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,

    /// Seconds to sleep after an idle tick.
    #[serde(default = "default_scan_time_sec")]
    pub scan_time_sec: u64,

    /// Seconds a failing node stays in back-off, and the failure sleep.
    #[serde(default = "default_fail_time_sec")]
    pub fail_time_sec: u64,

    /// Minimum age in seconds before a batch may be grouped with its predecessors.
    #[serde(default = "default_bulk_older_than_sec")]
    pub bulk_older_than_sec: u64,

    /// Default cap on the number of batches in one bulk.
    #[serde(default = "default_bulk_max_batches")]
    pub bulk_max_batches: usize,

    /// Push tasks scheduled per tick.
    #[serde(default = "default_push_count")]
    pub push_count: usize,

    /// Pull tasks scheduled per tick.
    #[serde(default = "default_pull_count")]
    pub pull_count: usize,

    /// Number of push workers.
    #[serde(default = "default_push_workers")]
    pub push_workers: usize,

    /// Exit codes treated as a successful transfer.
    #[serde(default = "default_accept_status")]
    pub accept_status: Vec<i32>,

    /// Simulation mode: commands are logged but never executed, files never moved.
    #[serde(default)]
    pub dry_run: bool,

    /// Verbose command logging and stdout passthrough.
    #[serde(default)]
    pub debug: bool,

    /// Transfer and pull-source commands.
    #[serde(default)]
    pub commands: CommandsConfig,

    /// The replication peers, in scheduling order.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    /// Task queue capacity override (messages).
    #[serde(default)]
    pub queue_capacity: Option<usize>,
}

fn default_batch_dir() -> PathBuf {
    PathBuf::from("/var/spool/batch-replicator")
}

fn default_data_dir() -> String {
    "/srv/data".to_string()
}

fn default_scan_time_sec() -> u64 {
    5
}

fn default_fail_time_sec() -> u64 {
    30
}

fn default_bulk_older_than_sec() -> u64 {
    2
}

fn default_bulk_max_batches() -> usize {
    100
}

fn default_push_count() -> usize {
    4
}

fn default_pull_count() -> usize {
    1
}

fn default_push_workers() -> usize {
    4
}

fn default_accept_status() -> Vec<i32> {
    vec![0]
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_dir: default_batch_dir(),
            data_dir: default_data_dir(),
            checkfile: None,
            backup_dir: None,
            scan_time_sec: default_scan_time_sec(),
            fail_time_sec: default_fail_time_sec(),
            bulk_older_than_sec: default_bulk_older_than_sec(),
            bulk_max_batches: default_bulk_max_batches(),
            push_count: default_push_count(),
            pull_count: default_pull_count(),
            push_workers: default_push_workers(),
            accept_status: default_accept_status(),
            dry_run: false,
            debug: false,
            commands: CommandsConfig::default(),
            nodes: Vec::new(),
            queue_capacity: None,
        }
    }
}

impl SyncConfig {
    /// Create a config rooted in a scratch directory for testing.
    ///
    /// Batches live in `<root>/batches`, the checkfile is `<root>/enabled`
    /// (not created) and both transfer commands are `true`.
    pub fn for_testing(root: &Path, nodes: &[&str]) -> Self {
        Self {
            batch_dir: root.join("batches"),
            data_dir: root.join("data").display().to_string(),
            checkfile: Some(root.join("enabled")),
            backup_dir: None,
            scan_time_sec: 1,
            fail_time_sec: 1,
            bulk_older_than_sec: 0,
            bulk_max_batches: 100,
            push_count: 4,
            pull_count: 1,
            push_workers: 2,
            accept_status: vec![0],
            dry_run: false,
            debug: false,
            commands: CommandsConfig {
                sync_data_rec: "true".to_string(),
                sync_data_norec: "true".to_string(),
                pull_batches: None,
            },
            nodes: nodes.iter().map(|name| NodeConfig::for_testing(name)).collect(),
            queue_capacity: None,
        }
    }

    /// Parse a JSON document and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)
            .map_err(|e| SyncError::Config(format!("invalid configuration document: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SyncError::io("read", path, e))?;
        Self::from_json(&raw)
    }

    /// Check that the document is complete enough to run.
    pub fn validate(&self) -> Result<()> {
        if self.commands.sync_data_rec.trim().is_empty()
            || self.commands.sync_data_norec.trim().is_empty()
        {
            return Err(SyncError::Config("Sync data command not configured".to_string()));
        }
        if self.bulk_max_batches == 0 {
            return Err(SyncError::Config("bulk_max_batches must be at least 1".to_string()));
        }
        if self.push_count == 0 || self.pull_count == 0 {
            return Err(SyncError::Config(
                "push_count and pull_count must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == Some(0) {
            return Err(SyncError::Config("queue_capacity must be at least 1".to_string()));
        }
        if self.push_workers == 0 {
            return Err(SyncError::Config("push_workers must be at least 1".to_string()));
        }
        if self.accept_status.is_empty() {
            return Err(SyncError::Config("accept_status must not be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.name.is_empty() || node.name.contains('/') || node.name.contains('_') {
                return Err(SyncError::Config(format!("invalid node name '{}'", node.name)));
            }
            if !seen.insert(node.name.as_str()) {
                return Err(SyncError::Config(format!("duplicate node '{}'", node.name)));
            }
            if node.bulk_max_batches == Some(0) {
                return Err(SyncError::Config(format!(
                    "bulk_max_batches for '{}' must be at least 1",
                    node.name
                )));
            }
        }
        Ok(())
    }

    /// Node names in configuration order.
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    /// Look up a node by name.
    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Whether `other` describes the same ordered node set.
    pub fn same_topology(&self, other: &SyncConfig) -> bool {
        self.node_names() == other.node_names()
    }

    /// Bulk cap for a node: its override or the global default.
    pub fn bulk_max_for(&self, name: &str) -> usize {
        self.node(name)
            .and_then(|n| n.bulk_max_batches)
            .unwrap_or(self.bulk_max_batches)
    }

    /// Transfer command for a node and batch type: the node override or the global one.
    pub fn command_for<'a>(&'a self, node: &'a NodeConfig, batch_type: BatchType) -> &'a str {
        match batch_type {
            BatchType::Rec => node
                .sync_data_rec
                .as_deref()
                .filter(|c| !c.is_empty())
                .unwrap_or(&self.commands.sync_data_rec),
            BatchType::Norec => node
                .sync_data_norec
                .as_deref()
                .filter(|c| !c.is_empty())
                .unwrap_or(&self.commands.sync_data_norec),
        }
    }

    /// Task queue capacity in messages.
    ///
    /// At most `push_count` tasks plus their results are in flight for push,
    /// then the same for pull, so twice the larger budget always fits. An
    /// explicit `queue_capacity` is taken as is.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
            .unwrap_or_else(|| (2 * self.push_count.max(self.pull_count)).max(2))
    }

    /// Idle sleep between ticks.
    pub fn scan_time(&self) -> Duration {
        Duration::from_secs(self.scan_time_sec)
    }

    /// Back-off window and failure sleep.
    pub fn fail_time(&self) -> Duration {
        Duration::from_secs(self.fail_time_sec)
    }

    /// Settle age for bulk grouping.
    pub fn bulk_older_than(&self) -> Duration {
        Duration::from_secs(self.bulk_older_than_sec)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CommandsConfig: external collaborators
// ═══════════════════════════════════════════════════════════════════════════════

/// External commands, with `%b` (batch file or `-`), `%s` (source) and `%d`
/// (destination) placeholders.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Transfer command for recursive (`rec`) bulks.
    #[serde(default)]
    pub sync_data_rec: String,

    /// Transfer command for non-recursive (`norec`) bulks.
    #[serde(default)]
    pub sync_data_norec: String,

    /// Command fetching a peer's prepared batches into `pull/<node>`.
    #[serde(default)]
    pub pull_batches: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// NodeConfig: one entry per peer
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for a single peer node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node name. Also the origin tag in batch filenames.
    pub name: String,

    /// Remote data locator (`%d` on push, `%s` on pull).
    #[serde(default)]
    pub data: String,

    /// Remote batch source for the pull-source command.
    #[serde(default)]
    pub batches: Option<String>,

    /// Per-node bulk cap.
    #[serde(default)]
    pub bulk_max_batches: Option<usize>,

    /// Per-node override of the `rec` transfer command.
    #[serde(default)]
    pub sync_data_rec: Option<String>,

    /// Per-node override of the `norec` transfer command.
    #[serde(default)]
    pub sync_data_norec: Option<String>,
}

impl NodeConfig {
    /// Create a node config for testing.
    pub fn for_testing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            data: format!("{}:/srv/data", name),
            batches: None,
            bulk_max_batches: None,
            sync_data_rec: None,
            sync_data_norec: None,
        }
    }
}
