//! # Batch Replicator
//!
//! Asynchronous filesystem replication between a fixed set of nodes.
//!
//! Some other component drops *batch files* (lists of changed paths) into a
//! staging directory. This crate fans each batch out to a per-node push
//! directory, fetches batches produced by other nodes into per-node pull
//! directories, and drives an operator-supplied transfer command for each
//! of them.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                         batch-replicator                              │
//! │                                                                       │
//! │  ┌─────────┐   link    ┌─────────────┐  Task   ┌──────────────────┐   │
//! │  │ staging │─────────► │ push/<node> │───────► │ PushWorker × N   │   │
//! │  └─────────┘  (Relay)  └─────────────┘         │ (per-node lock)  │   │
//! │       ▲                       ▲                └──────────────────┘   │
//! │       │ rename         scan   │                         │ TaskResult  │
//! │  ┌─────────────┐       ┌─────────────┐                ▼             │
//! │  │ PullWorker  │◄──────│  Scheduler  │◄──────── results + back-off   │
//! │  └─────────────┘ Task  └─────────────┘                               │
//! │       ▲                       │ scan                                 │
//! │       └─────────────── pull/<node> ◄── Relay (pull-source command)    │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each loop is a tokio task with its own configuration snapshot and its own
//! node back-off state. They share only [`Channels`]: one bounded task queue
//! and one exclusive lock per node.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use batch_replicator::{ReplicationDaemon, SyncConfig};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> batch_replicator::Result<()> {
//!     let config = SyncConfig::load("config.json".as_ref()).await?;
//!     let (_tx, rx) = watch::channel(config.clone());
//!
//!     let mut daemon = ReplicationDaemon::new(config, rx)?;
//!     // Runs until the shutdown trigger fires
//!     daemon.run().await
//! }
//! ```

pub mod batch;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod exec;
pub mod layout;
pub mod metrics;
pub mod node;
pub mod relay;
pub mod reload;
pub mod scheduler;
pub mod worker;

// Re-exports for convenience
pub use batch::{BatchType, Bulk, BulkBuilder};
pub use channel::{Channels, Outcome, Task, TaskResult};
pub use config::{CommandsConfig, NodeConfig, SyncConfig};
pub use coordinator::{EngineState, ReplicationDaemon, ShutdownTrigger};
pub use error::{Result, SyncError};
pub use exec::CommandRunner;
pub use layout::{BatchLayout, Mode};
pub use node::{NodeState, NodeTracker};
pub use relay::Relay;
pub use reload::{ConfigHandle, ConfigWatcher};
pub use scheduler::Scheduler;
pub use worker::{PullWorker, PushWorker};
