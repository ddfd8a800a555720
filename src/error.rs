// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the batch replicator.
//!
//! Errors are grouped by the fault class they belong to. The class decides
//! how the calling loop reacts: back off a node, sleep the failure interval,
//! retry forever, or give up on a queue operation.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Config` | No | Configuration invalid or incomplete |
//! | `NodeSetChanged` | No | Reload tried to change the node topology |
//! | `CheckfileMissing` | Yes | Liveness checkfile absent (soft fault) |
//! | `Io` | Yes | Directory, link, rename or unlink failure |
//! | `InvalidBatchName` | No | Batch filename outside the naming grammar |
//! | `Queue` | No | Task queue full or torn down |
//! | `Lock` | Yes | Per-node lock acquisition interrupted |
//! | `Spawn` | Yes | External command could not be started |
//! | `CommandFailed` | Yes | External command exited with a rejected status |
//! | `InvalidState` | No | Lifecycle call in the wrong daemon state |
//! | `Shutdown` | No | Channels are being torn down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Retryable errors never destroy state: the batch files involved stay where
//! they are and the next tick picks them up again. Non-retryable errors point
//! at a misconfiguration or a bug and need operator attention.

use crate::channel::{LockError, QueueError};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for replicator operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while scheduling or shipping batches.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid or missing configuration.
    ///
    /// Logged and retried on the next reload, never fatal for a running loop.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A reload tried to add, remove or reorder nodes.
    ///
    /// The topology is fixed for the lifetime of the daemon.
    #[error("Nodes cannot change at runtime")]
    NodeSetChanged,

    /// The liveness checkfile does not exist.
    #[error("Checkfile {} does not exist", path.display())]
    CheckfileMissing { path: PathBuf },

    /// Filesystem operation failure.
    #[error("I/O error ({operation} {}): {source}", path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A batch filename does not follow the naming grammar.
    #[error("Invalid batch filename format {0}")]
    InvalidBatchName(String),

    /// Task queue failure.
    ///
    /// A full queue means the capacity is misconfigured; it is not retried.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Per-node lock failure.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// The external command could not be spawned.
    #[error("Unable to execute {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The external command exited with a status outside the accepted set.
    #[error("Command '{command}' exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    /// Operation not valid in the daemon's current state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Wrap an I/O error with the operation and path it happened on.
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::NodeSetChanged => false,
            Self::CheckfileMissing { .. } => true, // soft fault
            Self::Io { .. } => true,
            Self::InvalidBatchName(_) => false,
            Self::Queue(_) => false, // capacity bug or teardown
            Self::Lock(LockError::Interrupted(_)) => true,
            Self::Lock(LockError::UnknownNode(_)) => false,
            Self::Spawn { .. } => true,
            Self::CommandFailed { .. } => true,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}
