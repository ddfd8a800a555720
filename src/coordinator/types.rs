//! Daemon state types.
//!
//! # State Transitions
//!
//! ```text
//!            start()                  shutdown()
//! Created ───────────→ Running ───────────────────→ ShuttingDown
//!    │                                                   │
//!    │ shutdown()                                        ↓
//!    └──────────────────────────────────────────────→ Stopped
//! ```
//!
//! - **Created**: channels exist, no task spawned yet.
//! - **Running**: relay, pull worker and push workers are running.
//! - **ShuttingDown**: tasks are being stopped and the channels torn down.
//! - **Stopped**: nothing left running. Further shutdowns are no-ops.

/// Lifecycle state of the replication daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
        }
    }
}
