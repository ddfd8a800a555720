//! Node readiness and back-off tracking.
//!
//! Every loop that talks to nodes owns its own [`NodeTracker`]. A node is
//! `Ready` unless a failure put it into back-off; the back-off expires lazily
//! the next time [`NodeTracker::is_ready`] is asked about it.
//!
//! ```text
//!            set_failing                  now > until (is_ready)
//!   Ready ──────────────────► Backoff ─────────────────────────► Ready
//!     │                                                            ▲
//!     └──────── set_waiting ──► Waiting ───────────────────────────┘
//! ```

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Readiness of a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Eligible for work.
    Ready,
    /// Skipped until `until` after a failure.
    Backoff { until: Instant },
    /// Skipped until `until` after an idle scan. No loop sets this state
    /// today; it is kept for scan throttling.
    Waiting { until: Instant },
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Backoff { .. } => "backoff",
            Self::Waiting { .. } => "waiting",
        }
    }

    fn until(&self) -> Option<Instant> {
        match self {
            Self::Ready => None,
            Self::Backoff { until } | Self::Waiting { until } => Some(*until),
        }
    }
}

/// Per-loop view of which nodes may receive work.
#[derive(Debug, Default)]
pub struct NodeTracker {
    states: HashMap<String, NodeState>,
}

impl NodeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `node` may be worked on now.
    ///
    /// An expired back-off or wait is cleared as a side effect.
    pub fn is_ready(&mut self, node: &str) -> bool {
        let now = Instant::now();
        match self.states.get(node).and_then(NodeState::until) {
            None => true,
            Some(until) if now <= until => false,
            Some(_) => {
                self.states.remove(node);
                debug!(node, "Node ready again");
                true
            }
        }
    }

    /// Put `node` into back-off for `fail_time`.
    pub fn set_failing(&mut self, node: &str, fail_time: Duration) {
        let until = Instant::now() + fail_time;
        self.states
            .insert(node.to_string(), NodeState::Backoff { until });
        crate::metrics::record_node_backoff(node);
    }

    /// Hold `node` until `scan_time` has passed.
    pub fn set_waiting(&mut self, node: &str, scan_time: Duration) {
        let until = Instant::now() + scan_time;
        self.states
            .insert(node.to_string(), NodeState::Waiting { until });
    }

    /// Stored state, without expiring it.
    pub fn state(&self, node: &str) -> NodeState {
        self.states.get(node).copied().unwrap_or(NodeState::Ready)
    }

    pub fn clear(&mut self, node: &str) {
        self.states.remove(node);
    }

    /// Number of nodes currently held back.
    pub fn held_count(&self) -> usize {
        self.states.len()
    }
}
