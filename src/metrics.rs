//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Task scheduling and completion per node and mode
//! - Node back-off events
//! - Relay and promotion throughput
//! - External command latency and outcome
//! - Queue depth and configuration reloads
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `batch_replicator_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No exporter is installed by the library; without a recorder every call is a no-op.
//!
//! # Usage
//!
//! ```rust,no_run
//! use batch_replicator::metrics;
//! use std::time::Duration;
//!
//! metrics::record_task_scheduled("push", "beta", 3);
//! metrics::record_command(Duration::from_millis(250), true);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Scheduling
// =============================================================================

/// Record a task handed to the workers.
pub fn record_task_scheduled(mode: &str, node: &str, batches: usize) {
    counter!("batch_replicator_tasks_scheduled_total", "mode" => mode.to_string(), "node" => node.to_string()).increment(1);
    histogram!("batch_replicator_bulk_size", "mode" => mode.to_string()).record(batches as f64);
}

/// Record a task that could not be enqueued.
pub fn record_schedule_failure(mode: &str, node: &str) {
    counter!("batch_replicator_schedule_failures_total", "mode" => mode.to_string(), "node" => node.to_string()).increment(1);
}

/// Record a task completion reported by a worker.
pub fn record_task_result(mode: &str, node: &str, outcome: &str) {
    counter!(
        "batch_replicator_task_results_total",
        "mode" => mode.to_string(),
        "node" => node.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a node entering back-off.
pub fn record_node_backoff(node: &str) {
    counter!("batch_replicator_node_backoffs_total", "node" => node.to_string()).increment(1);
}

/// Record current number of messages in the task queue.
pub fn set_queue_depth(depth: usize) {
    gauge!("batch_replicator_queue_depth").set(depth as f64);
}

/// Record time spent in one scheduler tick.
pub fn record_tick(duration: Duration, idle: bool) {
    let kind = if idle { "idle" } else { "busy" };
    histogram!("batch_replicator_tick_duration_seconds", "kind" => kind).record(duration.as_secs_f64());
}

// =============================================================================
// Filesystem hand-off
// =============================================================================

/// Record a staging batch fanned out to every other node.
pub fn record_batch_relayed(origin: &str) {
    counter!("batch_replicator_batches_relayed_total", "origin" => origin.to_string()).increment(1);
}

/// Record a link that had to be retried.
pub fn record_link_retry() {
    counter!("batch_replicator_link_retries_total").increment(1);
}

/// Record batches removed after a successful push.
pub fn record_batches_pushed(node: &str, count: usize) {
    counter!("batch_replicator_batches_pushed_total", "node" => node.to_string()).increment(count as u64);
}

/// Record pulled batches moved into staging.
pub fn record_batches_promoted(node: &str, count: usize) {
    counter!("batch_replicator_batches_promoted_total", "node" => node.to_string()).increment(count as u64);
}

/// Record a pull-source fetch for a node.
pub fn record_remote_fetch(node: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("batch_replicator_remote_fetches_total", "node" => node.to_string(), "status" => status).increment(1);
}

// =============================================================================
// Commands
// =============================================================================

/// Record an external command run.
pub fn record_command(duration: Duration, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("batch_replicator_commands_total", "status" => status).increment(1);
    histogram!("batch_replicator_command_duration_seconds").record(duration.as_secs_f64());
}

/// Record a command that did not consume its whole stdin.
pub fn record_stdin_mismatch() {
    counter!("batch_replicator_stdin_mismatches_total").increment(1);
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Record a configuration reload attempt.
pub fn record_config_reload(applied: bool) {
    let status = if applied { "applied" } else { "rejected" };
    counter!("batch_replicator_config_reloads_total", "status" => status).increment(1);
}

/// Record daemon state as a numeric gauge.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("batch_replicator_engine_state").set(value);
}
