// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The scheduling loop.
//!
//! Each tick scans every ready node's push directory, then its pull
//! directory, groups the files into bulks and hands at most `push_count`
//! (resp. `pull_count`) of them to the workers. It then blocks until every
//! task it handed out has reported back, so each node has at most one task
//! in flight per mode.
//!
//! Bulks are offered round by round: first every node's first bulk, then
//! every node's second bulk, and so on. Within a round a per-mode cursor
//! rotates the starting node across calls so that a small budget does not
//! always favour the first nodes in configuration order.

use crate::batch::{self, BatchAge, BulkBuilder};
use crate::channel::{Channels, Outcome, QueueError, Task};
use crate::error::{Result, SyncError};
use crate::exec::check_liveness;
use crate::layout::{self, BatchLayout, Mode};
use crate::node::NodeTracker;
use crate::reload::ConfigHandle;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info_span, warn, Instrument};

pub struct Scheduler {
    channels: Arc<Channels>,
    config: ConfigHandle,
    nodes: NodeTracker,
    next_node: [usize; 2],
}

impl Scheduler {
    pub fn new(channels: Arc<Channels>, config: ConfigHandle) -> Self {
        Self {
            channels,
            config,
            nodes: NodeTracker::new(),
            next_node: [0; 2],
        }
    }

    /// Back-off state as seen by the scheduler.
    pub fn nodes(&self) -> &NodeTracker {
        &self.nodes
    }

    /// Scan `mode` directories and enqueue up to `to_schedule` tasks.
    ///
    /// Returns how many of the requested tasks could not be scheduled.
    pub async fn schedule_batches(&mut self, mode: Mode, to_schedule: usize) -> usize {
        let config = self.config.current();
        let layout = BatchLayout::new(&config.batch_dir);
        let now = SystemTime::now();

        // rounds[i] holds the i-th bulk of every node that has one.
        let mut rounds: Vec<Vec<Task>> = Vec::new();
        for node in &config.nodes {
            if !self.nodes.is_ready(&node.name) {
                continue;
            }
            let dir = layout.node_dir(mode, &node.name);
            let max_batches = config.bulk_max_for(&node.name);

            let names = match scan(&dir, max_batches * 2).await {
                Ok(names) => names,
                Err(e) => {
                    error!(
                        node = %node.name,
                        error = %e,
                        "Cannot open {} directory, will retry in {}",
                        mode,
                        humantime::format_duration(config.fail_time())
                    );
                    self.nodes.set_failing(&node.name, config.fail_time());
                    continue;
                }
            };

            let bulks = group(&dir, names, max_batches, now, config.bulk_older_than()).await;
            for (round, bulk) in bulks.into_iter().enumerate() {
                if rounds.len() <= round {
                    rounds.push(Vec::new());
                }
                rounds[round].push(Task::new(node.name.clone(), bulk.batches));
            }
        }

        let cursor = &mut self.next_node[mode.index()];
        let mut remaining = to_schedule;
        let mut scheduled: HashSet<String> = HashSet::new();

        'rounds: for round in &rounds {
            for _ in 0..round.len() {
                if remaining == 0 {
                    break 'rounds;
                }
                let task = &round[*cursor % round.len()];
                *cursor = cursor.wrapping_add(1);

                if scheduled.contains(&task.node) {
                    continue;
                }
                match self.channels.send_task(mode, task.clone()) {
                    Ok(()) => {
                        debug!(node = %task.node, batches = task.batches.len(), "Scheduled {} task", mode);
                        crate::metrics::record_task_scheduled(mode.as_str(), &task.node, task.batches.len());
                        scheduled.insert(task.node.clone());
                        remaining -= 1;
                    }
                    Err(e) => {
                        error!(node = %task.node, error = %e, "Error scheduling {} task", mode);
                        crate::metrics::record_schedule_failure(mode.as_str(), &task.node);
                    }
                }
            }
        }
        remaining
    }

    /// Collect `count` results, backing off every node that failed.
    pub async fn wait_complete(&mut self, count: usize) -> Result<()> {
        let fail_time = self.config.current().fail_time();
        let mut received = 0;
        while received < count {
            match self.channels.receive_result().await {
                Ok(result) => {
                    received += 1;
                    if result.outcome == Outcome::Fail {
                        warn!(
                            node = %result.node,
                            "Task failed, node backing off for {}",
                            humantime::format_duration(fail_time)
                        );
                        self.nodes.set_failing(&result.node, fail_time);
                    }
                }
                Err(QueueError::Closed) => return Err(SyncError::Shutdown),
                Err(e) => error!(error = %e, "Error waiting completion from queue"),
            }
        }
        Ok(())
    }

    /// One scheduling pass over both modes.
    ///
    /// Returns how long to sleep before the next pass: zero if any work was
    /// scheduled, the scan interval if idle, the failure interval if the
    /// daemon is switched off.
    pub async fn tick(&mut self) -> Result<Duration> {
        self.config.reload();
        let config = self.config.current();

        if let Err(e) = check_liveness(config.checkfile.as_deref()).await {
            error!(error = %e, "Liveness check failed, sleeping");
            return Ok(config.fail_time());
        }

        // The queue is sized at startup; a reloaded budget may not exceed it.
        let limit = (self.channels.queue().capacity() / 2).max(1);
        let mut sleep = config.scan_time();
        for (mode, budget) in [(Mode::Push, config.push_count), (Mode::Pull, config.pull_count)] {
            if budget > limit {
                debug!(%mode, budget, limit, "Budget exceeds queue capacity, clamping");
            }
            let budget = budget.min(limit);
            let remaining = self.schedule_batches(mode, budget).await;
            let in_flight = budget - remaining;
            if in_flight > 0 {
                sleep = Duration::ZERO;
            }
            self.wait_complete(in_flight).await?;
        }
        Ok(sleep)
    }

    /// Tick forever. Returns once the channels are torn down.
    pub async fn run(mut self) {
        async move {
            loop {
                let started = Instant::now();
                let sleep = match self.tick().await {
                    Ok(sleep) => sleep,
                    Err(SyncError::Shutdown) => {
                        debug!("Channels closed, scheduler stopping");
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, "Scheduler tick failed");
                        self.config.current().fail_time()
                    }
                };
                crate::metrics::record_tick(started.elapsed(), !sleep.is_zero());
                if !sleep.is_zero() {
                    tokio::time::sleep(sleep).await;
                }
            }
        }
        .instrument(info_span!("scheduler"))
        .await
    }
}

/// Create `dir` if needed and list up to `limit` entries.
async fn scan(dir: &Path, limit: usize) -> Result<Vec<String>> {
    layout::ensure_dir(dir).await?;
    layout::list_names(dir, limit).await
}

/// Group directory entries into bulks, in listing order.
async fn group(
    dir: &Path,
    names: Vec<String>,
    max_batches: usize,
    now: SystemTime,
    settle: Duration,
) -> Vec<batch::Bulk> {
    let mut builder = BulkBuilder::new(max_batches);
    for name in names {
        let Some(batch_type) = batch::batch_type(&name) else {
            continue;
        };
        let age = match tokio::fs::metadata(dir.join(&name))
            .await
            .and_then(|m| m.modified())
        {
            Ok(mtime) => BatchAge::classify(mtime, now, settle),
            Err(e) => {
                warn!(batch = %name, error = %e, "Cannot get mtime, starting a new bulk");
                BatchAge::Unknown
            }
        };
        builder.add(name, batch_type, age);
    }
    builder.finish()
}
