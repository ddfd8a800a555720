// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Push and pull workers.
//!
//! Workers take tasks of one mode from the queue, run the transfer command
//! and report a [`TaskResult`](crate::channel::TaskResult) for every task
//! they take. File hand-off happens only after a successful transfer:
//!
//! - push: the shipped batches are deleted from `push/<node>`
//! - pull: the fetched batches are backed up, then renamed into staging
//!
//! A failed transfer leaves every file where it was, so the scheduler
//! simply offers it again after the node's back-off.

use crate::batch::{self, merge_batches};
use crate::channel::{Channels, LockError, NodeLockGuard, Outcome, QueueError, Task};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::exec::{CommandRunner, STDIN_PLACEHOLDER};
use crate::layout::{self, BatchLayout, Mode};
use crate::reload::ConfigHandle;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Run the transfer command for one bulk.
///
/// A single batch is passed by path; several batches are merged and fed
/// to the command on stdin.
pub async fn transfer(config: &SyncConfig, node: &str, batches: &[String], mode: Mode) -> Result<()> {
    let node_config = config
        .node(node)
        .ok_or_else(|| SyncError::Config(format!("Empty configuration for {}", node)))?;
    let dir = BatchLayout::new(&config.batch_dir).node_dir(mode, node);

    let mut batch_type = None;
    for name in batches {
        let parsed = batch::batch_type(name)
            .ok_or_else(|| SyncError::InvalidBatchName(dir.join(name).display().to_string()))?;
        batch_type = Some(parsed);
    }
    let batch_type =
        batch_type.ok_or_else(|| SyncError::Internal(format!("empty {} task for {}", mode, node)))?;

    let (batch_arg, input) = match batches {
        [single] => (dir.join(single).display().to_string(), Vec::new()),
        _ => {
            let mut contents = Vec::with_capacity(batches.len());
            for name in batches {
                let path = dir.join(name);
                let content = tokio::fs::read(&path)
                    .await
                    .map_err(|e| SyncError::io("read", &path, e))?;
                contents.push(content);
            }
            (STDIN_PLACEHOLDER.to_string(), merge_batches(&contents))
        }
    };

    let (source, destination) = match mode {
        Mode::Push => (config.data_dir.as_str(), node_config.data.as_str()),
        Mode::Pull => (node_config.data.as_str(), config.data_dir.as_str()),
    };
    debug!(node, batches = batches.len(), %batch_type, "Transferring {} bulk", mode);

    CommandRunner::from_config(config)
        .execute(
            config.command_for(node_config, batch_type),
            &[("%b", &batch_arg), ("%s", source), ("%d", destination)],
            &input,
        )
        .await
}

fn report(channels: &Channels, mode: Mode, node: &str, outcome: Outcome) {
    crate::metrics::record_task_result(mode.as_str(), node, outcome.as_str());
    if let Err(e) = channels.send_result(node, outcome) {
        error!(node, error = %e, "Cannot report {} result", mode);
    }
}

/// Ships bulks from `push/<node>` to the node.
pub struct PushWorker {
    id: usize,
    channels: Arc<Channels>,
    config: ConfigHandle,
}

impl PushWorker {
    pub fn new(id: usize, channels: Arc<Channels>, config: ConfigHandle) -> Self {
        Self { id, channels, config }
    }

    /// Process tasks until the queue is torn down.
    pub async fn run(mut self) {
        let span = info_span!("push", worker = self.id);
        async move {
            loop {
                self.config.reload();
                match self.channels.receive_task(Mode::Push).await {
                    Ok(task) => {
                        self.process(task).await;
                    }
                    Err(QueueError::Closed) => {
                        debug!("Queue closed, push worker stopping");
                        return;
                    }
                    Err(e) => {
                        let fail_time = self.config.current().fail_time();
                        error!(error = %e, "Cannot pop from queue, sleeping");
                        tokio::time::sleep(fail_time).await;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn lock(&self, node: &str) -> Option<NodeLockGuard> {
        loop {
            match self.channels.locks().acquire(node).await {
                Ok(guard) => return Some(guard),
                Err(LockError::Interrupted(_)) if !self.channels.is_shut_down() => {
                    let fail_time = self.config.current().fail_time();
                    info!(node, "Cannot acquire lock, will retry in {}", humantime::format_duration(fail_time));
                    tokio::time::sleep(fail_time).await;
                }
                Err(e) => {
                    error!(node, error = %e, "Cannot acquire lock");
                    return None;
                }
            }
        }
    }

    /// Transfer one bulk under the node lock and report the outcome.
    pub async fn process(&mut self, task: Task) -> Outcome {
        let config = self.config.current();
        let dir = BatchLayout::new(&config.batch_dir).node_dir(Mode::Push, &task.node);
        if let Err(e) = layout::ensure_dir(&dir).await {
            warn!(node = %task.node, error = %e, "Cannot create push directory");
        }

        let mut success = match self.lock(&task.node).await {
            Some(guard) => {
                let result = transfer(&config, &task.node, &task.batches, Mode::Push).await;
                guard.release();
                match result {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            node = %task.node,
                            error = %e,
                            "Batch push execution failed, will retry in {}",
                            humantime::format_duration(config.fail_time())
                        );
                        false
                    }
                }
            }
            None => false,
        };

        if success && !config.dry_run {
            let mut removed = 0;
            for name in &task.batches {
                match tokio::fs::remove_file(dir.join(name)).await {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        error!(node = %task.node, batch = %name, error = %e, "Could not unlink pushed batch, will be retried");
                        success = false;
                    }
                }
            }
            crate::metrics::record_batches_pushed(&task.node, removed);
        }

        let outcome = Outcome::from(success);
        report(&self.channels, Mode::Push, &task.node, outcome);
        outcome
    }
}

/// Applies bulks fetched into `pull/<node>` to local data.
pub struct PullWorker {
    channels: Arc<Channels>,
    config: ConfigHandle,
}

impl PullWorker {
    pub fn new(channels: Arc<Channels>, config: ConfigHandle) -> Self {
        Self { channels, config }
    }

    /// Process tasks until the queue is torn down.
    pub async fn run(mut self) {
        async move {
            loop {
                self.config.reload();
                match self.channels.receive_task(Mode::Pull).await {
                    Ok(task) => {
                        self.process(task).await;
                    }
                    Err(QueueError::Closed) => {
                        debug!("Queue closed, pull worker stopping");
                        return;
                    }
                    Err(e) => {
                        let fail_time = self.config.current().fail_time();
                        error!(error = %e, "Cannot pop from queue, sleeping");
                        tokio::time::sleep(fail_time).await;
                    }
                }
            }
        }
        .instrument(info_span!("pull"))
        .await
    }

    /// Apply one bulk, then move its batches into staging.
    pub async fn process(&mut self, task: Task) -> Outcome {
        let config = self.config.current();
        let tree = BatchLayout::new(&config.batch_dir);
        let dir = tree.node_dir(Mode::Pull, &task.node);
        if let Err(e) = layout::ensure_dir(&dir).await {
            warn!(node = %task.node, error = %e, "Cannot create pull directory");
        }

        if let Err(e) = transfer(&config, &task.node, &task.batches, Mode::Pull).await {
            report(&self.channels, Mode::Pull, &task.node, Outcome::Fail);
            error!(
                node = %task.node,
                error = %e,
                "Cannot sync batches, putting worker to sleep for {}",
                humantime::format_duration(config.fail_time())
            );
            tokio::time::sleep(config.fail_time()).await;
            return Outcome::Fail;
        }

        if let Some(backup_root) = &config.backup_dir {
            let backup = layout::backup_dir(backup_root, &layout::today(), Mode::Pull, &task.node);
            layout::ensure_dir_until_done(&backup, &mut self.config).await;
            for name in &task.batches {
                layout::link_until_done(&dir.join(name), &backup.join(name), &mut self.config).await;
            }
        }

        if !config.dry_run {
            for name in &task.batches {
                let target = tree.staging().join(name);
                if let Err(e) = tokio::fs::rename(dir.join(name), &target).await {
                    error!(
                        node = %task.node,
                        batch = %name,
                        error = %e,
                        "Could not move pulled batch to staging"
                    );
                    report(&self.channels, Mode::Pull, &task.node, Outcome::Fail);
                    return Outcome::Fail;
                }
            }
            crate::metrics::record_batches_promoted(&task.node, task.batches.len());
        }

        report(&self.channels, Mode::Pull, &task.node, Outcome::Success);
        Outcome::Success
    }
}
