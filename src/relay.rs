// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The enqueue/relay loop.
//!
//! Two jobs, run back to back every iteration:
//!
//! 1. [`Relay::link_local_batches`] fans each batch in staging out to
//!    `push/<node>` for every node except the batch's origin, then removes
//!    it from staging.
//! 2. [`Relay::pull_remote_batches`] runs the pull-source command for every
//!    ready node that has a batch source, filling `pull/<node>`.
//!
//! Links are retried until they succeed: a batch leaves staging only once
//! every destination has its own hard link.

use crate::batch;
use crate::error::Result;
use crate::exec::{check_liveness, CommandRunner};
use crate::layout::{self, BatchLayout, Mode};
use crate::node::NodeTracker;
use crate::reload::ConfigHandle;
use std::time::Duration;
use tracing::{debug, error, info_span, warn, Instrument};

pub struct Relay {
    config: ConfigHandle,
    nodes: NodeTracker,
}

impl Relay {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            nodes: NodeTracker::new(),
        }
    }

    /// Back-off state of pull sources.
    pub fn nodes(&self) -> &NodeTracker {
        &self.nodes
    }

    /// Fan staging batches out to the push directories.
    ///
    /// Returns how many batches left staging.
    pub async fn link_local_batches(&mut self) -> Result<usize> {
        let config = self.config.current();
        if config.nodes.is_empty() {
            return Ok(0);
        }
        let tree = BatchLayout::new(&config.batch_dir);
        let staging = tree.staging();

        let mut names = layout::list_names(staging, usize::MAX).await?;
        names.sort();

        let mut relayed = 0;
        for name in names {
            let Some(origin) = batch::origin_node(&name) else {
                continue;
            };
            let src = staging.join(&name);
            let date = layout::today();

            for node in config.nodes.iter().filter(|n| n.name != origin) {
                let dst = tree.node_dir(Mode::Push, &node.name).join(&name);
                layout::link_until_done(&src, &dst, &mut self.config).await;

                if let Some(backup_root) = &config.backup_dir {
                    let backup = layout::backup_dir(backup_root, &date, Mode::Push, &node.name);
                    layout::link_until_done(&src, &backup.join(&name), &mut self.config).await;
                }
            }

            match tokio::fs::remove_file(&src).await {
                Ok(()) => {
                    debug!(batch = %name, origin, "Relayed batch");
                    crate::metrics::record_batch_relayed(origin);
                    relayed += 1;
                }
                Err(e) => {
                    error!(batch = %name, error = %e, "Could not unlink relayed batch, will be retried");
                }
            }
        }
        Ok(relayed)
    }

    /// Fetch batches from every ready node with a configured source.
    ///
    /// Failures only back off the node concerned.
    pub async fn pull_remote_batches(&mut self) {
        let config = self.config.current();
        let Some(command) = config.commands.pull_batches.as_deref().filter(|c| !c.is_empty()) else {
            return;
        };
        let runner = CommandRunner::from_config(&config);
        let tree = BatchLayout::new(&config.batch_dir);

        for node in &config.nodes {
            let Some(source) = node.batches.as_deref().filter(|s| !s.is_empty()) else {
                continue;
            };
            if !self.nodes.is_ready(&node.name) {
                continue;
            }

            let dir = tree.node_dir(Mode::Pull, &node.name);
            let result = match layout::ensure_dir(&dir).await {
                Ok(()) => {
                    let dir_arg = dir.display().to_string();
                    runner
                        .execute(command, &[("%s", source), ("%d", &dir_arg)], &[])
                        .await
                }
                Err(e) => Err(e),
            };

            crate::metrics::record_remote_fetch(&node.name, result.is_ok());
            match result {
                Ok(()) => debug!(node = %node.name, "Pulled batches"),
                Err(e) => {
                    warn!(
                        node = %node.name,
                        error = %e,
                        "Pull batches failed, will retry in {}",
                        humantime::format_duration(config.fail_time())
                    );
                    self.nodes.set_failing(&node.name, config.fail_time());
                }
            }
        }
    }

    /// One relay iteration. Returns how long to sleep afterwards.
    pub async fn tick(&mut self) -> Duration {
        self.config.reload();
        let config = self.config.current();

        if let Err(e) = check_liveness(config.checkfile.as_deref()).await {
            warn!(error = %e, "Liveness check failed, not relaying");
            return config.fail_time();
        }

        if let Err(e) = self.link_local_batches().await {
            error!(error = %e, "Relay failed");
            return config.fail_time();
        }
        self.pull_remote_batches().await;
        config.scan_time()
    }

    /// Relay forever.
    pub async fn run(mut self) {
        async move {
            loop {
                let sleep = self.tick().await;
                tokio::time::sleep(sleep).await;
            }
        }
        .instrument(info_span!("relay"))
        .await
    }
}
