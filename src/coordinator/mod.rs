// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication daemon coordinator.
//!
//! Ties together:
//! - The shared [`Channels`] (task queue and per-node locks)
//! - The relay loop ([`Relay`])
//! - One pull worker and `push_workers` push workers
//! - The scheduler, which runs on the caller's task
//!
//! Every loop gets its own configuration handle fed by the same watch
//! channel, and its own node back-off state. Only the channels are shared.
//!
//! # Shutdown
//!
//! [`ReplicationDaemon::shutdown`] aborts the spawned loops and then tears
//! the channels down. Aborting a worker mid-transfer kills its child command;
//! the batch files stay where they were and are retried after restart.

mod types;

pub use types::EngineState;

use crate::channel::Channels;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::relay::Relay;
use crate::reload::ConfigHandle;
use crate::scheduler::Scheduler;
use crate::worker::{PullWorker, PushWorker};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Requests shutdown of a running daemon from another task.
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// The scheduler plus every loop it hands work to.
pub struct ReplicationDaemon {
    /// Configuration at startup
    config: SyncConfig,

    /// Runtime config updates
    config_rx: watch::Receiver<SyncConfig>,

    /// Queue and locks shared by every loop
    channels: Arc<Channels>,

    /// Daemon state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,

    /// Relay and worker task handles
    handles: Vec<JoinHandle<()>>,
}

impl ReplicationDaemon {
    /// Validate `config` and create the channels.
    ///
    /// The daemon starts in `Created` state.
    pub fn new(config: SyncConfig, config_rx: watch::Receiver<SyncConfig>) -> Result<Self> {
        config.validate()?;
        if config.commands.pull_batches.is_none() {
            warn!("No pull batches command configured, pull is disabled");
        }

        let channels = Arc::new(Channels::from_config(&config));
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        metrics::set_engine_state("Created");

        Ok(Self {
            config,
            config_rx,
            channels,
            state_tx,
            state_rx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            handles: Vec::new(),
        })
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    pub fn channels(&self) -> &Arc<Channels> {
        &self.channels
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    fn handle(&self) -> ConfigHandle {
        ConfigHandle::new(self.config.clone(), self.config_rx.clone())
    }

    fn set_state(&self, state: EngineState) {
        self.state_tx.send_replace(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Spawn the relay, the pull worker and the push workers.
    pub fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(SyncError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            nodes = self.config.nodes.len(),
            push_workers = self.config.push_workers,
            queue_capacity = self.channels.queue().capacity(),
            dry_run = self.config.dry_run,
            "Starting batch replicator"
        );

        self.handles.push(tokio::spawn(Relay::new(self.handle()).run()));
        self.handles
            .push(tokio::spawn(PullWorker::new(Arc::clone(&self.channels), self.handle()).run()));
        for id in 0..self.config.push_workers {
            let worker = PushWorker::new(id, Arc::clone(&self.channels), self.handle());
            self.handles.push(tokio::spawn(worker.run()));
        }
        debug!(tasks = self.handles.len(), "Spawned loops");

        self.set_state(EngineState::Running);
        Ok(())
    }

    /// Start if needed, then schedule until a shutdown is triggered.
    pub async fn run(&mut self) -> Result<()> {
        if self.state() == EngineState::Created {
            self.start()?;
        }

        let scheduler = Scheduler::new(Arc::clone(&self.channels), self.handle().reporting_errors());
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = scheduler.run() => {
                warn!("Scheduler stopped unexpectedly");
            }
            _ = async { shutdown_rx.wait_for(|stop| *stop).await.is_ok() } => {
                info!("Shutdown requested");
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop every loop and tear the channels down. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if matches!(self.state(), EngineState::Stopped | EngineState::ShuttingDown) {
            return;
        }
        info!("Shutting down batch replicator");
        self.set_state(EngineState::ShuttingDown);
        self.shutdown_tx.send_replace(true);

        let handles = std::mem::take(&mut self.handles);
        for handle in &handles {
            handle.abort();
        }
        for (i, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(()) => debug!(task = i, "Task completed"),
                Err(e) if e.is_cancelled() => debug!(task = i, "Task stopped"),
                Err(e) => warn!(task = i, error = %e, "Task panicked"),
            }
        }

        self.channels.shutdown();
        self.set_state(EngineState::Stopped);
        info!("Batch replicator stopped");
    }
}
