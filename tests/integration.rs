// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests for the batch replicator.
//!
//! Every test runs against a scratch directory tree and plain `/bin/sh`
//! commands, so no external services are required.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//! - `relay_*` - staging fan-out and pull-source fetches
//! - `schedule_*` - scheduler ticks with live workers
//! - `daemon_*` - the full daemon from start to shutdown

mod common;

use batch_replicator::{
    Mode, NodeState, Relay, ReplicationDaemon, Scheduler, SyncConfig,
};
use common::{age, eventually, Sandbox};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// =============================================================================
// Relay
// =============================================================================

#[tokio::test]
async fn relay_links_to_every_other_node() {
    let sb = Sandbox::new(&["alpha", "beta"]);
    sb.stage("100_alpha_1.rec.batch", "/a\n");

    let mut relay = Relay::new(sb.handle());
    assert_eq!(relay.link_local_batches().await.unwrap(), 1);

    assert_eq!(sb.list(Mode::Push, "beta"), vec!["100_alpha_1.rec.batch"]);
    assert!(sb.list(Mode::Push, "alpha").is_empty());
    assert!(sb.staged().is_empty());
}

#[tokio::test]
async fn relay_processes_staging_in_name_order() {
    let sb = Sandbox::new(&["alpha", "beta", "gamma"]);
    sb.stage("2_beta_1.norec.batch", "/2\n");
    sb.stage("1_gamma_1.rec.batch", "/1\n");
    sb.stage("3_alpha_1.rec.batch", "/3\n");

    let mut relay = Relay::new(sb.handle());
    assert_eq!(relay.link_local_batches().await.unwrap(), 3);

    assert_eq!(sb.list(Mode::Push, "alpha"), vec!["1_gamma_1.rec.batch", "2_beta_1.norec.batch"]);
    assert_eq!(sb.list(Mode::Push, "beta"), vec!["1_gamma_1.rec.batch", "3_alpha_1.rec.batch"]);
    assert_eq!(sb.list(Mode::Push, "gamma"), vec!["2_beta_1.norec.batch", "3_alpha_1.rec.batch"]);
}

#[tokio::test]
async fn relay_fetches_from_pull_sources() {
    let mut sb = Sandbox::new(&["alpha", "beta"]);
    let remote = sb.root().join("remote-beta");
    std::fs::create_dir_all(&remote).unwrap();
    std::fs::write(remote.join("9_beta_1.rec.batch"), "/r\n").unwrap();

    sb.config.commands.pull_batches = Some("mv %s/* %d/".to_string());
    sb.config.nodes[1].batches = Some(remote.display().to_string());

    let mut relay = Relay::new(sb.handle());
    relay.pull_remote_batches().await;

    assert_eq!(sb.list(Mode::Pull, "beta"), vec!["9_beta_1.rec.batch"]);
    assert_eq!(relay.nodes().state("beta"), NodeState::Ready);
}

// =============================================================================
// Scheduling with live workers
// =============================================================================

#[tokio::test]
async fn schedule_caps_bulk_and_deletes_pushed_batches() {
    let mut sb = Sandbox::new(&["alpha", "beta"]);
    sb.config.bulk_max_batches = 3;
    sb.config.commands.sync_data_norec = sb.recording_command();
    for i in 1..=5 {
        sb.put(Mode::Push, "beta", &format!("{}_alpha_1.norec.batch", i), &format!("/f{}\n", i));
    }

    let channels = sb.channels();
    let workers = sb.spawn_workers(&channels, 1);
    let mut scheduler = Scheduler::new(Arc::clone(&channels), sb.handle());

    assert_eq!(scheduler.schedule_batches(Mode::Push, 1).await, 0);
    scheduler.wait_complete(1).await.unwrap();

    assert_eq!(sb.list(Mode::Push, "beta").len(), 2);
    let log = sb.log();
    assert!(log.starts_with("DEST beta:/srv/data\n"));
    assert_eq!(log.lines().filter(|l| l.starts_with("/f")).count(), 3);

    channels.shutdown();
    for handle in workers {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn schedule_failure_backs_node_off_and_keeps_files() {
    let mut sb = Sandbox::new(&["alpha", "beta"]);
    sb.config.fail_time_sec = 60;
    sb.config.commands.sync_data_rec = "exit 12".to_string();
    sb.put(Mode::Push, "beta", "1_alpha_1.rec.batch", "/a\n");

    let channels = sb.channels();
    let _workers = sb.spawn_workers(&channels, 2);
    let mut scheduler = Scheduler::new(Arc::clone(&channels), sb.handle());

    scheduler.tick().await.unwrap();
    assert!(matches!(scheduler.nodes().state("beta"), NodeState::Backoff { .. }));
    assert_eq!(sb.list(Mode::Push, "beta"), vec!["1_alpha_1.rec.batch"]);

    // Still inside the window: nothing is offered.
    assert_eq!(scheduler.schedule_batches(Mode::Push, 4).await, 4);
    channels.shutdown();
}

#[tokio::test]
async fn schedule_dry_run_keeps_files() {
    let mut sb = Sandbox::new(&["alpha", "beta"]);
    sb.config.dry_run = true;
    let marker = sb.root().join("ran");
    sb.config.commands.sync_data_rec = format!("touch {}", marker.display());
    sb.put(Mode::Push, "beta", "1_alpha_1.rec.batch", "/a\n");
    sb.put(Mode::Pull, "alpha", "1_alpha_2.rec.batch", "/b\n");

    let channels = sb.channels();
    let _workers = sb.spawn_workers(&channels, 1);
    let mut scheduler = Scheduler::new(Arc::clone(&channels), sb.handle());

    assert_eq!(scheduler.tick().await.unwrap(), Duration::ZERO);
    assert!(!marker.exists());
    assert_eq!(sb.list(Mode::Push, "beta"), vec!["1_alpha_1.rec.batch"]);
    assert_eq!(sb.list(Mode::Pull, "alpha"), vec!["1_alpha_2.rec.batch"]);
    assert!(sb.staged().is_empty());
    channels.shutdown();
}

#[tokio::test]
async fn schedule_pull_moves_batches_to_staging() {
    let mut sb = Sandbox::new(&["alpha", "beta"]);
    sb.config.commands.sync_data_rec = sb.recording_command();
    sb.put(Mode::Pull, "beta", "5_beta_1.rec.batch", "/p1\n");
    sb.put(Mode::Pull, "beta", "6_beta_1.rec.batch", "/p2\n");

    let channels = sb.channels();
    let _workers = sb.spawn_workers(&channels, 1);
    let mut scheduler = Scheduler::new(Arc::clone(&channels), sb.handle());

    assert_eq!(scheduler.schedule_batches(Mode::Pull, 1).await, 0);
    scheduler.wait_complete(1).await.unwrap();

    assert!(sb.list(Mode::Pull, "beta").is_empty());
    assert_eq!(sb.staged(), vec!["5_beta_1.rec.batch", "6_beta_1.rec.batch"]);
    // Pull applies into the local data root.
    assert!(sb.log().starts_with(&format!("DEST {}\n", sb.config.data_dir)));
    channels.shutdown();
}

#[tokio::test]
async fn schedule_fresh_batches_ship_alone() {
    let mut sb = Sandbox::new(&["alpha", "beta"]);
    sb.config.bulk_older_than_sec = 30;
    sb.put(Mode::Push, "beta", "1_alpha_1.rec.batch", "/a\n");
    sb.put(Mode::Push, "beta", "2_alpha_1.rec.batch", "/b\n");

    let channels = sb.channels();
    let mut scheduler = Scheduler::new(Arc::clone(&channels), sb.handle());
    assert_eq!(scheduler.schedule_batches(Mode::Push, 1).await, 0);

    let task = channels.receive_task(Mode::Push).await.unwrap();
    assert_eq!(task.batches.len(), 1);
}

#[tokio::test]
async fn schedule_settled_batches_share_a_bulk() {
    let mut sb = Sandbox::new(&["alpha", "beta"]);
    sb.config.bulk_older_than_sec = 30;
    for name in ["1_alpha_1.rec.batch", "2_alpha_1.rec.batch"] {
        let path = sb.put(Mode::Push, "beta", name, "/x\n");
        age(&path, Duration::from_secs(300));
    }

    let channels = sb.channels();
    let mut scheduler = Scheduler::new(Arc::clone(&channels), sb.handle());
    assert_eq!(scheduler.schedule_batches(Mode::Push, 1).await, 0);

    let mut task = channels.receive_task(Mode::Push).await.unwrap();
    task.batches.sort();
    assert_eq!(task.batches, vec!["1_alpha_1.rec.batch", "2_alpha_1.rec.batch"]);
}

#[tokio::test]
async fn schedule_skips_everything_without_checkfile() {
    let mut sb = Sandbox::new(&["alpha", "beta"]);
    sb.config.fail_time_sec = 3;
    sb.put(Mode::Push, "beta", "1_alpha_1.rec.batch", "/a\n");
    sb.disable();

    let channels = sb.channels();
    let mut scheduler = Scheduler::new(Arc::clone(&channels), sb.handle());
    assert_eq!(scheduler.tick().await.unwrap(), Duration::from_secs(3));
    assert!(channels.queue().is_empty());
}

// =============================================================================
// Full daemon
// =============================================================================

#[tokio::test]
async fn daemon_replicates_staged_batch_end_to_end() {
    let mut sb = Sandbox::new(&["alpha", "beta", "gamma"]);
    sb.config.commands.sync_data_rec = sb.recording_command();
    sb.config.scan_time_sec = 1;
    sb.stage("100_alpha_1.rec.batch", "/shared/file\n");

    let (_tx, rx) = watch::channel(sb.config.clone());
    let mut daemon = ReplicationDaemon::new(sb.config.clone(), rx).unwrap();
    let trigger = daemon.shutdown_trigger();
    let run = tokio::spawn(async move {
        daemon.run().await.unwrap();
        daemon
    });

    let delivered = eventually(Duration::from_secs(10), || {
        let log = sb.log();
        log.contains("DEST beta:/srv/data") && log.contains("DEST gamma:/srv/data")
    })
    .await;
    assert!(delivered, "log: {}", sb.log());
    assert!(
        eventually(Duration::from_secs(5), || {
            sb.list(Mode::Push, "beta").is_empty() && sb.list(Mode::Push, "gamma").is_empty()
        })
        .await
    );
    assert!(sb.staged().is_empty());
    assert!(!sb.log().contains("DEST alpha:"));

    trigger.trigger();
    let daemon = run.await.unwrap();
    assert!(daemon.channels().is_shut_down());
}

#[tokio::test]
async fn daemon_picks_up_reloaded_commands() {
    let mut sb = Sandbox::new(&["alpha", "beta"]);
    sb.config.commands.sync_data_rec = "exit 1".to_string();
    sb.config.fail_time_sec = 1;
    sb.config.scan_time_sec = 1;
    sb.put(Mode::Push, "beta", "1_alpha_1.rec.batch", "/a\n");

    let (tx, rx) = watch::channel(sb.config.clone());
    let mut daemon = ReplicationDaemon::new(sb.config.clone(), rx).unwrap();
    let trigger = daemon.shutdown_trigger();
    let run = tokio::spawn(async move { daemon.run().await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sb.list(Mode::Push, "beta"), vec!["1_alpha_1.rec.batch"]);

    let mut fixed: SyncConfig = sb.config.clone();
    fixed.commands.sync_data_rec = "true".to_string();
    tx.send_replace(fixed);

    assert!(eventually(Duration::from_secs(10), || sb.list(Mode::Push, "beta").is_empty()).await);

    trigger.trigger();
    run.await.unwrap().unwrap();
}
