// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the system handles failures gracefully without panics,
//! deadlocks, or lost batches.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use batch_replicator::channel::{Channels, Outcome, QueueError, Task};
use batch_replicator::{Mode, NodeState, PullWorker, PushWorker, Relay, Scheduler};
use common::{eventually, Sandbox};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

// =============================================================================
// Per-node mutual exclusion
// =============================================================================

/// Test: concurrent push workers never transfer to the same node at once
#[tokio::test]
async fn push_workers_serialize_per_node() {
    let mut sb = Sandbox::new(&["alpha", "beta"]);
    let marker = sb.root().join("busy");
    let overlaps = sb.root().join("overlaps");
    // Fails loudly if another transfer for the node is already running.
    sb.config.commands.sync_data_rec = format!(
        "if [ -e {m} ]; then echo overlap >> {o}; fi; touch {m}; sleep 0.05; rm -f {m}",
        m = marker.display(),
        o = overlaps.display()
    );
    for i in 0..8 {
        sb.put(Mode::Push, "beta", &format!("{}_alpha_1.rec.batch", i), "/a\n");
    }

    let channels = sb.channels();
    let _workers = sb.spawn_workers(&channels, 4);
    for i in 0..8 {
        channels
            .send_task(Mode::Push, Task::new("beta", vec![format!("{}_alpha_1.rec.batch", i)]))
            .unwrap();
    }

    let mut successes = 0;
    for _ in 0..8 {
        if channels.receive_result().await.unwrap().outcome == Outcome::Success {
            successes += 1;
        }
    }
    assert_eq!(successes, 8);
    assert!(!overlaps.exists(), "transfers overlapped for one node");
    assert!(sb.list(Mode::Push, "beta").is_empty());
    channels.shutdown();
}

/// Test: different nodes are transferred in parallel
#[tokio::test]
async fn push_workers_run_nodes_in_parallel() {
    let mut sb = Sandbox::new(&["alpha", "beta", "gamma"]);
    sb.config.commands.sync_data_rec = "sleep 0.3".to_string();
    sb.put(Mode::Push, "beta", "1_alpha_1.rec.batch", "/a\n");
    sb.put(Mode::Push, "gamma", "1_alpha_1.rec.batch", "/a\n");

    let channels = sb.channels();
    let _workers = sb.spawn_workers(&channels, 2);
    let started = std::time::Instant::now();
    channels
        .send_task(Mode::Push, Task::new("beta", vec!["1_alpha_1.rec.batch".into()]))
        .unwrap();
    channels
        .send_task(Mode::Push, Task::new("gamma", vec!["1_alpha_1.rec.batch".into()]))
        .unwrap();
    channels.receive_result().await.unwrap();
    channels.receive_result().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(550));
    channels.shutdown();
}

// =============================================================================
// Shutdown and teardown
// =============================================================================

/// Test: a worker blocked on a held lock exits once the locks are torn down
#[tokio::test]
async fn worker_waiting_on_lock_stops_at_shutdown() {
    let sb = Sandbox::new(&["alpha", "beta"]);
    sb.put(Mode::Push, "beta", "1_alpha_1.rec.batch", "/a\n");
    let channels = sb.channels();
    let held = channels.locks().acquire("beta").await.unwrap();

    let mut worker = PushWorker::new(0, Arc::clone(&channels), sb.handle());
    let task = tokio::spawn(async move {
        worker
            .process(Task::new("beta", vec!["1_alpha_1.rec.batch".into()]))
            .await
    });
    sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());

    channels.shutdown();
    let outcome = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, Outcome::Fail);
    // Nothing was shipped, so nothing was deleted.
    assert_eq!(sb.list(Mode::Push, "beta"), vec!["1_alpha_1.rec.batch"]);
    drop(held);
}

/// Test: many concurrent shutdown calls tear down exactly once
#[tokio::test]
async fn concurrent_shutdown_is_idempotent() {
    let channels = Arc::new(Channels::new(8, ["alpha", "beta"]));
    let torn_down = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let channels = Arc::clone(&channels);
        let torn_down = Arc::clone(&torn_down);
        handles.push(tokio::spawn(async move {
            if channels.shutdown() {
                torn_down.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(torn_down.load(Ordering::SeqCst), 1);
    assert_eq!(channels.receive_result().await, Err(QueueError::Closed));
}

/// Test: a misconfigured tiny queue rejects instead of blocking the scheduler
#[tokio::test]
async fn full_queue_does_not_block_scheduler() {
    let mut sb = Sandbox::new(&["a", "b", "c", "d"]);
    sb.config.queue_capacity = Some(2);
    for node in ["a", "b", "c", "d"] {
        sb.put(Mode::Push, node, "1_x_1.rec.batch", "/f\n");
    }

    let channels = sb.channels();
    let mut scheduler = Scheduler::new(Arc::clone(&channels), sb.handle());
    let remaining = tokio::time::timeout(
        Duration::from_secs(2),
        scheduler.schedule_batches(Mode::Push, 4),
    )
    .await
    .unwrap();
    assert_eq!(remaining, 2);
    assert_eq!(channels.queue().len(), 2);
}

// =============================================================================
// Filesystem faults
// =============================================================================

/// Test: a push directory that cannot be created backs the node off
#[tokio::test]
async fn unreadable_push_dir_backs_off_node() {
    let mut sb = Sandbox::new(&["alpha", "beta"]);
    sb.config.fail_time_sec = 60;
    // A plain file where the mode directory should be.
    std::fs::write(sb.config.batch_dir.join("push"), "not a dir").unwrap();

    let channels = sb.channels();
    let mut scheduler = Scheduler::new(Arc::clone(&channels), sb.handle());
    assert_eq!(scheduler.schedule_batches(Mode::Push, 2).await, 2);
    assert!(matches!(scheduler.nodes().state("alpha"), NodeState::Backoff { .. }));
    assert!(matches!(scheduler.nodes().state("beta"), NodeState::Backoff { .. }));
}

/// Test: the relay retries a blocked link instead of dropping the batch
#[tokio::test]
async fn relay_retries_until_destination_is_writable() {
    let mut sb = Sandbox::new(&["alpha", "beta"]);
    sb.config.fail_time_sec = 1;
    sb.stage("100_alpha_1.rec.batch", "/a\n");
    let push_root = sb.config.batch_dir.join("push");
    std::fs::write(&push_root, "blocker").unwrap();

    let mut relay = Relay::new(sb.handle());
    let run = tokio::spawn(async move { relay.link_local_batches().await });

    sleep(Duration::from_millis(300)).await;
    assert!(!run.is_finished());
    // Batch is still in staging while the link keeps failing.
    assert_eq!(sb.staged(), vec!["100_alpha_1.rec.batch"]);

    std::fs::remove_file(&push_root).unwrap();
    let relayed = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(relayed, 1);
    assert_eq!(sb.list(Mode::Push, "beta"), vec!["100_alpha_1.rec.batch"]);
    assert!(sb.staged().is_empty());
}

/// Test: a batch deleted behind the worker's back fails the task, not the worker
#[tokio::test]
async fn vanished_batch_fails_task_only() {
    let sb = Sandbox::new(&["alpha", "beta"]);
    let channels = sb.channels();
    let _workers = sb.spawn_workers(&channels, 1);

    channels
        .send_task(
            Mode::Push,
            Task::new("beta", vec!["1_alpha_1.rec.batch".into(), "2_alpha_1.rec.batch".into()]),
        )
        .unwrap();
    assert_eq!(channels.receive_result().await.unwrap().outcome, Outcome::Fail);

    // The worker is still alive and serves the next task.
    sb.put(Mode::Push, "beta", "3_alpha_1.rec.batch", "/c\n");
    channels
        .send_task(Mode::Push, Task::new("beta", vec!["3_alpha_1.rec.batch".into()]))
        .unwrap();
    assert_eq!(channels.receive_result().await.unwrap().outcome, Outcome::Success);
    assert!(
        eventually(Duration::from_secs(1), || sb.list(Mode::Push, "beta").is_empty()).await
    );
    channels.shutdown();
}

/// Test: removing the checkfile stops transfers without losing batches
#[tokio::test]
async fn disabled_checkfile_fails_transfer_and_keeps_batch() {
    let sb = Sandbox::new(&["alpha", "beta"]);
    sb.put(Mode::Push, "beta", "1_alpha_1.rec.batch", "/a\n");
    sb.disable();

    let channels = sb.channels();
    let mut worker = PushWorker::new(0, Arc::clone(&channels), sb.handle());
    let outcome = worker
        .process(Task::new("beta", vec!["1_alpha_1.rec.batch".into()]))
        .await;
    assert_eq!(outcome, Outcome::Fail);
    assert_eq!(sb.list(Mode::Push, "beta"), vec!["1_alpha_1.rec.batch"]);
}

/// Test: a pushed batch that cannot be unlinked fails the whole task
#[tokio::test]
async fn push_unlink_failure_fails_task() {
    let mut sb = Sandbox::new(&["alpha", "beta"]);
    // Ships fine, then leaves a non-empty directory where the batch was.
    sb.config.commands.sync_data_rec = "rm %b && mkdir %b && touch %b/x".to_string();
    sb.put(Mode::Push, "beta", "1_alpha_1.rec.batch", "/a\n");

    let channels = sb.channels();
    let mut worker = PushWorker::new(0, Arc::clone(&channels), sb.handle());
    let outcome = worker
        .process(Task::new("beta", vec!["1_alpha_1.rec.batch".into()]))
        .await;

    assert_eq!(outcome, Outcome::Fail);
    assert_eq!(channels.receive_result().await.unwrap().outcome, Outcome::Fail);
    // Left in place for the next attempt.
    assert_eq!(sb.list(Mode::Push, "beta"), vec!["1_alpha_1.rec.batch"]);
    assert!(!channels.locks().is_locked("beta"));
}

/// Test: a blocked promotion stops the bulk but keeps what already moved
#[tokio::test]
async fn pull_rename_failure_keeps_promoted_batches() {
    let sb = Sandbox::new(&["alpha", "beta"]);
    sb.put(Mode::Pull, "beta", "1_beta_1.rec.batch", "/a\n");
    sb.put(Mode::Pull, "beta", "2_beta_1.rec.batch", "/b\n");
    // A non-empty directory in staging cannot be replaced by a rename.
    let blocker = sb.config.batch_dir.join("2_beta_1.rec.batch");
    std::fs::create_dir_all(blocker.join("x")).unwrap();

    let channels = sb.channels();
    let mut worker = PullWorker::new(Arc::clone(&channels), sb.handle());
    let outcome = worker
        .process(Task::new(
            "beta",
            vec!["1_beta_1.rec.batch".into(), "2_beta_1.rec.batch".into()],
        ))
        .await;

    assert_eq!(outcome, Outcome::Fail);
    assert_eq!(channels.receive_result().await.unwrap().outcome, Outcome::Fail);
    let promoted = sb.config.batch_dir.join("1_beta_1.rec.batch");
    assert_eq!(std::fs::read_to_string(promoted).unwrap(), "/a\n");
    assert_eq!(sb.list(Mode::Pull, "beta"), vec!["2_beta_1.rec.batch"]);
    assert!(blocker.is_dir());
}
