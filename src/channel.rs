// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Inter-task channels: one typed task queue plus a per-node exclusive lock.
//!
//! All loops of the daemon share a single [`Channels`] value. The queue carries
//! three kinds of messages:
//!
//! - [`MessageKind::Push`] / [`MessageKind::Pull`]: a [`Task`] for a worker
//! - [`MessageKind::Result`]: a [`TaskResult`] back to the scheduler
//!
//! Receivers wait for a specific kind, so a push worker never sees a pull
//! task and the scheduler only ever sees results. Sending never blocks: a
//! full queue is an error, since the capacity is sized for the worst case.
//!
//! # Example
//!
//! ```rust
//! # async fn example() -> Result<(), batch_replicator::channel::QueueError> {
//! use batch_replicator::channel::{Channels, Outcome, Task};
//! use batch_replicator::layout::Mode;
//!
//! let channels = Channels::new(8, ["alpha", "beta"]);
//! channels.send_task(Mode::Push, Task::new("beta", vec!["100_alpha_1.rec.batch".into()]))?;
//!
//! let task = channels.receive_task(Mode::Push).await?;
//! channels.send_result(&task.node, Outcome::Success)?;
//! let result = channels.receive_result().await?;
//! assert_eq!(result.outcome, Outcome::Success);
//! # Ok(())
//! # }
//! ```

use crate::layout::Mode;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

// =============================================================================
// Messages
// =============================================================================

/// Message type tag used to select what a receiver waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Push,
    Pull,
    Result,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Result => "result",
        }
    }
}

impl From<Mode> for MessageKind {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Push => Self::Push,
            Mode::Pull => Self::Pull,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bulk of batches to ship for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub node: String,
    pub batches: Vec<String>,
}

impl Task {
    pub fn new(node: impl Into<String>, batches: Vec<String>) -> Self {
        Self {
            node: node.into(),
            batches,
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Fail,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
        }
    }
}

impl From<bool> for Outcome {
    fn from(success: bool) -> Self {
        if success {
            Self::Success
        } else {
            Self::Fail
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion report sent by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub node: String,
    pub outcome: Outcome,
}

/// Anything that travels through the task queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Push(Task),
    Pull(Task),
    Result(TaskResult),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Push(_) => MessageKind::Push,
            Self::Pull(_) => MessageKind::Pull,
            Self::Result(_) => MessageKind::Result,
        }
    }

    fn task(mode: Mode, task: Task) -> Self {
        match mode {
            Mode::Push => Self::Push(task),
            Mode::Pull => Self::Pull(task),
        }
    }

    fn into_task(self) -> Option<Task> {
        match self {
            Self::Push(task) | Self::Pull(task) => Some(task),
            Self::Result(_) => None,
        }
    }

    fn into_result(self) -> Option<TaskResult> {
        match self {
            Self::Result(result) => Some(result),
            _ => None,
        }
    }
}

// =============================================================================
// Task queue
// =============================================================================

/// Errors from queue operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The queue already holds `capacity` messages.
    #[error("queue full: max {capacity} messages")]
    Full { capacity: usize },

    /// The queue has been torn down.
    #[error("queue closed")]
    Closed,

    /// A receiver got a message of a kind it did not ask for.
    #[error("unexpected {0} message")]
    UnexpectedMessage(MessageKind),
}

struct QueueInner {
    messages: VecDeque<Message>,
    closed: bool,
}

/// Bounded multi-producer multi-consumer queue with typed receive.
///
/// Messages of one kind are delivered in FIFO order. Sending is non-blocking.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                messages: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a message without waiting.
    pub fn send(&self, message: Message) -> Result<(), QueueError> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(QueueError::Closed);
            }
            if inner.messages.len() >= self.capacity {
                return Err(QueueError::Full {
                    capacity: self.capacity,
                });
            }
            inner.messages.push_back(message);
            crate::metrics::set_queue_depth(inner.messages.len());
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Take the oldest message of `kind`, if any.
    pub fn try_receive(&self, kind: MessageKind) -> Result<Option<Message>, QueueError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        let message = inner
            .messages
            .iter()
            .position(|m| m.kind() == kind)
            .and_then(|pos| inner.messages.remove(pos));
        if message.is_some() {
            crate::metrics::set_queue_depth(inner.messages.len());
        }
        Ok(message)
    }

    /// Wait for the oldest message of `kind`.
    ///
    /// Returns [`QueueError::Closed`] once the queue is torn down.
    pub async fn receive(&self, kind: MessageKind) -> Result<Message, QueueError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a send between check and await is not lost.
            notified.as_mut().enable();

            if let Some(message) = self.try_receive(kind)? {
                return Ok(message);
            }
            notified.await;
        }
    }

    /// Tear the queue down and wake every receiver.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// =============================================================================
// Per-node locks
// =============================================================================

/// Errors from lock operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// No lock exists for this node.
    #[error("no lock for node {0}")]
    UnknownNode(String),

    /// The wait was interrupted because the locks were torn down.
    #[error("lock acquisition for {0} interrupted")]
    Interrupted(String),
}

/// Holding this guard means exclusive transfer rights for one node.
///
/// Dropping it releases the lock.
#[derive(Debug)]
pub struct NodeLockGuard {
    node: String,
    _permit: OwnedSemaphorePermit,
}

impl NodeLockGuard {
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Release the lock explicitly.
    pub fn release(self) {
        debug!(node = %self.node, "Released node lock");
    }
}

/// One single-permit semaphore per configured node.
///
/// The node set is fixed at creation, matching the fixed topology.
pub struct NodeLocks {
    locks: HashMap<String, Arc<Semaphore>>,
}

impl NodeLocks {
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let locks = nodes
            .into_iter()
            .map(|name| (name.into(), Arc::new(Semaphore::new(1))))
            .collect();
        Self { locks }
    }

    fn semaphore(&self, node: &str) -> Result<Arc<Semaphore>, LockError> {
        self.locks
            .get(node)
            .cloned()
            .ok_or_else(|| LockError::UnknownNode(node.to_string()))
    }

    /// Wait for exclusive access to `node`.
    pub async fn acquire(&self, node: &str) -> Result<NodeLockGuard, LockError> {
        let permit = self
            .semaphore(node)?
            .acquire_owned()
            .await
            .map_err(|_| LockError::Interrupted(node.to_string()))?;
        Ok(NodeLockGuard {
            node: node.to_string(),
            _permit: permit,
        })
    }

    /// Take the lock only if nobody holds it.
    pub fn try_acquire(&self, node: &str) -> Result<Option<NodeLockGuard>, LockError> {
        match self.semaphore(node)?.try_acquire_owned() {
            Ok(permit) => Ok(Some(NodeLockGuard {
                node: node.to_string(),
                _permit: permit,
            })),
            Err(tokio::sync::TryAcquireError::NoPermits) => Ok(None),
            Err(tokio::sync::TryAcquireError::Closed) => {
                Err(LockError::Interrupted(node.to_string()))
            }
        }
    }

    pub fn is_locked(&self, node: &str) -> bool {
        self.locks
            .get(node)
            .is_some_and(|s| s.available_permits() == 0)
    }

    /// Wake all waiters with [`LockError::Interrupted`].
    pub fn close(&self) {
        for semaphore in self.locks.values() {
            semaphore.close();
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

// =============================================================================
// Channels
// =============================================================================

/// The shared queue and locks, created once by the coordinator.
pub struct Channels {
    queue: TaskQueue,
    locks: NodeLocks,
    torn_down: AtomicBool,
}

impl Channels {
    pub fn new<I, S>(capacity: usize, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queue: TaskQueue::new(capacity),
            locks: NodeLocks::new(nodes),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Size the queue and create a lock for every configured node.
    pub fn from_config(config: &crate::config::SyncConfig) -> Self {
        Self::new(config.queue_capacity(), config.node_names())
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn locks(&self) -> &NodeLocks {
        &self.locks
    }

    pub fn send_task(&self, mode: Mode, task: Task) -> Result<(), QueueError> {
        self.queue.send(Message::task(mode, task))
    }

    pub async fn receive_task(&self, mode: Mode) -> Result<Task, QueueError> {
        let kind = MessageKind::from(mode);
        self.queue
            .receive(kind)
            .await?
            .into_task()
            .ok_or(QueueError::UnexpectedMessage(kind))
    }

    pub fn send_result(&self, node: &str, outcome: Outcome) -> Result<(), QueueError> {
        self.queue.send(Message::Result(TaskResult {
            node: node.to_string(),
            outcome,
        }))
    }

    pub async fn receive_result(&self) -> Result<TaskResult, QueueError> {
        self.queue
            .receive(MessageKind::Result)
            .await?
            .into_result()
            .ok_or(QueueError::UnexpectedMessage(MessageKind::Result))
    }

    /// Remove the queue and locks. Safe to call more than once.
    ///
    /// Returns `true` only for the call that actually tore them down.
    pub fn shutdown(&self) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.queue.close();
        self.locks.close();
        info!("Shutdown successful");
        true
    }

    pub fn is_shut_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }
}
