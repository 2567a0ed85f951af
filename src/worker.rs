//! Worker nodes and running attempts.
//!
//! Each task attempt runs as its own tokio task "on" a worker node picked
//! round-robin. The pool keeps the attempt's [`AbortHandle`] so that killing
//! the task, or removing its node, stops the body at its next suspension
//! point. An aborted attempt is observed by the executor as a worker crash.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;

use crate::error::{Error, Result};
use crate::types::{NodeId, TaskId};

/// Identifies one registered attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct AttemptId(u64);

#[derive(Debug)]
struct RunningAttempt {
    task_id: TaskId,
    node: NodeId,
    handle: AbortHandle,
}

/// Node registry, concurrency limit and kill switch for running attempts.
#[derive(Debug)]
pub struct WorkerPool {
    nodes: RwLock<Vec<NodeId>>,
    cursor: AtomicUsize,
    slots: Arc<Semaphore>,
    running: DashMap<AttemptId, RunningAttempt>,
    next_attempt: AtomicU64,
}

impl WorkerPool {
    /// Creates a pool over `nodes` allowing `max_concurrent` attempts at once.
    pub fn new(nodes: Vec<NodeId>, max_concurrent: usize) -> Self {
        Self {
            nodes: RwLock::new(nodes),
            cursor: AtomicUsize::new(0),
            slots: Arc::new(Semaphore::new(max_concurrent)),
            running: DashMap::new(),
            next_attempt: AtomicU64::new(0),
        }
    }

    /// Live worker nodes, in registration order.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.nodes.read().clone()
    }

    /// Picks the next worker node round-robin. Falls back to the owner node
    /// when no worker is left.
    pub fn pick_node(&self) -> NodeId {
        let nodes = self.nodes.read();
        if nodes.is_empty() {
            return NodeId::owner();
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % nodes.len();
        nodes[i].clone()
    }

    /// Registers a worker node. Returns `false` if it was already known.
    pub fn add_node(&self, node: NodeId) -> Result<bool> {
        if node.is_owner() {
            return Err(Error::InvalidArgument(format!(
                "node name '{node}' is reserved for the owner"
            )));
        }
        let mut nodes = self.nodes.write();
        if nodes.contains(&node) {
            return Ok(false);
        }
        nodes.push(node);
        Ok(true)
    }

    /// Removes a worker node and aborts every attempt running on it.
    ///
    /// Returns the number of aborted attempts.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for the owner node, which cannot fail.
    pub fn remove_node(&self, node: &NodeId) -> Result<usize> {
        if node.is_owner() {
            return Err(Error::InvalidArgument(
                "the owner node cannot be removed".to_string(),
            ));
        }
        // Held across the abort so no attempt can register on the node in between.
        let mut nodes = self.nodes.write();
        nodes.retain(|n| n != node);
        let killed = self.abort_where(|attempt| &attempt.node == node);
        drop(nodes);
        Ok(killed)
    }

    /// Waits for a free execution slot.
    ///
    /// # Errors
    ///
    /// [`Error::Shutdown`] once the pool was shut down.
    pub async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| Error::Shutdown)
    }

    /// Tracks a spawned attempt so it can be killed.
    ///
    /// If `node` was removed after being picked, the attempt is aborted
    /// right away and `None` is returned.
    pub(crate) fn register(
        &self,
        task_id: TaskId,
        node: NodeId,
        handle: AbortHandle,
    ) -> Option<AttemptId> {
        let nodes = self.nodes.read();
        if !node.is_owner() && !nodes.contains(&node) {
            handle.abort();
            return None;
        }
        let id = AttemptId(self.next_attempt.fetch_add(1, Ordering::Relaxed));
        self.running.insert(
            id,
            RunningAttempt {
                task_id,
                node,
                handle,
            },
        );
        drop(nodes);
        Some(id)
    }

    /// Stops tracking a finished attempt.
    pub(crate) fn unregister(&self, id: AttemptId) {
        self.running.remove(&id);
    }

    /// Aborts the running attempt(s) of `task_id`. Returns how many were hit.
    pub fn kill_task(&self, task_id: &TaskId) -> usize {
        self.abort_where(|attempt| &attempt.task_id == task_id)
    }

    /// Number of attempts currently running.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Closes the slot semaphore and aborts everything running.
    pub fn shutdown(&self) {
        self.slots.close();
        let killed = self.abort_where(|_| true);
        tracing::info!(killed, "worker pool shut down");
    }

    fn abort_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&RunningAttempt) -> bool,
    {
        let mut killed = 0;
        for attempt in self.running.iter() {
            if predicate(attempt.value()) {
                tracing::info!(
                    task_id = %attempt.task_id,
                    node = %attempt.node,
                    "aborting running attempt"
                );
                attempt.handle.abort();
                killed += 1;
            }
        }
        killed
    }
}
