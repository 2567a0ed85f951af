//! Reference table and count tracking.
//!
//! Every reference an owner mints gets a [`ReferenceCountEntry`] in the
//! [`ReferenceCounter`]. Two kinds of hold keep it alive:
//!
//! - **local**: a [`RefHandle`] reachable from application code, or an
//!   internal holder (a dynamic wrapper or a stream) keeping an output for
//!   a caller that has not received it yet;
//! - **submitted**: the reference is an argument of a task whose lineage is
//!   still retained.
//!
//! When both counts of an entry reach zero, [`ReferenceCounter::decrement`]
//! queues a release notification. The runtime's collector drains the queue,
//! removes the entry if it is still releasable and releases the payload.
//! Deletion is therefore asynchronous: callers observing the table (tests
//! in particular) must poll rather than expect the entry to vanish on the
//! decrement that emptied it.
//!
//! Counts never go negative. A decrement of a zero count is a bookkeeping
//! defect and fails with [`Error::RefCountUnderflow`].

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::types::{ObjectRef, TaskId};

/// Which count a hold is tracked under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    /// Application-visible handle (or internal holder on its behalf).
    Local,
    /// Dependency of a submitted task.
    Submitted,
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Submitted => write!(f, "submitted"),
        }
    }
}

/// Counts recorded for one reference.
///
/// # Examples
///
/// ```
/// use refgen::refcount::ReferenceCountEntry;
///
/// let entry = ReferenceCountEntry::default();
/// assert!(entry.is_releasable());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceCountEntry {
    /// Application-visible holds.
    pub local_count: u32,
    /// Holds implied by outstanding task dependencies.
    pub submitted_count: u32,
    /// Whether the payload has been committed.
    pub is_finished: bool,
}

impl ReferenceCountEntry {
    /// Both counts are zero.
    pub fn is_releasable(&self) -> bool {
        self.local_count == 0 && self.submitted_count == 0
    }

    fn count_mut(&mut self, kind: RefKind) -> &mut u32 {
        match kind {
            RefKind::Local => &mut self.local_count,
            RefKind::Submitted => &mut self.submitted_count,
        }
    }
}

/// The owner's table of reference counts.
///
/// All mutations go through `DashMap` shard locks, so concurrent consumers
/// and producers never interleave inside one entry's update.
#[derive(Debug)]
pub struct ReferenceCounter {
    entries: DashMap<ObjectRef, ReferenceCountEntry>,
    per_task: DashMap<TaskId, usize>,
    release_tx: mpsc::UnboundedSender<ObjectRef>,
}

impl ReferenceCounter {
    /// Creates an empty table and the receiving end of its release queue.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ObjectRef>) {
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        let counter = Self {
            entries: DashMap::new(),
            per_task: DashMap::new(),
            release_tx,
        };
        (counter, release_rx)
    }

    /// Adds a local hold, creating the entry if needed.
    pub fn add_local(&self, id: ObjectRef) {
        match self.entries.entry(id) {
            Entry::Occupied(mut entry) => entry.get_mut().local_count += 1,
            Entry::Vacant(entry) => {
                entry.insert(ReferenceCountEntry {
                    local_count: 1,
                    ..Default::default()
                });
                *self.per_task.entry(id.task_id()).or_insert(0) += 1;
            },
        }
    }

    /// Adds a hold on an existing entry.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownReference`] if the reference has no entry, i.e. it
    /// was already released or was never minted here.
    pub fn increment(&self, id: &ObjectRef, kind: RefKind) -> Result<ReferenceCountEntry> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or(Error::UnknownReference(*id))?;
        *entry.count_mut(kind) += 1;
        Ok(*entry)
    }

    /// Removes a hold and returns the updated counts.
    ///
    /// When both counts reach zero the reference is queued for release.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownReference`] if the reference has no entry.
    /// - [`Error::RefCountUnderflow`] if the count is already zero.
    pub fn decrement(&self, id: &ObjectRef, kind: RefKind) -> Result<ReferenceCountEntry> {
        let snapshot = {
            let mut entry = self
                .entries
                .get_mut(id)
                .ok_or(Error::UnknownReference(*id))?;
            let count = entry.count_mut(kind);
            if *count == 0 {
                tracing::error!(object = %id, kind = %kind, "reference count underflow");
                return Err(Error::RefCountUnderflow { object: *id, kind });
            }
            *count -= 1;
            *entry
        };

        if snapshot.is_releasable() {
            tracing::debug!(object = %id, "reference released, queued for collection");
            // A closed queue means the runtime is gone; nothing is left to release.
            let _ = self.release_tx.send(*id);
        }
        Ok(snapshot)
    }

    /// Current `(local, submitted)` counts, if the entry exists.
    pub fn get_counts(&self, id: &ObjectRef) -> Option<(u32, u32)> {
        self.entries
            .get(id)
            .map(|entry| (entry.local_count, entry.submitted_count))
    }

    /// Full entry for `id`, if it exists.
    pub fn get(&self, id: &ObjectRef) -> Option<ReferenceCountEntry> {
        self.entries.get(id).map(|entry| *entry)
    }

    /// Records that the payload for `id` has been committed.
    pub fn mark_finished(&self, id: &ObjectRef) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.is_finished = true;
        }
    }

    /// Snapshot of every live entry.
    pub fn live_entries(&self) -> HashMap<ObjectRef, ReferenceCountEntry> {
        self.entries
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no entry is live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` if `id` has a live entry.
    pub fn contains(&self, id: &ObjectRef) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of live entries minted by `task_id` (outputs and wrapper).
    pub fn task_ref_count(&self, task_id: &TaskId) -> usize {
        self.per_task.get(task_id).map(|n| *n).unwrap_or(0)
    }

    /// Removes the entry for `id` if it is still releasable.
    ///
    /// A hold re-added between the notification and collection keeps the
    /// entry alive. Returns `true` if the entry was removed by this call.
    pub(crate) fn remove_if_releasable(&self, id: &ObjectRef) -> bool {
        if self
            .entries
            .remove_if(id, |_, entry| entry.is_releasable())
            .is_none()
        {
            return false;
        }

        let task_id = id.task_id();
        if let Some(mut n) = self.per_task.get_mut(&task_id) {
            *n = n.saturating_sub(1);
        }
        self.per_task.remove_if(&task_id, |_, n| *n == 0);
        true
    }
}

/// A counted handle to one output (or a dynamic wrapper).
///
/// Holding a `RefHandle` keeps one local count on the reference. Cloning
/// adds one; dropping removes one. Dereferences to the underlying
/// [`ObjectRef`].
pub struct RefHandle {
    id: ObjectRef,
    counter: Arc<ReferenceCounter>,
}

impl RefHandle {
    /// Adds a local hold on `id` and wraps it.
    pub(crate) fn new(counter: Arc<ReferenceCounter>, id: ObjectRef) -> Self {
        counter.add_local(id);
        Self { id, counter }
    }

    /// Wraps a local hold that was already added on the caller's behalf.
    pub(crate) fn adopt(counter: Arc<ReferenceCounter>, id: ObjectRef) -> Self {
        Self { id, counter }
    }

    /// The referenced identity.
    pub fn id(&self) -> ObjectRef {
        self.id
    }
}

impl Deref for RefHandle {
    type Target = ObjectRef;

    fn deref(&self) -> &ObjectRef {
        &self.id
    }
}

impl Clone for RefHandle {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.counter), self.id)
    }
}

impl Drop for RefHandle {
    fn drop(&mut self) {
        if let Err(e) = self.counter.decrement(&self.id, RefKind::Local) {
            tracing::error!(object = %self.id, error = %e, "failed to release reference handle");
        }
    }
}

impl PartialEq for RefHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RefHandle {}

impl std::hash::Hash for RefHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for RefHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefHandle").field(&self.id).finish()
    }
}
