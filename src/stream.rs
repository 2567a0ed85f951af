//! Caller-side streaming of generator outputs.
//!
//! An [`ObjectRefStream`] is what a task submitted with
//! [`ReturnMode::StreamingIterator`](crate::types::ReturnMode) hands back.
//! It is lazy and single-pass: [`next_ref`](ObjectRefStream::next_ref) waits
//! for the next output to be committed and returns it without waiting for
//! the rest of the task.
//!
//! The stream keeps one local count on every output minted but not yet
//! handed out. Dropping it early releases those counts and stops holding
//! outputs produced afterwards; it never waits for the producer.

use std::fmt;
use std::sync::Arc;

use futures::Stream;

use crate::executor::TaskEntry;
use crate::refcount::{RefHandle, RefKind};
use crate::runtime::Runtime;
use crate::types::{HolderState, ObjectRef, TaskId};

/// Pull-based sequence of a streaming task's output references.
///
/// After the last output, a task that raised (or whose worker crashed)
/// yields one more reference that resolves to the failure. Then the stream
/// ends.
pub struct ObjectRefStream {
    runtime: Runtime,
    entry: Arc<TaskEntry>,
    done: bool,
}

impl ObjectRefStream {
    pub(crate) fn new(runtime: Runtime, entry: Arc<TaskEntry>) -> Self {
        Self {
            runtime,
            entry,
            done: false,
        }
    }

    /// The producing task.
    pub fn task_id(&self) -> TaskId {
        self.entry.task_id()
    }

    /// Outputs handed out so far.
    pub fn surfaced(&self) -> u32 {
        self.entry.state.lock().surfaced
    }

    /// Waits for the next output reference.
    ///
    /// Returns `None` once the task has ended and every reference it minted
    /// was handed out.
    pub async fn next_ref(&mut self) -> Option<RefHandle> {
        if self.done {
            return None;
        }

        loop {
            let mut progress = self.entry.subscribe();
            {
                let mut state = self.entry.state.lock();
                if let Some(next) = state.next_surfaceable() {
                    state.surfaced = next + 1;
                    let id: ObjectRef = state.output_ref(next);
                    // The hold added at commit time moves into the handle.
                    return Some(RefHandle::adopt(
                        Arc::clone(&self.runtime.inner().counter),
                        id,
                    ));
                }
                if state.is_terminal() {
                    self.done = true;
                    return None;
                }
            }
            if progress.changed().await.is_err() {
                self.done = true;
                return None;
            }
        }
    }

    /// Adapts the stream to [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = RefHandle> + Send + 'static {
        futures::stream::unfold(self, |mut stream| async move {
            let next = stream.next_ref().await;
            next.map(|handle| (handle, stream))
        })
    }
}

impl Drop for ObjectRefStream {
    fn drop(&mut self) {
        let unsurfaced: Vec<ObjectRef> = {
            let mut state = self.entry.state.lock();
            if state.holder != HolderState::Active {
                return;
            }
            state.holder = HolderState::Released;
            let surfaced = state.surfaced;
            state
                .held_refs()
                .into_iter()
                .filter(|id| id.output_index() >= surfaced)
                .collect()
        };

        if !unsurfaced.is_empty() {
            tracing::debug!(
                task_id = %self.entry.task_id(),
                released = unsurfaced.len(),
                "stream dropped with unconsumed outputs"
            );
        }
        let counter = &self.runtime.inner().counter;
        for id in unsurfaced {
            if let Err(e) = counter.decrement(&id, RefKind::Local) {
                tracing::error!(object = %id, error = %e, "failed to release stream hold");
            }
        }
    }
}

impl fmt::Debug for ObjectRefStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRefStream")
            .field("task_id", &self.task_id())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
