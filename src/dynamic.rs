//! Dynamic return resolution.
//!
//! A task submitted with [`ReturnMode::Dynamic`](crate::types::ReturnMode)
//! hands back one wrapper reference at submission. While that wrapper's
//! entry is alive it holds one local count on every output the task mints
//! (and on the trailing error reference of a raised task), so nothing is
//! collected before the caller had a chance to resolve it.
//!
//! Resolving waits for the task to end and returns [`DynamicRefs`]: fresh
//! handles to exactly the outputs produced, in order. Resolving again
//! returns the same sequence.

use std::sync::Arc;

use crate::error::{Error, ObjectError, Result};
use crate::executor::TaskEntry;
use crate::refcount::{RefHandle, RefKind, ReferenceCounter};
use crate::runtime::Runtime;
use crate::types::{HolderState, ObjectRef, TerminalOutcome};

/// The ordered outputs of a dynamic-mode task.
///
/// Each handle carries its own local count; dropping the `DynamicRefs` (or
/// individual handles) releases them one by one.
///
/// Iteration is single-pass. To iterate again, resolve the wrapper again.
#[derive(Debug, Clone)]
pub struct DynamicRefs {
    wrapper: ObjectRef,
    refs: Vec<RefHandle>,
}

impl DynamicRefs {
    /// The wrapper these references were resolved from.
    pub fn wrapper(&self) -> ObjectRef {
        self.wrapper
    }

    /// Number of references.
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Returns `true` for an empty generator.
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Handle at position `index`.
    pub fn get(&self, index: usize) -> Option<&RefHandle> {
        self.refs.get(index)
    }

    /// Iterates over the handles without consuming them.
    pub fn iter(&self) -> std::slice::Iter<'_, RefHandle> {
        self.refs.iter()
    }

    /// The referenced identities, in order.
    pub fn ids(&self) -> Vec<ObjectRef> {
        self.refs.iter().map(RefHandle::id).collect()
    }

    /// Takes the handles.
    pub fn into_vec(self) -> Vec<RefHandle> {
        self.refs
    }
}

impl IntoIterator for DynamicRefs {
    type Item = RefHandle;
    type IntoIter = std::vec::IntoIter<RefHandle>;

    fn into_iter(self) -> Self::IntoIter {
        self.refs.into_iter()
    }
}

/// Waits for the task behind `wrapper` to end and hands out its outputs.
///
/// # Errors
///
/// - [`Error::NotDynamicWrapper`] for a plain output reference.
/// - [`Error::UnknownReference`] if the task or the wrapper is gone.
/// - [`ObjectError::WorkerCrashed`] if the task's worker died.
/// - [`ObjectError::ReconstructionMismatch`] if a re-execution invalidated
///   the task's outputs.
pub(crate) async fn resolve(runtime: &Runtime, wrapper: ObjectRef) -> Result<DynamicRefs> {
    if !wrapper.is_dynamic_wrapper() {
        return Err(Error::NotDynamicWrapper(wrapper));
    }
    let inner = runtime.inner();
    let entry = inner.task_entry(&wrapper.task_id())?;

    loop {
        let mut progress = entry.subscribe();
        {
            let state = entry.state.lock();
            if let Some(err) = &state.invalidated {
                return Err(err.clone().into());
            }
            if let Some(outcome) = &state.terminal {
                if let TerminalOutcome::Failed(err @ ObjectError::WorkerCrashed { .. }) = outcome {
                    return Err(err.clone().into());
                }
                if state.holder != HolderState::Active {
                    return Err(Error::UnknownReference(wrapper));
                }

                let ids = state.held_refs();
                let refs = ids
                    .into_iter()
                    .map(|id| RefHandle::new(Arc::clone(&inner.counter), id))
                    .collect();
                return Ok(DynamicRefs { wrapper, refs });
            }
        }
        tracing::debug!(task_id = %wrapper.task_id(), "waiting for dynamic task to finish");
        if progress.changed().await.is_err() {
            return Err(Error::Shutdown);
        }
    }
}

/// Releases the wrapper's holds on the task's outputs. Called once the
/// wrapper entry itself was collected.
pub(crate) fn release_wrapper_holds(counter: &ReferenceCounter, entry: &TaskEntry) {
    let held = {
        let mut state = entry.state.lock();
        if state.holder != HolderState::Active {
            return;
        }
        state.holder = HolderState::Released;
        state.held_refs()
    };

    tracing::debug!(task_id = %entry.task_id(), outputs = held.len(), "dynamic wrapper released");
    for id in held {
        if let Err(e) = counter.decrement(&id, RefKind::Local) {
            tracing::error!(object = %id, error = %e, "failed to release wrapper hold");
        }
    }
}
