//! The opaque reference to one task output.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{OwnerId, TaskId};

/// Globally unique, immutable handle to a single task output.
///
/// A reference names an output; it never owns the payload. Two references
/// are equal exactly when they name the same output of the same task,
/// regardless of what the payload is.
///
/// The dynamic wrapper of a task is a distinct reference (`is_dynamic_wrapper`
/// set, index 0) that resolves to the list of the task's output references.
///
/// This type carries no count. The counted, application-visible handle is
/// [`RefHandle`](crate::refcount::RefHandle).
///
/// # Examples
///
/// ```
/// use refgen::types::{ObjectRef, OwnerId, TaskId};
///
/// let owner = OwnerId::new();
/// let task = TaskId::new();
/// let a = ObjectRef::output(owner, task, 3);
/// let b = ObjectRef::output(owner, task, 3);
/// assert_eq!(a, b);
/// assert_ne!(a, ObjectRef::dynamic_wrapper(owner, task));
/// assert_eq!(a.output_index(), 3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    owner_id: OwnerId,
    task_id: TaskId,
    output_index: u32,
    is_dynamic_wrapper: bool,
}

impl ObjectRef {
    /// Reference to output `index` of `task`.
    pub fn output(owner_id: OwnerId, task_id: TaskId, index: u32) -> Self {
        Self {
            owner_id,
            task_id,
            output_index: index,
            is_dynamic_wrapper: false,
        }
    }

    /// The wrapper reference of a dynamic-mode task.
    pub fn dynamic_wrapper(owner_id: OwnerId, task_id: TaskId) -> Self {
        Self {
            owner_id,
            task_id,
            output_index: 0,
            is_dynamic_wrapper: true,
        }
    }

    /// The context that owns this reference's bookkeeping.
    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    /// The producing task.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Position in the task's output sequence. Always 0 for a wrapper.
    pub fn output_index(&self) -> u32 {
        self.output_index
    }

    /// Returns `true` for a dynamic wrapper reference.
    pub fn is_dynamic_wrapper(&self) -> bool {
        self.is_dynamic_wrapper
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dynamic_wrapper {
            write!(f, "{}/dynamic", self.task_id)
        } else {
            write!(f, "{}/{}", self.task_id, self.output_index)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn identity_is_owner_task_index_and_kind() {
        let owner = OwnerId::new();
        let task = TaskId::new();
        let refs: HashSet<ObjectRef> = [
            ObjectRef::output(owner, task, 0),
            ObjectRef::output(owner, task, 0),
            ObjectRef::output(owner, task, 1),
            ObjectRef::output(owner, TaskId::new(), 0),
            ObjectRef::dynamic_wrapper(owner, task),
        ]
        .into_iter()
        .collect();
        assert_eq!(refs.len(), 4);
    }

    #[test]
    fn display_distinguishes_wrapper() {
        let owner = OwnerId::new();
        let task = TaskId::new();
        assert_eq!(
            ObjectRef::output(owner, task, 7).to_string(),
            format!("{task}/7")
        );
        assert_eq!(
            ObjectRef::dynamic_wrapper(owner, task).to_string(),
            format!("{task}/dynamic")
        );
    }

    #[test]
    fn ordering_follows_output_index_within_a_task() {
        let owner = OwnerId::new();
        let task = TaskId::new();
        let mut refs: Vec<_> = (0..5).rev().map(|i| ObjectRef::output(owner, task, i)).collect();
        refs.sort();
        let indices: Vec<u32> = refs.iter().map(ObjectRef::output_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }
}
