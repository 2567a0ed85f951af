//! Task specifications and lineage records.
//!
//! A [`LineageRecord`] is what the owner keeps so that a task can be run
//! again: the [`TaskSpec`] it was submitted with, the references it depends
//! on, and how many outputs it delivered. It lives from submission until no
//! reference the task minted can be requested any more.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, ObjectError};
use crate::executor::GeneratorFn;
use crate::types::{ObjectRef, ReturnMode, TaskId};

/// One argument of a submitted task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TaskArg {
    /// An inline value.
    Value(Value),
    /// Another task's output, or a dynamic wrapper. Resolved before the body
    /// runs.
    Ref(ObjectRef),
}

/// Per-task retry policy.
///
/// # Examples
///
/// ```
/// use refgen::domain::TaskOptions;
///
/// let options = TaskOptions::default();
/// assert_eq!(options.max_retries, None);
/// assert!(!options.retry_exceptions);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Re-executions allowed for this task. `None` uses the runtime default.
    pub max_retries: Option<u32>,
    /// Whether a raise (not only a crash) is retried.
    pub retry_exceptions: bool,
}

/// Everything needed to run a task, again if necessary.
#[derive(Clone)]
pub struct TaskSpec {
    /// The task.
    pub task_id: TaskId,
    /// Name used in logs.
    pub name: String,
    /// The body.
    pub function: Arc<dyn GeneratorFn>,
    /// Arguments, in order.
    pub args: Vec<TaskArg>,
    /// Declared return mode.
    pub return_mode: ReturnMode,
    /// Retry policy.
    pub options: TaskOptions,
}

impl TaskSpec {
    /// Reference arguments, one entry per occurrence.
    pub fn ref_args(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.args.iter().filter_map(|arg| match arg {
            TaskArg::Ref(id) => Some(*id),
            TaskArg::Value(_) => None,
        })
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("task_id", &self.task_id)
            .field("name", &self.name)
            .field("args", &self.args)
            .field("return_mode", &self.return_mode)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Reconstruction lifecycle of a task's lineage.
///
/// # State Machine
///
/// ```text
/// Live -> Reconstructing, ReconstructionFailed, Abandoned
/// Reconstructing -> Live, ReconstructionFailed, Abandoned
/// ReconstructionFailed -> Abandoned
/// Abandoned -> (terminal, no transitions)
/// ```
///
/// `Live -> ReconstructionFailed` happens without a re-execution when the
/// retry budget is already spent.
///
/// # Examples
///
/// ```
/// use refgen::domain::ReconstructionState;
///
/// assert!(ReconstructionState::Live.can_transition_to(&ReconstructionState::Reconstructing));
/// assert!(!ReconstructionState::Abandoned.can_transition_to(&ReconstructionState::Live));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum ReconstructionState {
    /// Lineage retained; outputs are either reachable or recoverable.
    Live,
    /// A re-execution is running.
    Reconstructing,
    /// Recovery failed for good; unreachable outputs resolve to the error.
    ReconstructionFailed(ObjectError),
    /// Nothing the task minted can be requested any more.
    Abandoned,
}

impl fmt::Display for ReconstructionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Reconstructing => write!(f, "reconstructing"),
            Self::ReconstructionFailed(_) => write!(f, "reconstruction_failed"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

impl ReconstructionState {
    /// Returns `true` if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Abandoned)
    }

    /// Returns `true` if moving from this state to `next` is valid.
    /// Self-transitions are rejected.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        match self {
            Self::Live => matches!(
                next,
                Self::Reconstructing | Self::ReconstructionFailed(_) | Self::Abandoned
            ),
            Self::Reconstructing => matches!(
                next,
                Self::Live | Self::ReconstructionFailed(_) | Self::Abandoned
            ),
            Self::ReconstructionFailed(_) => matches!(next, Self::Abandoned),
            Self::Abandoned => false,
        }
    }

    /// Validates a transition, returning [`Error::InvalidTransition`] if it
    /// is not allowed.
    pub fn validate_transition(&self, task_id: TaskId, next: &Self) -> Result<(), Error> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                task_id,
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

/// Retained lineage of one task.
#[derive(Debug, Clone)]
pub struct LineageRecord {
    /// How to run the task again.
    pub task_spec: Arc<TaskSpec>,
    /// Distinct references the task depends on.
    pub dependencies: BTreeSet<ObjectRef>,
    /// Outputs delivered by the original run. `None` until it ends.
    pub original_output_count: Option<u32>,
    /// Outputs known to be recoverable. Lowered when a lenient re-execution
    /// produces fewer.
    pub last_known_output_count: Option<u32>,
    /// Reconstruction lifecycle.
    pub state: ReconstructionState,
    /// Re-executions still allowed.
    pub retries_remaining: u32,
    /// Re-executions consumed so far.
    pub retries_used: u32,
    /// When the task was submitted.
    pub created_at: DateTime<Utc>,
}

impl LineageRecord {
    /// Creates a `Live` record with a budget of `max_retries` re-executions.
    pub fn new(task_spec: Arc<TaskSpec>, max_retries: u32) -> Self {
        let dependencies = task_spec.ref_args().collect();
        Self {
            task_spec,
            dependencies,
            original_output_count: None,
            last_known_output_count: None,
            state: ReconstructionState::Live,
            retries_remaining: max_retries,
            retries_used: 0,
            created_at: Utc::now(),
        }
    }

    /// The task this lineage belongs to.
    pub fn task_id(&self) -> TaskId {
        self.task_spec.task_id
    }

    /// Moves to `next` after validating the transition.
    pub fn transition(&mut self, next: ReconstructionState) -> Result<(), Error> {
        self.state.validate_transition(self.task_id(), &next)?;
        self.state = next;
        Ok(())
    }

    /// Consumes one unit of the retry budget. Returns `false` if none is left.
    pub fn consume_retry(&mut self) -> bool {
        if self.retries_remaining == 0 {
            return false;
        }
        self.retries_remaining -= 1;
        self.retries_used += 1;
        true
    }
}
