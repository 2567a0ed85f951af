//! Error types for generator task outputs and runtime operations.
//!
//! Two layers:
//!
//! - [`ObjectError`] is the typed failure a single output reference resolves
//!   to. It is `Clone` because one failure (a crash, a mismatch) fans out to
//!   every requester of every affected output.
//! - [`Error`] is what runtime operations return. Fetching a failed output
//!   surfaces as [`Error::Object`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::refcount::RefKind;
use crate::store::StoreError;
use crate::types::{NodeId, ObjectRef, TaskId};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The failure an output reference resolves to.
///
/// A value that is itself an exception, yielded as data, is never an
/// `ObjectError`; see [`ExceptionValue`](crate::types::ExceptionValue).
///
/// # Examples
///
/// ```
/// use refgen::error::ObjectError;
/// use refgen::types::TaskId;
///
/// let err = ObjectError::UnderProduction {
///     task_id: TaskId::new(),
///     index: 2,
///     expected: 3,
///     produced: 2,
/// };
/// assert!(err.to_string().contains("produced 2 of 3"));
/// assert!(!err.is_system_failure());
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectError {
    /// A fixed-count task finished with fewer outputs than it declared.
    #[error("task {task_id} produced {produced} of {expected} declared outputs; output {index} was never produced")]
    UnderProduction {
        /// The producing task.
        task_id: TaskId,
        /// The undelivered output index.
        index: u32,
        /// The declared (or previously delivered) output count.
        expected: u32,
        /// How many outputs the task actually produced.
        produced: u32,
    },

    /// The task body terminated by raising.
    #[error("task {task_id} raised: {cause}")]
    TaskRaised {
        /// The producing task.
        task_id: TaskId,
        /// The escaped error, rendered.
        cause: String,
    },

    /// The process hosting the task died before the output was committed.
    #[error("worker executing task {task_id} on node {node} crashed")]
    WorkerCrashed {
        /// The producing task.
        task_id: TaskId,
        /// Node the attempt was running on.
        node: NodeId,
    },

    /// A dynamic-mode re-execution produced a different number of outputs.
    #[error("re-execution of task {task_id} produced {reexecuted} outputs but {original} were delivered originally")]
    ReconstructionMismatch {
        /// The producing task.
        task_id: TaskId,
        /// Output count of the original run.
        original: u32,
        /// Output count of the re-execution.
        reexecuted: u32,
    },

    /// The retry budget for the task ran out.
    #[error("reconstruction of task {task_id} exhausted its retry budget after {attempts} re-executions")]
    ReconstructionExhausted {
        /// The producing task.
        task_id: TaskId,
        /// Re-executions consumed before giving up.
        attempts: u32,
    },

    /// The payload is unreachable and reconstruction is disabled.
    #[error("object {object} was lost and cannot be reconstructed")]
    ObjectLost {
        /// The unreachable output.
        object: ObjectRef,
    },
}

impl ObjectError {
    /// Returns `true` for failures caused by the system rather than the task
    /// body. Only these are retried without `retry_exceptions`.
    pub fn is_system_failure(&self) -> bool {
        matches!(self, Self::WorkerCrashed { .. } | Self::ObjectLost { .. })
    }

    /// The task whose output failed.
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::UnderProduction { task_id, .. }
            | Self::TaskRaised { task_id, .. }
            | Self::WorkerCrashed { task_id, .. }
            | Self::ReconstructionMismatch { task_id, .. }
            | Self::ReconstructionExhausted { task_id, .. } => *task_id,
            Self::ObjectLost { object } => object.task_id(),
        }
    }
}

/// Errors returned by runtime operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested output resolved to a failure.
    #[error(transparent)]
    Object(#[from] ObjectError),

    /// The reference is not (or no longer) known to its owner.
    #[error("unknown reference: {0}")]
    UnknownReference(ObjectRef),

    /// A wrapper-only operation was given a plain output reference.
    #[error("{0} is not a dynamic wrapper reference")]
    NotDynamicWrapper(ObjectRef),

    /// A decrement would have taken a count below zero.
    #[error("{kind} count of {object} would drop below zero")]
    RefCountUnderflow {
        /// The reference whose count underflowed.
        object: ObjectRef,
        /// Which count underflowed.
        kind: RefKind,
    },

    /// A request was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A lineage state change is not allowed by the state machine.
    #[error("invalid lineage transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        /// The task whose lineage was being updated.
        task_id: TaskId,
        /// The current state.
        from: String,
        /// The rejected target state.
        to: String,
    },

    /// A payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The object store collaborator failed.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// The runtime configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The runtime was shut down while the operation was pending.
    #[error("runtime is shut down")]
    Shutdown,
}

impl Error {
    /// Maps the error to a stable numeric category.
    ///
    /// - `1xx`: output failures (one code per [`ObjectError`] variant)
    /// - `2xx`: caller errors
    /// - `3xx`: infrastructure errors
    ///
    /// # Examples
    ///
    /// ```
    /// use refgen::Error;
    ///
    /// assert_eq!(Error::Shutdown.error_code(), 302);
    /// assert_eq!(Error::InvalidArgument("x".into()).error_code(), 203);
    /// ```
    pub fn error_code(&self) -> u16 {
        match self {
            Self::Object(err) => match err {
                ObjectError::UnderProduction { .. } => 101,
                ObjectError::TaskRaised { .. } => 102,
                ObjectError::WorkerCrashed { .. } => 103,
                ObjectError::ReconstructionMismatch { .. } => 104,
                ObjectError::ReconstructionExhausted { .. } => 105,
                ObjectError::ObjectLost { .. } => 106,
            },
            Self::UnknownReference(_) => 201,
            Self::NotDynamicWrapper(_) => 202,
            Self::InvalidArgument(_) => 203,
            Self::RefCountUnderflow { .. } => 204,
            Self::Serialization(_) => 205,
            Self::InvalidTransition { .. } => 206,
            Self::Storage(_) | Self::Config(_) => 301,
            Self::Shutdown => 302,
        }
    }

    /// Returns the output failure, if this error is one.
    pub fn as_object_error(&self) -> Option<&ObjectError> {
        match self {
            Self::Object(err) => Some(err),
            _ => None,
        }
    }
}
