//! Value types shared across the runtime.
//!
//! Identity ([`OwnerId`], [`TaskId`], [`NodeId`], [`ObjectRef`]), the declared
//! [`ReturnMode`], and the per-task [`GeneratorTaskState`].

pub mod ids;
pub mod object_ref;
pub mod payload;
pub mod return_mode;
pub mod task;

pub use ids::{NodeId, OwnerId, TaskId};
pub use object_ref::ObjectRef;
pub use payload::ExceptionValue;
pub use return_mode::ReturnMode;
pub use task::{GeneratorTaskState, HolderState, IndexStatus, TerminalOutcome};
