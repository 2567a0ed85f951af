//! Generator tasks with streaming outputs, reference counting and lineage
//! reconstruction.
//!
//! # Overview
//!
//! A task body is an async function that yields values one at a time. The
//! owner that submitted it mints an [`ObjectRef`] per output and tracks who
//! can still reach each one. Outputs are released once nothing refers to
//! them, and a task's lineage is dropped once none of its outputs can be
//! referenced any more. While the lineage is retained, a lost output is
//! regenerated by running the task again.
//!
//! Three return modes decide how outputs are handed to the caller:
//!
//! - [`ReturnMode::Fixed`]: one reference per declared output, minted at
//!   submission.
//! - [`ReturnMode::Dynamic`]: a single wrapper reference, resolved into the
//!   produced outputs once the task ends ([`Runtime::resolve_dynamic`]).
//! - [`ReturnMode::StreamingIterator`]: an [`ObjectRefStream`] handing out
//!   each output as soon as it is committed.
//!
//! # Module Organization
//!
//! - [`runtime`] - The explicit runtime context, task submission and fetches
//! - [`executor`] - Task bodies, the commit protocol and retries
//! - [`refcount`] - The reference table and counted [`RefHandle`]s
//! - [`dynamic`] / [`stream`] - Caller-side views of dynamic and streaming tasks
//! - [`lineage`] / [`domain`] - Lineage records and reconstruction
//! - [`store`] - Object store collaborator and its in-memory implementation
//! - [`worker`] - Worker nodes, concurrency slots and kill switches
//! - [`config`] - Runtime configuration from TOML and the environment
//! - [`error`] / [`types`] / [`constants`] - Shared vocabulary

pub mod config;
pub mod constants;
pub mod domain;
pub mod dynamic;
pub mod error;
pub mod executor;
pub mod lineage;
#[cfg(feature = "logging")]
pub mod logging;
pub mod refcount;
pub mod runtime;
pub mod store;
pub mod stream;
pub mod types;
pub mod worker;

// Re-exports for ergonomic access
pub use config::{ConfigError, RuntimeConfig};
pub use domain::{LineageRecord, ReconstructionState, TaskOptions};
pub use dynamic::DynamicRefs;
pub use error::{Error, ObjectError, Result};
pub use executor::{generator_fn, GeneratorContext, GeneratorError, GeneratorFn, ResolvedArg};
pub use refcount::{RefHandle, RefKind, ReferenceCountEntry};
pub use runtime::{Runtime, Submission, TaskRequest};
pub use store::{InMemoryObjectStore, ObjectStore, StoreError};
pub use stream::ObjectRefStream;
pub use types::{NodeId, ObjectRef, OwnerId, ReturnMode, TaskId};
