//! Generator task execution.
//!
//! A task body is a [`GeneratorFn`]. It receives a [`GeneratorContext`] and
//! calls [`GeneratorContext::yield_value`] once per output. Every yield is a
//! commit: the value is serialized, written to the object store, and only
//! then made visible by raising the task's committed high-water mark. Output
//! `i` is therefore always observable before output `i + 1` is produced.
//!
//! How a body ends decides the task outcome:
//!
//! | body | outcome |
//! |---|---|
//! | returns `Ok(())` | completed |
//! | returns `Err(GeneratorError)` | [`ObjectError::TaskRaised`] |
//! | panics, or its attempt is aborted | [`ObjectError::WorkerCrashed`] |
//!
//! Crashes are retried while the task's budget lasts; raises only with
//! [`TaskOptions::retry_exceptions`](crate::domain::TaskOptions). Each retry
//! runs the body again from index 0 and overwrites outputs under the same
//! identities. Outputs of a failed attempt are hidden until the retry
//! commits them again, and the final attempt's count is the task's count.
//!
//! A dynamic-mode re-execution does not publish as it goes: its outputs are
//! staged and written only once the body returned with the original count.
//!
//! # Examples
//!
//! ```
//! use refgen::executor::{generator_fn, GeneratorContext};
//!
//! let body = generator_fn(|mut ctx: GeneratorContext| async move {
//!     for i in 0..3 {
//!         ctx.yield_value(i).await?;
//!     }
//!     Ok(())
//! });
//! # let _ = body;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

use crate::domain::{TaskArg, TaskSpec};
use crate::error::{Error, ObjectError, Result};
use crate::refcount::{RefHandle, RefKind};
use crate::runtime::Runtime;
use crate::types::{
    GeneratorTaskState, HolderState, NodeId, ObjectRef, OwnerId, ReturnMode, TaskId,
    TerminalOutcome,
};

/// Error escaping a task body. Fails the task with
/// [`ObjectError::TaskRaised`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct GeneratorError {
    message: String,
}

impl GeneratorError {
    /// Creates an error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for GeneratorError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for GeneratorError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<Error> for GeneratorError {
    fn from(err: Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<serde_json::Error> for GeneratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// The body of a generator task.
///
/// Implementations must be re-runnable: retries and reconstructions call
/// [`run`](GeneratorFn::run) again with a fresh context.
#[async_trait]
pub trait GeneratorFn: Send + Sync + 'static {
    /// Runs the body to completion, yielding outputs through `ctx`.
    async fn run(&self, ctx: GeneratorContext) -> std::result::Result<(), GeneratorError>;
}

/// Adapter from a closure to [`GeneratorFn`]. Built by [`generator_fn`].
pub struct FnGenerator<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> GeneratorFn for FnGenerator<F>
where
    F: Fn(GeneratorContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), GeneratorError>> + Send + 'static,
{
    async fn run(&self, ctx: GeneratorContext) -> std::result::Result<(), GeneratorError> {
        (self.f)(ctx).await
    }
}

/// Wraps an async closure as a shareable task body.
pub fn generator_fn<F, Fut>(f: F) -> Arc<dyn GeneratorFn>
where
    F: Fn(GeneratorContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), GeneratorError>> + Send + 'static,
{
    Arc::new(FnGenerator { f })
}

/// A task argument after resolution.
#[derive(Debug, Clone)]
pub enum ResolvedArg {
    /// An inline value, or the fetched value of an output reference.
    Value(Value),
    /// The references a dynamic wrapper resolved to, in order.
    Refs(Vec<RefHandle>),
}

/// What an attempt is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptKind {
    /// The original run, including its retries.
    Original,
    /// A re-execution after output loss. Indices `>= limit` are discarded.
    Reconstruction {
        /// Last known output count.
        limit: u32,
    },
}

/// An output held back until its re-execution reconciles.
struct StagedOutput {
    index: u32,
    placement: NodeId,
    data: Vec<u8>,
}

/// Owner-side record of one submitted task.
pub(crate) struct TaskEntry {
    pub(crate) spec: Arc<TaskSpec>,
    pub(crate) state: Mutex<GeneratorTaskState>,
    staged: Mutex<Vec<StagedOutput>>,
    progress: watch::Sender<u64>,
    executions: AtomicU32,
}

impl TaskEntry {
    pub(crate) fn new(owner_id: OwnerId, spec: Arc<TaskSpec>) -> Self {
        let state = GeneratorTaskState::new(owner_id, spec.task_id, spec.return_mode);
        let (progress, _) = watch::channel(0);
        Self {
            spec,
            state: Mutex::new(state),
            staged: Mutex::new(Vec::new()),
            progress,
            executions: AtomicU32::new(0),
        }
    }

    pub(crate) fn task_id(&self) -> TaskId {
        self.spec.task_id
    }

    /// Subscribe before inspecting state, then wait on the receiver, so that
    /// a change between the two is not missed.
    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.progress.subscribe()
    }

    pub(crate) fn notify(&self) {
        self.progress.send_modify(|version| *version += 1);
    }

    pub(crate) fn executions(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TaskEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEntry")
            .field("spec", &self.spec)
            .field("executions", &self.executions())
            .finish_non_exhaustive()
    }
}

/// Handle a running body uses to yield outputs and read its inputs.
pub struct GeneratorContext {
    runtime: Runtime,
    entry: Arc<TaskEntry>,
    args: Vec<ResolvedArg>,
    attempt: u32,
    kind: AttemptKind,
    node: NodeId,
    next_index: u32,
}

impl GeneratorContext {
    /// Commits the next output.
    ///
    /// Returns once the payload is stored and the output is visible to
    /// consumers. Values beyond a fixed declared count, or beyond what a
    /// re-execution may replace, are accepted and discarded.
    pub async fn yield_value<T: Serialize>(
        &mut self,
        value: T,
    ) -> std::result::Result<(), GeneratorError> {
        let index = self.next_index;
        self.next_index += 1;
        let data = serde_json::to_vec(&value)?;
        commit_output(&self.runtime, &self.entry, &self.node, self.kind, index, data).await?;
        // Lets kill requests land between outputs.
        tokio::task::yield_now().await;
        Ok(())
    }

    /// Resolved arguments, in submission order.
    pub fn args(&self) -> &[ResolvedArg] {
        &self.args
    }

    /// Deserializes value argument `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> std::result::Result<T, GeneratorError> {
        match self.args.get(index) {
            Some(ResolvedArg::Value(value)) => Ok(serde_json::from_value(value.clone())?),
            Some(ResolvedArg::Refs(_)) => Err(GeneratorError::new(format!(
                "argument {index} is a reference list, not a value"
            ))),
            None => Err(GeneratorError::new(format!("no argument at index {index}"))),
        }
    }

    /// Reference list argument `index` (a resolved dynamic wrapper).
    pub fn arg_refs(&self, index: usize) -> std::result::Result<&[RefHandle], GeneratorError> {
        match self.args.get(index) {
            Some(ResolvedArg::Refs(refs)) => Ok(refs),
            Some(ResolvedArg::Value(_)) => Err(GeneratorError::new(format!(
                "argument {index} is a value, not a reference list"
            ))),
            None => Err(GeneratorError::new(format!("no argument at index {index}"))),
        }
    }

    /// 0 for the first run, incremented per retry or reconstruction.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns `true` when this run regenerates lost outputs.
    pub fn is_reconstruction(&self) -> bool {
        matches!(self.kind, AttemptKind::Reconstruction { .. })
    }

    /// The running task.
    pub fn task_id(&self) -> TaskId {
        self.entry.task_id()
    }

    /// Node this attempt runs on.
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// The runtime, for fetching other references from inside a body.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }
}

impl fmt::Debug for GeneratorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorContext")
            .field("task_id", &self.task_id())
            .field("attempt", &self.attempt)
            .field("node", &self.node)
            .field("next_index", &self.next_index)
            .finish_non_exhaustive()
    }
}

/// Stores one yielded value and publishes it.
async fn commit_output(
    runtime: &Runtime,
    entry: &TaskEntry,
    node: &NodeId,
    kind: AttemptKind,
    index: u32,
    data: Vec<u8>,
) -> Result<()> {
    let inner = runtime.inner();
    let task_id = entry.task_id();
    let id = entry.state.lock().output_ref(index);

    if let AttemptKind::Reconstruction { limit } = kind {
        if index >= limit {
            tracing::debug!(task_id = %task_id, index, limit, "discarding output beyond recoverable count");
            entry.state.lock().record_discard(index);
            return Ok(());
        }
    }
    if let ReturnMode::Fixed(declared) = entry.spec.return_mode {
        if index >= declared {
            tracing::error!(
                task_id = %task_id,
                task = %entry.spec.name,
                index,
                declared,
                "task yielded more outputs than declared; discarding extra output"
            );
            entry.state.lock().record_discard(index);
            return Ok(());
        }
    }

    let size = data.len();
    let placement = if size <= inner.config.max_inline_bytes {
        NodeId::owner()
    } else {
        node.clone()
    };

    if kind != AttemptKind::Original && !entry.spec.return_mode.tolerates_count_mismatch() {
        entry.state.lock().record_discard(index);
        entry.staged.lock().push(StagedOutput {
            index,
            placement,
            data,
        });
        tracing::debug!(task_id = %task_id, index, size, "re-executed output staged");
        return Ok(());
    }
    publish_output(runtime, entry, id, index, &placement, data).await
}

/// Writes a payload and makes its output visible.
async fn publish_output(
    runtime: &Runtime,
    entry: &TaskEntry,
    id: ObjectRef,
    index: u32,
    placement: &NodeId,
    data: Vec<u8>,
) -> Result<()> {
    let inner = runtime.inner();
    let task_id = entry.task_id();
    let size = data.len();
    inner.store.put(&id, placement, data).await?;

    {
        let mut state = entry.state.lock();
        let minted = state.record_commit(index);
        if minted && state.holder == HolderState::Active {
            inner.counter.add_local(id);
        }
        inner.counter.mark_finished(&id);
    }
    tracing::debug!(task_id = %task_id, index, size, node = %placement, "output committed");
    entry.notify();

    if !inner.counter.contains(&id) {
        inner.store.release(&id).await?;
        tracing::debug!(task_id = %task_id, index, "released unreferenced output");
    }
    Ok(())
}

/// How an attempt failed.
#[derive(Debug, Clone)]
enum AttemptFailure {
    /// An argument could not be resolved. Never retried.
    Dependency(ObjectError),
    /// The body raised or its worker crashed.
    Body(ObjectError),
}

impl AttemptFailure {
    fn into_error(self) -> ObjectError {
        match self {
            Self::Dependency(err) | Self::Body(err) => err,
        }
    }
}

/// Spawns the driver that runs `entry` to a terminal outcome (or, for a
/// reconstruction, to a reconciled lineage state).
pub(crate) fn spawn_driver(runtime: Runtime, entry: Arc<TaskEntry>, kind: AttemptKind, attempt: u32) {
    tokio::spawn(drive(runtime, entry, kind, attempt));
}

async fn drive(runtime: Runtime, entry: Arc<TaskEntry>, kind: AttemptKind, mut attempt: u32) {
    let task_id = entry.task_id();
    let delay = runtime.inner().config.retry_delay();

    if matches!(kind, AttemptKind::Reconstruction { .. }) && !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let outcome = loop {
        match run_attempt(&runtime, &entry, kind, attempt).await {
            Ok(()) => break Ok(()),
            Err(failure) => {
                if kind == AttemptKind::Original
                    && should_retry(&entry.spec, &failure)
                    && !runtime.inner().is_shut_down()
                    && runtime.inner().lineage.consume_retry(&task_id)
                {
                    tracing::warn!(
                        task_id = %task_id,
                        attempt,
                        error = %failure.clone().into_error(),
                        "task attempt failed; retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                    continue;
                }
                break Err(failure.into_error());
            },
        }
    };

    match kind {
        AttemptKind::Original => finish_original(&runtime, &entry, outcome),
        AttemptKind::Reconstruction { .. } => {
            finish_reconstruction(&runtime, &entry, outcome).await;
        },
    }
}

fn should_retry(spec: &TaskSpec, failure: &AttemptFailure) -> bool {
    match failure {
        AttemptFailure::Dependency(_) => false,
        AttemptFailure::Body(err) => {
            err.is_system_failure()
                || (spec.options.retry_exceptions && matches!(err, ObjectError::TaskRaised { .. }))
        },
    }
}

async fn run_attempt(
    runtime: &Runtime,
    entry: &Arc<TaskEntry>,
    kind: AttemptKind,
    attempt: u32,
) -> std::result::Result<(), AttemptFailure> {
    let inner = runtime.inner();
    let task_id = entry.task_id();

    let args = resolve_args(runtime, &entry.spec)
        .await
        .map_err(AttemptFailure::Dependency)?;

    let _slot = inner.workers.acquire_slot().await.map_err(|_| {
        AttemptFailure::Body(ObjectError::WorkerCrashed {
            task_id,
            node: NodeId::owner(),
        })
    })?;
    let node = inner.workers.pick_node();

    {
        let mut state = entry.state.lock();
        state.begin_attempt(attempt);
        if kind == AttemptKind::Original {
            state.restart_outputs();
        }
    }
    entry.staged.lock().clear();
    entry.executions.fetch_add(1, Ordering::SeqCst);
    tracing::info!(
        task_id = %task_id,
        task = %entry.spec.name,
        attempt,
        node = %node,
        reconstruction = matches!(kind, AttemptKind::Reconstruction { .. }),
        "running task attempt"
    );

    let ctx = GeneratorContext {
        runtime: runtime.clone(),
        entry: Arc::clone(entry),
        args,
        attempt,
        kind,
        node: node.clone(),
        next_index: 0,
    };
    let function = Arc::clone(&entry.spec.function);
    let (start_tx, start_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        // The body starts only once the attempt can be killed.
        let _ = start_rx.await;
        function.run(ctx).await
    });
    let registration = inner
        .workers
        .register(task_id, node.clone(), handle.abort_handle());
    let _ = start_tx.send(());

    let joined = handle.await;
    if let Some(registration) = registration {
        inner.workers.unregister(registration);
    }

    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(AttemptFailure::Body(ObjectError::TaskRaised {
            task_id,
            cause: err.to_string(),
        })),
        Err(join_err) => {
            if join_err.is_panic() {
                tracing::warn!(task_id = %task_id, node = %node, "task body panicked");
            }
            Err(AttemptFailure::Body(ObjectError::WorkerCrashed { task_id, node }))
        },
    }
}

async fn resolve_args(
    runtime: &Runtime,
    spec: &TaskSpec,
) -> std::result::Result<Vec<ResolvedArg>, ObjectError> {
    let mut resolved = Vec::with_capacity(spec.args.len());
    for arg in &spec.args {
        let value = match arg {
            TaskArg::Value(value) => ResolvedArg::Value(value.clone()),
            TaskArg::Ref(id) if id.is_dynamic_wrapper() => runtime
                .resolve_wrapper(*id)
                .await
                .map(|refs| ResolvedArg::Refs(refs.into_vec()))
                .map_err(|err| dependency_failure(spec.task_id, id, &err))?,
            TaskArg::Ref(id) => runtime
                .fetch_object(*id)
                .await
                .map(ResolvedArg::Value)
                .map_err(|err| dependency_failure(spec.task_id, id, &err))?,
        };
        resolved.push(value);
    }
    Ok(resolved)
}

fn dependency_failure(task_id: TaskId, dependency: &ObjectRef, err: &Error) -> ObjectError {
    tracing::warn!(task_id = %task_id, dependency = %dependency, error = %err, "task dependency failed");
    ObjectError::TaskRaised {
        task_id,
        cause: format!("dependency {dependency} failed: {err}"),
    }
}

fn finish_original(
    runtime: &Runtime,
    entry: &TaskEntry,
    outcome: std::result::Result<(), ObjectError>,
) {
    let inner = runtime.inner();
    let task_id = entry.task_id();
    let terminal = match &outcome {
        Ok(()) => TerminalOutcome::Completed,
        Err(err) => TerminalOutcome::Failed(err.clone()),
    };

    let (abandon, stale) = {
        let mut state = entry.state.lock();
        if !state.finish(terminal) {
            tracing::error!(task_id = %task_id, "task finished more than once; ignoring");
            return;
        }
        let stale = state.stale_holds();
        if !stale.is_empty() {
            tracing::warn!(
                task_id = %task_id,
                task = %entry.spec.name,
                stale = stale.len(),
                delivered = state.committed,
                "final attempt produced fewer outputs than an earlier one"
            );
        }

        let mode = state.declared_return_mode;
        if let Err(err) = &outcome {
            let trailing = match mode {
                ReturnMode::Fixed(_) => false,
                ReturnMode::Dynamic => matches!(err, ObjectError::TaskRaised { .. }),
                ReturnMode::StreamingIterator => true,
            };
            if trailing && state.holder == HolderState::Active {
                let error_ref = state.append_error_ref();
                inner.counter.add_local(error_ref);
            }
        }

        if let (ReturnMode::Fixed(declared), Ok(())) = (mode, &outcome) {
            if state.committed < declared {
                tracing::warn!(
                    task_id = %task_id,
                    task = %entry.spec.name,
                    declared,
                    produced = state.committed,
                    "task produced fewer outputs than declared"
                );
            }
        }

        inner
            .lineage
            .record_original_count(&task_id, state.delivered_count());
        (inner.counter.task_ref_count(&task_id) == 0, stale)
    };

    for id in stale {
        if let Err(e) = inner.counter.decrement(&id, RefKind::Local) {
            tracing::error!(object = %id, error = %e, "failed to release stale output");
        }
    }

    match &outcome {
        Ok(()) => tracing::info!(task_id = %task_id, task = %entry.spec.name, "task completed"),
        Err(err) => tracing::info!(task_id = %task_id, task = %entry.spec.name, error = %err, "task failed"),
    }
    entry.notify();

    if abandon {
        inner.abandon_task(&task_id);
    }
}

async fn finish_reconstruction(
    runtime: &Runtime,
    entry: &TaskEntry,
    outcome: std::result::Result<(), ObjectError>,
) {
    let inner = runtime.inner();
    let task_id = entry.task_id();
    let (mode, produced) = {
        let state = entry.state.lock();
        (state.declared_return_mode, state.produced_count)
    };

    // Staged outputs become visible only when the count reconciles, and
    // before the lineage leaves `Reconstructing`.
    let staged = std::mem::take(&mut *entry.staged.lock());
    let original = inner
        .lineage
        .get(&task_id)
        .and_then(|record| record.original_output_count);
    let outcome = match outcome {
        Ok(()) if original == Some(produced) => publish_staged(runtime, entry, staged).await,
        other => {
            if !staged.is_empty() {
                tracing::debug!(task_id = %task_id, staged = staged.len(), "dropping staged outputs");
            }
            other
        },
    };

    match inner
        .lineage
        .finish_reconstruction(&task_id, mode, outcome.map(|()| produced))
    {
        Ok(Some(invalidation)) => {
            entry.state.lock().invalidated = Some(invalidation);
        },
        Ok(None) => {},
        Err(e) => {
            tracing::error!(task_id = %task_id, error = %e, "failed to record reconstruction outcome");
        },
    }
    entry.notify();
}

async fn publish_staged(
    runtime: &Runtime,
    entry: &TaskEntry,
    staged: Vec<StagedOutput>,
) -> std::result::Result<(), ObjectError> {
    for output in staged {
        let id = entry.state.lock().output_ref(output.index);
        if let Err(e) =
            publish_output(runtime, entry, id, output.index, &output.placement, output.data).await
        {
            tracing::error!(object = %id, error = %e, "failed to publish re-executed output");
            return Err(ObjectError::ObjectLost { object: id });
        }
    }
    Ok(())
}
