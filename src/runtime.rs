//! The owner-side runtime.
//!
//! A [`Runtime`] is an explicit, cloneable context: it owns the reference
//! table, the lineage records, the task table, the worker pool and the
//! object store handle for everything submitted through it. Tests build one
//! per case and drop it at the end; there is no process-wide instance.
//!
//! A runtime must be created inside a tokio runtime. It spawns one
//! background collector that turns release notifications from the
//! reference table into entry removal, payload release and lineage
//! abandonment.
//!
//! # Examples
//!
//! ```
//! use refgen::config::RuntimeConfig;
//! use refgen::executor::{generator_fn, GeneratorContext};
//! use refgen::runtime::{Runtime, TaskRequest};
//! use refgen::types::ReturnMode;
//!
//! # #[tokio::main]
//! # async fn main() -> refgen::Result<()> {
//! let runtime = Runtime::new(RuntimeConfig::default())?;
//!
//! let body = generator_fn(|mut ctx: GeneratorContext| async move {
//!     for i in 0..3 {
//!         ctx.yield_value(i).await?;
//!     }
//!     Ok(())
//! });
//!
//! let refs = runtime
//!     .submit(TaskRequest::new("count", body).return_mode(ReturnMode::Fixed(3)))?
//!     .into_fixed()
//!     .unwrap_or_default();
//!
//! for (i, r) in refs.iter().enumerate() {
//!     let value: usize = runtime.get_as(r).await?;
//!     assert_eq!(value, i);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::RuntimeConfig;
use crate::domain::{LineageRecord, ReconstructionState, TaskArg, TaskOptions, TaskSpec};
use crate::dynamic::{self, DynamicRefs};
use crate::error::{Error, ObjectError, Result};
use crate::executor::{spawn_driver, AttemptKind, GeneratorFn, TaskEntry};
use crate::lineage::{BeginReconstruction, LineageManager};
use crate::refcount::{RefHandle, RefKind, ReferenceCountEntry, ReferenceCounter};
use crate::store::{InMemoryObjectStore, ObjectStore};
use crate::stream::ObjectRefStream;
use crate::types::{
    GeneratorTaskState, IndexStatus, NodeId, ObjectRef, OwnerId, ReturnMode, TaskId,
};
use crate::worker::WorkerPool;

/// One argument of a [`TaskRequest`].
#[derive(Debug, Clone)]
enum RequestArg {
    Value(Value),
    Ref(RefHandle),
}

/// Builder for a task submission.
///
/// Defaults to [`ReturnMode::Fixed(1)`](ReturnMode::Fixed), the runtime's
/// retry budget, and no retry on raised errors.
pub struct TaskRequest {
    name: String,
    function: Arc<dyn GeneratorFn>,
    args: Vec<RequestArg>,
    return_mode: ReturnMode,
    options: TaskOptions,
}

impl TaskRequest {
    /// Creates a request to run `function`. `name` is used in logs.
    pub fn new(name: impl Into<String>, function: Arc<dyn GeneratorFn>) -> Self {
        Self {
            name: name.into(),
            function,
            args: Vec::new(),
            return_mode: ReturnMode::Fixed(1),
            options: TaskOptions::default(),
        }
    }

    /// Appends an inline argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(RequestArg::Value(value.into()));
        self
    }

    /// Appends a reference argument. Output references are resolved to
    /// their value, dynamic wrappers to their reference list.
    pub fn arg_ref(mut self, handle: &RefHandle) -> Self {
        self.args.push(RequestArg::Ref(handle.clone()));
        self
    }

    /// Sets the return mode.
    pub fn return_mode(mut self, mode: ReturnMode) -> Self {
        self.return_mode = mode;
        self
    }

    /// Overrides the retry budget for this task.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.options.max_retries = Some(retries);
        self
    }

    /// Retries raised errors too, not only crashes.
    pub fn retry_exceptions(mut self, enabled: bool) -> Self {
        self.options.retry_exceptions = enabled;
        self
    }
}

impl fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRequest")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("return_mode", &self.return_mode)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// What [`Runtime::submit`] hands back, by return mode.
#[derive(Debug)]
pub enum Submission {
    /// One reference per declared output.
    Fixed(Vec<RefHandle>),
    /// The wrapper reference.
    Dynamic(RefHandle),
    /// The output stream.
    Streaming(ObjectRefStream),
}

impl Submission {
    /// The references of a fixed-mode submission.
    pub fn into_fixed(self) -> Option<Vec<RefHandle>> {
        match self {
            Self::Fixed(refs) => Some(refs),
            _ => None,
        }
    }

    /// The wrapper of a dynamic-mode submission.
    pub fn into_dynamic(self) -> Option<RefHandle> {
        match self {
            Self::Dynamic(wrapper) => Some(wrapper),
            _ => None,
        }
    }

    /// The stream of a streaming submission.
    pub fn into_stream(self) -> Option<ObjectRefStream> {
        match self {
            Self::Streaming(stream) => Some(stream),
            _ => None,
        }
    }
}

/// Shared state behind every [`Runtime`] clone.
pub(crate) struct RuntimeInner {
    pub(crate) owner_id: OwnerId,
    pub(crate) config: RuntimeConfig,
    pub(crate) counter: Arc<ReferenceCounter>,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) lineage: LineageManager,
    pub(crate) workers: WorkerPool,
    tasks: DashMap<TaskId, Arc<TaskEntry>>,
    shut_down: AtomicBool,
    collector: Mutex<Option<JoinHandle<()>>>,
}

impl RuntimeInner {
    pub(crate) fn task_entry(&self, task_id: &TaskId) -> Result<Arc<TaskEntry>> {
        self.tasks
            .get(task_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                Error::UnknownReference(ObjectRef::output(self.owner_id, *task_id, 0))
            })
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Drops the lineage of a task nobody can reference any more and
    /// releases the holds it kept on its dependencies.
    pub(crate) fn abandon_task(&self, task_id: &TaskId) {
        if let Some(record) = self.lineage.abandon(task_id) {
            for dependency in record.task_spec.ref_args() {
                if let Err(e) = self.counter.decrement(&dependency, RefKind::Submitted) {
                    tracing::error!(
                        task_id = %task_id,
                        dependency = %dependency,
                        error = %e,
                        "failed to release dependency hold"
                    );
                }
            }
        }
        self.tasks.remove(task_id);
    }

    /// Handles one release notification from the reference table.
    async fn collect(&self, id: ObjectRef) {
        if !self.counter.remove_if_releasable(&id) {
            return;
        }

        if !id.is_dynamic_wrapper() {
            match self.store.release(&id).await {
                Ok(true) => tracing::debug!(object = %id, "payload released"),
                Ok(false) => {},
                Err(e) => tracing::warn!(object = %id, error = %e, "failed to release payload"),
            }
        }

        let task_id = id.task_id();
        let Ok(entry) = self.task_entry(&task_id) else {
            return;
        };
        if id.is_dynamic_wrapper() {
            dynamic::release_wrapper_holds(&self.counter, &entry);
        }

        let abandon = {
            let state = entry.state.lock();
            state.is_terminal() && self.counter.task_ref_count(&task_id) == 0
        };
        if abandon {
            self.abandon_task(&task_id);
        }
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        if let Some(handle) = self.collector.lock().take() {
            handle.abort();
        }
    }
}

async fn run_collector(inner: Weak<RuntimeInner>, mut releases: mpsc::UnboundedReceiver<ObjectRef>) {
    while let Some(id) = releases.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.collect(id).await;
    }
    tracing::debug!("reference collector stopped");
}

/// Explicit runtime context for generator tasks.
///
/// Cheap to clone; all clones share one owner.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Creates a runtime backed by an [`InMemoryObjectStore`].
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the configuration is invalid.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(InMemoryObjectStore::new()))
    }

    /// Creates a runtime over an existing object store.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the configuration is invalid.
    pub fn with_store(config: RuntimeConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        config.validate()?;

        let (counter, releases) = ReferenceCounter::new();
        let workers = WorkerPool::new(config.worker_nodes.clone(), config.max_concurrent_tasks);
        let inner = Arc::new(RuntimeInner {
            owner_id: OwnerId::new(),
            config,
            counter: Arc::new(counter),
            store,
            lineage: LineageManager::new(),
            workers,
            tasks: DashMap::new(),
            shut_down: AtomicBool::new(false),
            collector: Mutex::new(None),
        });

        let handle = tokio::spawn(run_collector(Arc::downgrade(&inner), releases));
        *inner.collector.lock() = Some(handle);

        tracing::info!(
            owner_id = %inner.owner_id,
            workers = inner.config.worker_nodes.len(),
            "runtime started"
        );
        Ok(Self { inner })
    }

    pub(crate) fn inner(&self) -> &RuntimeInner {
        &self.inner
    }

    /// The owner identity of every reference minted here.
    pub fn owner_id(&self) -> OwnerId {
        self.inner.owner_id
    }

    /// The active configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The object store.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.inner.store
    }

    // ─── Submission ─────────────────────────────────────────────────

    /// Submits a task and returns its references according to the
    /// requested return mode. The task starts running in the background.
    ///
    /// Each reference argument gains a submitted count, kept for as long as
    /// the new task's lineage is retained.
    ///
    /// # Errors
    ///
    /// - [`Error::Shutdown`] after [`shutdown`](Self::shutdown).
    /// - [`Error::InvalidArgument`] for a reference minted by another runtime.
    pub fn submit(&self, request: TaskRequest) -> Result<Submission> {
        if self.inner.is_shut_down() {
            return Err(Error::Shutdown);
        }
        let TaskRequest {
            name,
            function,
            args,
            return_mode,
            options,
        } = request;

        if let Some(foreign) = args.iter().find_map(|arg| match arg {
            RequestArg::Ref(handle) if handle.owner_id() != self.inner.owner_id => {
                Some(handle.id())
            },
            _ => None,
        }) {
            return Err(Error::InvalidArgument(format!(
                "reference {foreign} belongs to another runtime"
            )));
        }

        let mut task_args = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                RequestArg::Value(value) => task_args.push(TaskArg::Value(value)),
                RequestArg::Ref(handle) => {
                    self.inner
                        .counter
                        .increment(&handle.id(), RefKind::Submitted)?;
                    task_args.push(TaskArg::Ref(handle.id()));
                },
            }
        }

        let task_id = TaskId::new();
        let spec = Arc::new(TaskSpec {
            task_id,
            name,
            function,
            args: task_args,
            return_mode,
            options,
        });
        let max_retries = options
            .max_retries
            .unwrap_or(self.inner.config.max_task_retries);
        self.inner
            .lineage
            .register(LineageRecord::new(Arc::clone(&spec), max_retries));

        let entry = Arc::new(TaskEntry::new(self.inner.owner_id, Arc::clone(&spec)));
        self.inner.tasks.insert(task_id, Arc::clone(&entry));

        let owner_id = self.inner.owner_id;
        let submission = match return_mode {
            ReturnMode::Fixed(n) => Submission::Fixed(
                (0..n)
                    .map(|i| {
                        RefHandle::new(
                            Arc::clone(&self.inner.counter),
                            ObjectRef::output(owner_id, task_id, i),
                        )
                    })
                    .collect(),
            ),
            ReturnMode::Dynamic => Submission::Dynamic(RefHandle::new(
                Arc::clone(&self.inner.counter),
                ObjectRef::dynamic_wrapper(owner_id, task_id),
            )),
            ReturnMode::StreamingIterator => {
                Submission::Streaming(ObjectRefStream::new(self.clone(), Arc::clone(&entry)))
            },
        };

        tracing::info!(
            task_id = %task_id,
            task = %spec.name,
            mode = %return_mode,
            args = spec.args.len(),
            "task submitted"
        );
        spawn_driver(self.clone(), entry, AttemptKind::Original, 0);
        Ok(submission)
    }

    // ─── Fetching ───────────────────────────────────────────────────

    /// Fetches the value of an output reference, waiting until it is
    /// committed or known to have failed.
    ///
    /// # Errors
    ///
    /// - [`Error::Object`] with the failure the output resolves to.
    /// - [`Error::InvalidArgument`] for a dynamic wrapper; use
    ///   [`resolve_dynamic`](Self::resolve_dynamic).
    pub async fn get(&self, handle: &RefHandle) -> Result<Value> {
        if handle.is_dynamic_wrapper() {
            return Err(Error::InvalidArgument(format!(
                "{} is a dynamic wrapper; resolve it instead of fetching it",
                handle.id()
            )));
        }
        self.fetch_object(handle.id()).await
    }

    /// Fetches and deserializes the value of an output reference.
    pub async fn get_as<T: DeserializeOwned>(&self, handle: &RefHandle) -> Result<T> {
        let value = self.get(handle).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Waits for a dynamic task to end and returns its output references.
    ///
    /// Resolving the same wrapper twice yields the same ordered sequence.
    pub async fn resolve_dynamic(&self, wrapper: &RefHandle) -> Result<DynamicRefs> {
        self.resolve_wrapper(wrapper.id()).await
    }

    pub(crate) async fn resolve_wrapper(&self, wrapper: ObjectRef) -> Result<DynamicRefs> {
        dynamic::resolve(self, wrapper).await
    }

    /// Fetch loop for one output. Each pass subscribes to the task's
    /// progress before reading its state, then either returns or waits.
    pub(crate) async fn fetch_object(&self, id: ObjectRef) -> Result<Value> {
        let task_id = id.task_id();
        let index = id.output_index();
        let entry = self.inner.task_entry(&task_id)?;

        loop {
            let mut progress = entry.subscribe();
            let (status, terminal) = {
                let state = entry.state.lock();
                (state.index_status(index), state.is_terminal())
            };

            match status {
                IndexStatus::Failed(err) => return Err(err.into()),
                IndexStatus::OutOfRange => return Err(Error::UnknownReference(id)),
                IndexStatus::Pending => {},
                IndexStatus::Committed => {
                    if let Some(bytes) = self.inner.store.get(&id).await? {
                        return Ok(serde_json::from_slice(&bytes)?);
                    }
                    // A running task re-puts lost outputs when it retries.
                    if terminal {
                        if let Some(result) = self.recover(&entry, id)? {
                            return result;
                        }
                    }
                },
            }

            if progress.changed().await.is_err() {
                return Err(Error::Shutdown);
            }
        }
    }

    /// Decides what to do about a committed output whose payload is gone.
    ///
    /// `Ok(Some(result))` ends the fetch; `Ok(None)` means wait for progress
    /// and look again.
    fn recover(&self, entry: &Arc<TaskEntry>, id: ObjectRef) -> Result<Option<Result<Value>>> {
        let task_id = id.task_id();
        let index = id.output_index();
        let Some(record) = self.inner.lineage.get(&task_id) else {
            return Ok(Some(Err(ObjectError::ObjectLost { object: id }.into())));
        };

        match record.state {
            ReconstructionState::Reconstructing => return Ok(None),
            ReconstructionState::ReconstructionFailed(err) => return Ok(Some(Err(err.into()))),
            ReconstructionState::Abandoned => {
                return Ok(Some(Err(ObjectError::ObjectLost { object: id }.into())));
            },
            ReconstructionState::Live => {},
        }

        let known = record.last_known_output_count.unwrap_or(0);
        if index >= known {
            return Ok(Some(Err(ObjectError::UnderProduction {
                task_id,
                index,
                expected: record.original_output_count.unwrap_or(known),
                produced: known,
            }
            .into())));
        }
        if !self.inner.config.enable_reconstruction {
            tracing::warn!(object = %id, "output lost and reconstruction is disabled");
            return Ok(Some(Err(ObjectError::ObjectLost { object: id }.into())));
        }

        match self.inner.lineage.begin_reconstruction(&task_id)? {
            BeginReconstruction::Started { attempt } => {
                spawn_driver(
                    self.clone(),
                    Arc::clone(entry),
                    AttemptKind::Reconstruction { limit: known },
                    attempt,
                );
                Ok(None)
            },
            BeginReconstruction::AlreadyRunning => Ok(None),
            BeginReconstruction::Failed(err) => Ok(Some(Err(err.into()))),
            BeginReconstruction::NoLineage => {
                Ok(Some(Err(ObjectError::ObjectLost { object: id }.into())))
            },
        }
    }

    // ─── Introspection ──────────────────────────────────────────────

    /// Snapshot of every live reference-count entry.
    pub fn reference_counts(&self) -> HashMap<ObjectRef, ReferenceCountEntry> {
        self.inner.counter.live_entries()
    }

    /// Snapshot of a task's generator state.
    pub fn task_state(&self, task_id: &TaskId) -> Option<GeneratorTaskState> {
        self.inner
            .tasks
            .get(task_id)
            .map(|entry| entry.state.lock().clone())
    }

    /// Reconstruction state of a task's lineage.
    pub fn lineage_state(&self, task_id: &TaskId) -> Option<ReconstructionState> {
        self.inner.lineage.state(task_id)
    }

    /// Snapshot of a task's lineage record.
    pub fn lineage(&self, task_id: &TaskId) -> Option<LineageRecord> {
        self.inner.lineage.get(task_id)
    }

    /// Number of attempts (original, retries and re-executions) started
    /// for a task.
    pub fn execution_count(&self, task_id: &TaskId) -> Option<u32> {
        self.inner.tasks.get(task_id).map(|entry| entry.executions())
    }

    /// Number of tasks whose state is still retained.
    pub fn task_count(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Number of retained lineage records.
    pub fn lineage_count(&self) -> usize {
        self.inner.lineage.len()
    }

    /// Nodes currently hosting a copy of the output's payload.
    pub async fn locations(&self, handle: &RefHandle) -> Result<Vec<NodeId>> {
        Ok(self.inner.store.locations(&handle.id()).await?)
    }

    // ─── Cluster hooks ──────────────────────────────────────────────

    /// Live worker nodes.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.inner.workers.nodes()
    }

    /// Kills the running attempt of a task, as if its worker process died.
    /// Returns how many attempts were aborted.
    pub fn kill_task(&self, task_id: &TaskId) -> usize {
        self.inner.workers.kill_task(task_id)
    }

    /// Registers a worker node. Returns `false` if it was already known.
    pub fn add_node(&self, node: impl Into<NodeId>) -> Result<bool> {
        let node = node.into();
        let added = self.inner.workers.add_node(node.clone())?;
        if added {
            tracing::info!(node = %node, "worker node added");
        }
        Ok(added)
    }

    /// Removes a worker node: attempts running there crash, and payloads
    /// hosted only there become unreachable. Returns how many payloads
    /// were lost.
    pub async fn remove_node(&self, node: &NodeId) -> Result<usize> {
        let killed = self.inner.workers.remove_node(node)?;
        let lost = self.inner.store.evict_node(node).await?;
        tracing::info!(node = %node, killed, lost, "worker node removed");
        Ok(lost)
    }

    /// Copies an output's payload to another node, so it survives the loss
    /// of its original host. Returns `false` if the payload is not stored.
    pub async fn replicate(&self, handle: &RefHandle, node: &NodeId) -> Result<bool> {
        if !node.is_owner() && !self.inner.workers.nodes().contains(node) {
            return Err(Error::InvalidArgument(format!("unknown node '{node}'")));
        }
        Ok(self.inner.store.replicate(&handle.id(), node).await?)
    }

    /// Stops accepting work and aborts running attempts. Pending fetches
    /// observe the resulting crashes.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.workers.shutdown();
        if let Some(handle) = self.inner.collector.lock().take() {
            handle.abort();
        }
        tracing::info!(owner_id = %self.inner.owner_id, "runtime shut down");
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("owner_id", &self.inner.owner_id)
            .field("tasks", &self.inner.tasks.len())
            .field("references", &self.inner.counter.len())
            .finish_non_exhaustive()
    }
}
