//! Lineage retention and reconstruction bookkeeping.
//!
//! The [`LineageManager`] decides *whether* a task may be re-executed and
//! records how each re-execution reconciled with the original run. Running
//! the re-execution itself is the executor's job.
//!
//! Reconciliation of a successful re-execution producing `k` outputs when
//! the original delivered `m`:
//!
//! | mode | `k == m` | `k < m` | `k > m` |
//! |---|---|---|---|
//! | `Dynamic` | live | mismatch: every output invalidated | mismatch: every output invalidated |
//! | `Fixed` / `StreamingIterator` | live | live, indices `>= k` resolve to under-production | live, extras discarded |

use dashmap::DashMap;

use crate::domain::{LineageRecord, ReconstructionState};
use crate::error::{Error, ObjectError, Result};
use crate::types::{ReturnMode, TaskId};

/// Result of asking to reconstruct a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginReconstruction {
    /// A re-execution was authorized; the caller must run it.
    Started {
        /// Attempt number to run the re-execution under.
        attempt: u32,
    },
    /// Another requester already started one.
    AlreadyRunning,
    /// Recovery is impossible; the error is final.
    Failed(ObjectError),
    /// No lineage is retained for the task.
    NoLineage,
}

/// Owner-side table of lineage records.
#[derive(Debug, Default)]
pub struct LineageManager {
    records: DashMap<TaskId, LineageRecord>,
}

impl LineageManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Retains the lineage of a newly submitted task.
    pub fn register(&self, record: LineageRecord) {
        tracing::debug!(task_id = %record.task_id(), "lineage registered");
        self.records.insert(record.task_id(), record);
    }

    /// Snapshot of the record for `task_id`.
    pub fn get(&self, task_id: &TaskId) -> Option<LineageRecord> {
        self.records.get(task_id).map(|r| r.clone())
    }

    /// Reconstruction state of `task_id`, if lineage is retained.
    pub fn state(&self, task_id: &TaskId) -> Option<ReconstructionState> {
        self.records.get(task_id).map(|r| r.state.clone())
    }

    /// Outputs currently known to be recoverable for `task_id`.
    pub fn last_known_output_count(&self, task_id: &TaskId) -> Option<u32> {
        self.records
            .get(task_id)
            .and_then(|r| r.last_known_output_count)
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if no lineage is retained.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records how many outputs the original run delivered.
    pub fn record_original_count(&self, task_id: &TaskId, delivered: u32) {
        if let Some(mut record) = self.records.get_mut(task_id) {
            record.original_output_count = Some(delivered);
            record.last_known_output_count = Some(delivered);
        }
    }

    /// Consumes one retry for the original run. Returns `false` when the
    /// budget is spent or the lineage is gone.
    pub fn consume_retry(&self, task_id: &TaskId) -> bool {
        self.records
            .get_mut(task_id)
            .is_some_and(|mut record| record.consume_retry())
    }

    /// Requests a re-execution of `task_id` because one of its outputs is
    /// unreachable.
    ///
    /// Only one re-execution runs at a time; concurrent requesters get
    /// [`BeginReconstruction::AlreadyRunning`] and should wait for progress.
    /// Each started re-execution consumes one unit of the retry budget, and
    /// an exhausted budget fails the lineage for good.
    pub fn begin_reconstruction(&self, task_id: &TaskId) -> Result<BeginReconstruction> {
        let Some(mut record) = self.records.get_mut(task_id) else {
            return Ok(BeginReconstruction::NoLineage);
        };

        let current = record.state.clone();
        match current {
            ReconstructionState::Reconstructing => Ok(BeginReconstruction::AlreadyRunning),
            ReconstructionState::ReconstructionFailed(err) => Ok(BeginReconstruction::Failed(err)),
            ReconstructionState::Abandoned => Ok(BeginReconstruction::NoLineage),
            ReconstructionState::Live => {
                if record.consume_retry() {
                    record.transition(ReconstructionState::Reconstructing)?;
                    tracing::info!(
                        task_id = %task_id,
                        attempt = record.retries_used,
                        retries_remaining = record.retries_remaining,
                        "reconstructing task after output loss"
                    );
                    Ok(BeginReconstruction::Started {
                        attempt: record.retries_used,
                    })
                } else {
                    let err = ObjectError::ReconstructionExhausted {
                        task_id: *task_id,
                        attempts: record.retries_used,
                    };
                    record.transition(ReconstructionState::ReconstructionFailed(err.clone()))?;
                    tracing::warn!(
                        task_id = %task_id,
                        attempts = record.retries_used,
                        "reconstruction budget exhausted"
                    );
                    Ok(BeginReconstruction::Failed(err))
                }
            },
        }
    }

    /// Reconciles a finished re-execution with the original run.
    ///
    /// `result` is the produced count of a body that returned normally, or
    /// the failure that ended it. Returns the invalidation error when a
    /// dynamic-mode count mismatch makes every original output unusable.
    pub fn finish_reconstruction(
        &self,
        task_id: &TaskId,
        mode: ReturnMode,
        result: std::result::Result<u32, ObjectError>,
    ) -> Result<Option<ObjectError>> {
        let Some(mut record) = self.records.get_mut(task_id) else {
            // Abandoned while re-executing; nobody is left to observe it.
            return Ok(None);
        };
        if record.state != ReconstructionState::Reconstructing {
            return Err(Error::InvalidTransition {
                task_id: *task_id,
                from: record.state.to_string(),
                to: ReconstructionState::Live.to_string(),
            });
        }

        let produced = match result {
            Ok(produced) => produced,
            Err(err) => {
                tracing::warn!(task_id = %task_id, error = %err, "reconstruction failed");
                record.transition(ReconstructionState::ReconstructionFailed(err))?;
                return Ok(None);
            },
        };

        let original = record.original_output_count.unwrap_or(0);
        let known = record.last_known_output_count.unwrap_or(original);

        if produced != original && !mode.tolerates_count_mismatch() {
            let err = ObjectError::ReconstructionMismatch {
                task_id: *task_id,
                original,
                reexecuted: produced,
            };
            tracing::warn!(
                task_id = %task_id,
                original,
                reexecuted = produced,
                "re-execution produced a different number of outputs; invalidating all outputs"
            );
            record.transition(ReconstructionState::ReconstructionFailed(err.clone()))?;
            return Ok(Some(err));
        }

        if produced < known {
            tracing::warn!(
                task_id = %task_id,
                previously = known,
                now = produced,
                "re-execution produced fewer outputs"
            );
            record.last_known_output_count = Some(produced);
        }
        record.transition(ReconstructionState::Live)?;
        tracing::info!(task_id = %task_id, produced, "reconstruction completed");
        Ok(None)
    }

    /// Drops the lineage of `task_id`.
    ///
    /// Returns the record, moved to `Abandoned`, so the caller can release
    /// the holds it kept on its dependencies. Returns `None` if the lineage
    /// was already gone.
    pub fn abandon(&self, task_id: &TaskId) -> Option<LineageRecord> {
        let (_, mut record) = self.records.remove(task_id)?;
        if let Err(e) = record.transition(ReconstructionState::Abandoned) {
            tracing::error!(task_id = %task_id, error = %e, "abandoning lineage");
        }
        tracing::debug!(task_id = %task_id, "lineage abandoned");
        Some(record)
    }
}
