//! Per-task generator state.
//!
//! [`GeneratorTaskState`] is the single source of truth for which outputs of
//! a task are committed and how the task ended. The producer advances it one
//! committed index at a time; consumers read it to decide whether an output
//! is available, still pending, or failed.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{OwnerId, TaskId};
use super::object_ref::ObjectRef;
use super::return_mode::ReturnMode;
use crate::error::ObjectError;

/// Final outcome of a task's original run. Set exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum TerminalOutcome {
    /// The body returned normally.
    Completed,
    /// The body raised, or the worker running it died.
    Failed(ObjectError),
}

impl TerminalOutcome {
    /// The failure, if the task failed.
    pub fn error(&self) -> Option<&ObjectError> {
        match self {
            Self::Completed => None,
            Self::Failed(err) => Some(err),
        }
    }
}

impl fmt::Display for TerminalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

/// Lifecycle of the internal holder (dynamic wrapper or stream) that keeps
/// outputs alive until the caller receives them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HolderState {
    /// Fixed mode: outputs are referenced from submission on.
    NotApplicable,
    /// New outputs get a holder hold when committed.
    Active,
    /// The holder is gone; new outputs are not held.
    Released,
}

/// Availability of one output index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexStatus {
    /// The value was committed. The payload may still have been lost since.
    Committed,
    /// Not committed yet and the task is still running.
    Pending,
    /// The index resolves to this failure.
    Failed(ObjectError),
    /// The task never minted this index.
    OutOfRange,
}

/// Progress and outcome of one generator task.
///
/// # Examples
///
/// ```
/// use refgen::types::{GeneratorTaskState, IndexStatus, OwnerId, ReturnMode, TaskId, TerminalOutcome};
///
/// let mut state = GeneratorTaskState::new(OwnerId::new(), TaskId::new(), ReturnMode::Fixed(2));
/// assert_eq!(state.index_status(0), IndexStatus::Pending);
///
/// state.record_commit(0);
/// assert_eq!(state.index_status(0), IndexStatus::Committed);
///
/// assert!(state.finish(TerminalOutcome::Completed));
/// assert!(matches!(state.index_status(1), IndexStatus::Failed(_)));
/// assert!(!state.finish(TerminalOutcome::Completed)); // set exactly once
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorTaskState {
    /// Owner minting this task's references.
    pub owner_id: OwnerId,
    /// The task.
    pub task_id: TaskId,
    /// Mode declared at submission.
    pub declared_return_mode: ReturnMode,
    /// Values yielded by the current (or last) attempt, discarded ones included.
    pub produced_count: u32,
    /// Outputs `0..committed` are visible. A retry of the original run
    /// restarts this at 0, so every visible output comes from one attempt.
    pub committed: u32,
    /// Output identities `0..minted` have been handed out by some attempt.
    /// Never decreases.
    pub minted: u32,
    /// Outcome of the original run.
    pub terminal: Option<TerminalOutcome>,
    /// Number of the current attempt, starting at 0.
    pub attempt: u32,
    /// Set when a re-execution invalidated every output of the task.
    pub invalidated: Option<ObjectError>,
    /// Index of the trailing error reference appended after a failure, if any.
    pub error_index: Option<u32>,
    /// Wrapper or stream holder lifecycle.
    pub holder: HolderState,
    /// Streaming only: outputs handed to the caller so far.
    pub surfaced: u32,
}

impl GeneratorTaskState {
    /// Creates the state for a freshly submitted task.
    pub fn new(owner_id: OwnerId, task_id: TaskId, mode: ReturnMode) -> Self {
        Self {
            owner_id,
            task_id,
            declared_return_mode: mode,
            produced_count: 0,
            committed: 0,
            minted: 0,
            terminal: None,
            attempt: 0,
            invalidated: None,
            error_index: None,
            holder: if mode.mints_on_yield() {
                HolderState::Active
            } else {
                HolderState::NotApplicable
            },
            surfaced: 0,
        }
    }

    /// Reference to output `index` of this task.
    pub fn output_ref(&self, index: u32) -> ObjectRef {
        ObjectRef::output(self.owner_id, self.task_id, index)
    }

    /// Returns `true` once the original run has ended.
    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    /// Resets per-attempt progress before a retry or re-execution.
    pub fn begin_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
        self.produced_count = 0;
    }

    /// Hides every output before an attempt of the original run. Outputs of
    /// a crashed attempt stay pending until the new attempt commits them
    /// again.
    pub fn restart_outputs(&mut self) {
        self.committed = 0;
    }

    /// Records that `index` was committed.
    ///
    /// Returns `true` if this is the first commit of `index`, i.e. a new
    /// output was minted rather than an existing one overwritten.
    pub fn record_commit(&mut self, index: u32) -> bool {
        self.produced_count = self.produced_count.max(index + 1);
        self.committed = self.committed.max(index + 1);
        if index >= self.minted {
            self.minted = index + 1;
            true
        } else {
            false
        }
    }

    /// Records a yielded value that was discarded instead of committed.
    pub fn record_discard(&mut self, index: u32) {
        self.produced_count = self.produced_count.max(index + 1);
    }

    /// Sets the terminal outcome. Returns `false`, changing nothing, if the
    /// task was already terminal.
    pub fn finish(&mut self, outcome: TerminalOutcome) -> bool {
        if self.terminal.is_some() {
            return false;
        }
        self.terminal = Some(outcome);
        true
    }

    /// Appends the trailing error reference at the next free index and
    /// returns it.
    ///
    /// Only meaningful for modes that mint on yield. Calling it twice
    /// returns the same reference.
    pub fn append_error_ref(&mut self) -> ObjectRef {
        let index = *self.error_index.get_or_insert(self.minted);
        self.output_ref(index)
    }

    /// References the holder owns a count on, in order.
    ///
    /// While the task runs that is every minted identity. Once it ended it is
    /// the outputs of the final attempt followed by the trailing error
    /// reference, if any.
    pub fn held_refs(&self) -> Vec<ObjectRef> {
        let end = if self.is_terminal() {
            self.committed
        } else {
            self.minted
        };
        let mut refs: Vec<ObjectRef> = (0..end).map(|i| self.output_ref(i)).collect();
        if let Some(index) = self.error_index {
            refs.push(self.output_ref(index));
        }
        refs
    }

    /// Identities an earlier attempt minted that the final attempt did not
    /// commit, and that the holder has not handed out yet.
    pub fn stale_holds(&self) -> Vec<ObjectRef> {
        if self.holder != HolderState::Active {
            return Vec::new();
        }
        (self.committed.max(self.surfaced)..self.minted)
            .map(|i| self.output_ref(i))
            .collect()
    }

    /// Streaming only: the next index the caller may receive, if any is
    /// available now.
    pub fn next_surfaceable(&self) -> Option<u32> {
        let next = self.surfaced;
        if next < self.committed {
            return Some(next);
        }
        if !self.is_terminal() {
            return None;
        }
        self.error_index.filter(|&index| index >= next)
    }

    /// Resolves what fetching output `index` should produce right now.
    ///
    /// Precedence: task-wide invalidation, then committed outputs, then the
    /// trailing error reference, then the terminal outcome.
    pub fn index_status(&self, index: u32) -> IndexStatus {
        if let Some(err) = &self.invalidated {
            return IndexStatus::Failed(err.clone());
        }
        if index < self.committed {
            return IndexStatus::Committed;
        }
        if self.error_index == Some(index) {
            if let Some(err) = self.terminal.as_ref().and_then(TerminalOutcome::error) {
                return IndexStatus::Failed(err.clone());
            }
        }

        let Some(outcome) = &self.terminal else {
            return IndexStatus::Pending;
        };
        // Indices past the final attempt's outputs: declared but never
        // produced, or minted by an attempt that did not count.
        let expected = match self.declared_return_mode.declared_count() {
            Some(declared) if index < declared => declared,
            None if index < self.minted => self.minted,
            _ => return IndexStatus::OutOfRange,
        };

        match outcome {
            TerminalOutcome::Completed => IndexStatus::Failed(ObjectError::UnderProduction {
                task_id: self.task_id,
                index,
                expected,
                produced: self.committed,
            }),
            TerminalOutcome::Failed(err) => IndexStatus::Failed(err.clone()),
        }
    }

    /// Output count recorded as authoritative when the original run ends:
    /// what the final attempt committed.
    pub fn delivered_count(&self) -> u32 {
        match self.declared_return_mode {
            ReturnMode::Fixed(n) => self.committed.min(n),
            ReturnMode::Dynamic | ReturnMode::StreamingIterator => self.committed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;
    use pretty_assertions::assert_eq;

    fn state(mode: ReturnMode) -> GeneratorTaskState {
        GeneratorTaskState::new(OwnerId::new(), TaskId::new(), mode)
    }

    #[test]
    fn holder_only_for_minting_modes() {
        assert_eq!(state(ReturnMode::Fixed(1)).holder, HolderState::NotApplicable);
        assert_eq!(state(ReturnMode::Dynamic).holder, HolderState::Active);
        assert_eq!(
            state(ReturnMode::StreamingIterator).holder,
            HolderState::Active
        );
    }

    #[test]
    fn minted_identities_survive_a_retry() {
        let mut s = state(ReturnMode::Dynamic);
        assert!(s.record_commit(0));
        assert!(s.record_commit(1));
        s.begin_attempt(1);
        s.restart_outputs();
        assert_eq!(s.index_status(0), IndexStatus::Pending);
        assert!(!s.record_commit(0));
        assert_eq!(s.committed, 1);
        assert_eq!(s.minted, 2);
        assert_eq!(s.produced_count, 1);
    }

    #[test]
    fn shorter_retry_leaves_stale_identities_failed() {
        let mut s = state(ReturnMode::Dynamic);
        for i in 0..5 {
            s.record_commit(i);
        }
        s.begin_attempt(1);
        s.restart_outputs();
        for i in 0..3 {
            s.record_commit(i);
        }
        s.finish(TerminalOutcome::Completed);

        assert_eq!(s.delivered_count(), 3);
        assert_eq!(s.held_refs().len(), 3);
        assert_eq!(
            s.stale_holds(),
            vec![s.output_ref(3), s.output_ref(4)]
        );
        match s.index_status(4) {
            IndexStatus::Failed(ObjectError::UnderProduction {
                expected, produced, ..
            }) => assert_eq!((expected, produced), (5, 3)),
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(s.index_status(5), IndexStatus::OutOfRange);
    }

    #[test]
    fn trailing_error_ref_follows_every_minted_identity() {
        let mut s = state(ReturnMode::StreamingIterator);
        s.record_commit(0);
        s.record_commit(1);
        s.surfaced = 2;
        s.begin_attempt(1);
        s.restart_outputs();
        s.record_commit(0);
        let err = ObjectError::TaskRaised {
            task_id: s.task_id,
            cause: "boom".into(),
        };
        s.finish(TerminalOutcome::Failed(err.clone()));
        let error_ref = s.append_error_ref();

        assert_eq!(error_ref.output_index(), 2);
        assert_eq!(s.next_surfaceable(), Some(2));
        assert!(s.stale_holds().is_empty());
        assert_eq!(s.index_status(1), IndexStatus::Failed(err));
    }

    #[test]
    fn raise_after_two_of_three_fails_remaining_fixed_indices() {
        let mut s = state(ReturnMode::Fixed(3));
        s.record_commit(0);
        s.record_commit(1);
        let err = ObjectError::TaskRaised {
            task_id: s.task_id,
            cause: "boom".into(),
        };
        s.finish(TerminalOutcome::Failed(err.clone()));

        assert_eq!(s.index_status(0), IndexStatus::Committed);
        assert_eq!(s.index_status(1), IndexStatus::Committed);
        assert_eq!(s.index_status(2), IndexStatus::Failed(err));
        assert_eq!(s.index_status(3), IndexStatus::OutOfRange);
    }

    #[test]
    fn under_production_reports_counts() {
        let mut s = state(ReturnMode::Fixed(3));
        s.record_commit(0);
        s.finish(TerminalOutcome::Completed);
        match s.index_status(2) {
            IndexStatus::Failed(ObjectError::UnderProduction {
                index,
                expected,
                produced,
                ..
            }) => assert_eq!((index, expected, produced), (2, 3, 1)),
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(s.delivered_count(), 1);
    }

    #[test]
    fn trailing_error_ref_resolves_to_failure() {
        let mut s = state(ReturnMode::StreamingIterator);
        s.record_commit(0);
        let err = ObjectError::WorkerCrashed {
            task_id: s.task_id,
            node: NodeId::new("w"),
        };
        s.finish(TerminalOutcome::Failed(err.clone()));
        let error_ref = s.append_error_ref();
        assert_eq!(error_ref.output_index(), 1);
        assert_eq!(s.append_error_ref(), error_ref);

        assert_eq!(s.index_status(1), IndexStatus::Failed(err));
        assert_eq!(s.index_status(2), IndexStatus::OutOfRange);
        assert_eq!(s.held_refs().len(), 2);
    }

    #[test]
    fn invalidation_overrides_committed() {
        let mut s = state(ReturnMode::Dynamic);
        s.record_commit(0);
        s.finish(TerminalOutcome::Completed);
        let err = ObjectError::ReconstructionMismatch {
            task_id: s.task_id,
            original: 1,
            reexecuted: 2,
        };
        s.invalidated = Some(err.clone());
        assert_eq!(s.index_status(0), IndexStatus::Failed(err));
    }

    #[test]
    fn over_production_is_capped_in_delivered_count() {
        let mut s = state(ReturnMode::Fixed(2));
        s.record_commit(0);
        s.record_commit(1);
        s.record_discard(2);
        assert_eq!(s.produced_count, 3);
        assert_eq!(s.delivered_count(), 2);
    }
}
