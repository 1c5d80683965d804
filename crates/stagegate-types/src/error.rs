use thiserror::Error;
use uuid::Uuid;

use crate::types::{CheckpointDecision, PhaseId, PhaseStatus};

/// Errors raised by the Evidence & Progress Store.
///
/// `ConcurrentModification` is the optimistic-concurrency guard: a mutation
/// carried an expected run version that no longer matches. It is recoverable
/// by refetching the snapshot and retrying; it is never resolved silently.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("checkpoint {0} not found")]
    CheckpointNotFound(Uuid),

    #[error("run {run_id} was modified concurrently (expected version {expected}, found {found})")]
    ConcurrentModification {
        run_id: Uuid,
        expected: u64,
        found: u64,
    },

    #[error("evidence quality score {0} outside [0.0, 1.0]")]
    InvalidQualityScore(f64),
}

/// Errors raised by the Checkpoint State Machine.
#[derive(Error, Debug)]
pub enum MachineError {
    /// The checkpoint was already decided, or its phase left
    /// AwaitingApproval. The caller must refetch current state.
    #[error("checkpoint {checkpoint_id} is stale: decision {decision:?}, phase {phase_status:?}")]
    StaleCheckpoint {
        checkpoint_id: Uuid,
        decision: CheckpointDecision,
        phase_status: PhaseStatus,
    },

    /// The requested action is not valid for the current phase state.
    /// Surfaced to the caller; never retried.
    #[error("invalid transition for phase {phase}: {from:?} -> {to:?}")]
    InvalidTransition {
        phase: PhaseId,
        from: PhaseStatus,
        to: PhaseStatus,
    },

    /// The outbound resume call exhausted its retry budget. The phase has
    /// been marked Failed with an explicit manual-resume reason.
    #[error("worker unreachable after {attempts} attempts: {reason}")]
    WorkerUnreachable { attempts: u32, reason: String },

    /// The event body failed validation (missing checkpoint type,
    /// unparseable payload). Rejected before any state change.
    #[error("malformed worker event: {0}")]
    MalformedEvent(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MachineError {
    /// Whether the caller should refetch and retry rather than surface the
    /// error as-is.
    #[must_use]
    pub const fn is_retryable_by_refetch(&self) -> bool {
        matches!(
            self,
            Self::StaleCheckpoint { .. } | Self::Store(StoreError::ConcurrentModification { .. })
        )
    }
}
