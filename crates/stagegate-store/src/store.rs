//! Mutex-guarded run store with transactional mutation.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use stagegate_types::{CheckpointId, RunId, RunSnapshot, StoreError};
use tracing::debug;
use uuid::Uuid;

use crate::state::RunState;

#[derive(Debug, Default)]
struct Inner {
    runs: HashMap<RunId, RunState>,
    /// Checkpoint ids are globally unique; this maps them back to their run
    /// so decision endpoints can address a checkpoint without knowing it.
    checkpoint_index: HashMap<CheckpointId, RunId>,
}

/// In-memory store of all validation runs.
///
/// Mutations go through [`RunStore::transact`]: the closure runs against a
/// copy of the run state and commits atomically on success, so a failed
/// guard never leaves a partial write. Per-run writes are serialized by the
/// version counter; reads never block writes longer than a clone.
#[derive(Debug, Default)]
pub struct RunStore {
    inner: Mutex<Inner>,
}

impl RunStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a run and return its initial snapshot.
    pub fn create_run(&self) -> RunSnapshot {
        let state = RunState::new(Uuid::new_v4(), Utc::now());
        let snapshot = state.snapshot();
        let mut inner = self.lock();
        inner.runs.insert(state.run_id, state);
        debug!(run_id = %snapshot.run_id, "run created");
        snapshot
    }

    pub fn snapshot(&self, run_id: RunId) -> Result<RunSnapshot, StoreError> {
        self.read(run_id, RunState::snapshot)
    }

    /// Read-only access to a run's state.
    pub fn read<T>(
        &self,
        run_id: RunId,
        f: impl FnOnce(&RunState) -> T,
    ) -> Result<T, StoreError> {
        let inner = self.lock();
        let state = inner.runs.get(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        Ok(f(state))
    }

    /// Run a mutation transactionally.
    ///
    /// The closure operates on a working copy; if it returns `Err` the run
    /// is left exactly as it was. On `Ok` the copy is committed, the version
    /// counter bumped, and `updated_at` refreshed.
    pub fn transact<T, E>(
        &self,
        run_id: RunId,
        f: impl FnOnce(&mut RunState) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut inner = self.lock();
        let state = inner
            .runs
            .get(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        let mut working = state.clone();
        let out = f(&mut working)?;
        working.version += 1;
        working.updated_at = Utc::now();
        let version = working.version;
        for cp in &working.checkpoints {
            inner.checkpoint_index.insert(cp.id, run_id);
        }
        inner.runs.insert(run_id, working);
        debug!(run_id = %run_id, version, "run transaction committed");
        Ok(out)
    }

    /// Like [`transact`](Self::transact), but fails with
    /// `ConcurrentModification` when the caller's expected version is stale.
    pub fn transact_at<T, E>(
        &self,
        run_id: RunId,
        expected_version: u64,
        f: impl FnOnce(&mut RunState) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut inner = self.lock();
        let state = inner
            .runs
            .get(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        if state.version != expected_version {
            return Err(StoreError::ConcurrentModification {
                run_id,
                expected: expected_version,
                found: state.version,
            }
            .into());
        }
        let mut working = state.clone();
        let out = f(&mut working)?;
        working.version += 1;
        working.updated_at = Utc::now();
        for cp in &working.checkpoints {
            inner.checkpoint_index.insert(cp.id, run_id);
        }
        inner.runs.insert(run_id, working);
        Ok(out)
    }

    /// Resolve a checkpoint id to its owning run.
    pub fn run_for_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<RunId, StoreError> {
        let inner = self.lock();
        inner
            .checkpoint_index
            .get(&checkpoint_id)
            .copied()
            .ok_or(StoreError::CheckpointNotFound(checkpoint_id))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panic mid-clone; the data itself is
        // still consistent because commits are whole-state swaps.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
