//! Per-run mutable state and consistency helpers.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use stagegate_types::{
    AuditEntry, Checkpoint, CheckpointId, EvidenceItem, PhaseId, PhaseRecord, PhaseStatus, RunId,
    RunSnapshot, StoreError,
};

/// The full mutable state of one validation run.
///
/// Only the store hands these out, and only inside a transaction. Evidence
/// and audit entries are append-only; phase records accumulate one entry
/// per attempt and terminal attempts are never reopened.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: RunId,
    pub current_phase: PhaseId,
    pub phases: Vec<PhaseRecord>,
    pub checkpoints: Vec<Checkpoint>,
    pub evidence: Vec<EvidenceItem>,
    pub audit: Vec<AuditEntry>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    seen_keys: HashSet<String>,
}

impl RunState {
    #[must_use]
    pub fn new(run_id: RunId, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            current_phase: PhaseId::Brief,
            phases: PhaseId::ALL.iter().map(|p| PhaseRecord::new(*p)).collect(),
            checkpoints: Vec::new(),
            evidence: Vec::new(),
            audit: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
            seen_keys: HashSet::new(),
        }
    }

    /// Whether this idempotency key has already been applied.
    #[must_use]
    pub fn has_seen(&self, key: &str) -> bool {
        self.seen_keys.contains(key)
    }

    /// Record an idempotency key as applied.
    pub fn mark_seen(&mut self, key: &str) {
        self.seen_keys.insert(key.to_string());
    }

    /// Latest attempt record for a phase. Every phase has at least one
    /// attempt from construction, so this only fails on corrupted state.
    #[must_use]
    pub fn latest_attempt(&self, phase: PhaseId) -> Option<&PhaseRecord> {
        self.phases.iter().rev().find(|r| r.phase == phase)
    }

    pub fn latest_attempt_mut(&mut self, phase: PhaseId) -> Option<&mut PhaseRecord> {
        self.phases.iter_mut().rev().find(|r| r.phase == phase)
    }

    /// The single Running or AwaitingApproval attempt, if any.
    #[must_use]
    pub fn active_attempt(&self) -> Option<&PhaseRecord> {
        self.phases.iter().find(|r| r.status.is_active())
    }

    /// Start `phase` running. Reuses the latest attempt if it has not
    /// started yet; otherwise opens a fresh attempt numbered after it.
    /// Terminal attempts are never reopened.
    pub fn begin_attempt(&mut self, phase: PhaseId, now: DateTime<Utc>) -> &mut PhaseRecord {
        self.current_phase = phase;
        let reuse = self
            .latest_attempt(phase)
            .is_some_and(|r| r.status == PhaseStatus::NotStarted);
        if !reuse {
            let attempt = self
                .latest_attempt(phase)
                .map(|r| r.attempt + 1)
                .unwrap_or(1);
            self.phases.push(PhaseRecord::new(phase));
            if let Some(rec) = self.phases.last_mut() {
                rec.attempt = attempt;
            }
        }
        let rec = self
            .latest_attempt_mut(phase)
            .unwrap_or_else(|| unreachable!("attempt exists for every phase"));
        rec.status = PhaseStatus::Running;
        rec.progress = 0;
        rec.started_at = Some(now);
        rec.completed_at = None;
        rec.failure_reason = None;
        rec
    }

    #[must_use]
    pub fn checkpoint(&self, id: CheckpointId) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.id == id)
    }

    pub fn checkpoint_mut(&mut self, id: CheckpointId) -> Option<&mut Checkpoint> {
        self.checkpoints.iter_mut().find(|c| c.id == id)
    }

    /// Append an evidence item after validating its quality score.
    pub fn append_evidence(&mut self, item: EvidenceItem) -> Result<(), StoreError> {
        if !(0.0..=1.0).contains(&item.quality_score) {
            return Err(StoreError::InvalidQualityScore(item.quality_score));
        }
        self.evidence.push(item);
        Ok(())
    }

    /// Evidence still counted toward gate evaluation for `phase`:
    /// everything not marked superseded by a revise.
    #[must_use]
    pub fn active_evidence(&self, phase: PhaseId) -> Vec<&EvidenceItem> {
        self.evidence
            .iter()
            .filter(|e| e.phase == phase && !e.superseded_by_revision)
            .collect()
    }

    /// Mark all evidence for phases at or past `from` as superseded.
    /// Called on revise; items are retained for audit.
    pub fn supersede_evidence_from(&mut self, from: PhaseId) {
        for item in &mut self.evidence {
            if item.phase >= from {
                item.superseded_by_revision = true;
            }
        }
    }

    pub fn push_audit(&mut self, actor: &str, action: &str, detail: String, now: DateTime<Utc>) {
        self.audit.push(AuditEntry {
            run_id: self.run_id,
            at: now,
            actor: actor.to_string(),
            action: action.to_string(),
            detail,
        });
    }

    /// Weighted completion across all five phases, 0–100. Each phase
    /// contributes equally; superseded attempts do not count.
    #[must_use]
    pub fn overall_progress(&self) -> u8 {
        let total: u32 = PhaseId::ALL
            .iter()
            .map(|p| {
                self.latest_attempt(*p)
                    .map(|r| match r.status {
                        PhaseStatus::Completed => 100,
                        _ => u32::from(r.progress),
                    })
                    .unwrap_or(0)
            })
            .sum();
        (total / PhaseId::ALL.len() as u32) as u8
    }

    #[must_use]
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id,
            current_phase: self.current_phase,
            overall_progress: self.overall_progress(),
            phases: self.phases.clone(),
            checkpoints: self.checkpoints.clone(),
            evidence_count: self.evidence.len(),
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
