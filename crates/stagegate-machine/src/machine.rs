//! Core coordination: worker events, decisions, revise, gate reads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use stagegate_config::Config;
use stagegate_gate::{evaluate, GateCriteria, GateResult, ReadinessMonitor};
use stagegate_store::{RunState, RunStore};
use stagegate_types::{
    Checkpoint, CheckpointDecision, CheckpointId, EvidenceItem, EvidenceKind, EvidenceStrength,
    EventAck, EventDisposition, MachineError, PhaseId, PhaseRecord, PhaseStatus, RunEvent, RunId,
    RunSnapshot, StoreError, WorkerEvent, WorkerEventType,
};
use stagegate_worker::{ResumeRequest, ResumeTransport, WorkerError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::publish::EventPublisher;

/// Evidence as submitted over the wire, before the store assigns identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvidence {
    pub kind: EvidenceKind,
    pub strength: EvidenceStrength,
    pub quality_score: f64,
    pub source: String,
    #[serde(default)]
    pub supersedes: Option<Uuid>,
}

/// A human decision on a pending checkpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    pub decision: CheckpointDecision,
    pub actor: String,
    #[serde(default)]
    pub comment: Option<String>,
    /// On rejection, revise back to this phase (the rejected one or an
    /// earlier one) instead of failing outright.
    #[serde(default)]
    pub fallback_phase: Option<PhaseId>,
}

/// What a recorded decision changed.
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub checkpoint: Checkpoint,
    pub phase: PhaseRecord,
    pub run_version: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ProgressPayload {
    progress: Option<u8>,
    evidence: Vec<NewEvidence>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FailurePayload {
    reason: Option<String>,
}

/// Transaction abort reasons that are not plain machine errors.
enum Tx {
    /// Idempotency key already applied; ack without mutating.
    Duplicate,
    Fail(MachineError),
}

impl From<StoreError> for Tx {
    fn from(err: StoreError) -> Self {
        Self::Fail(MachineError::Store(err))
    }
}

struct Applied {
    events: Vec<RunEvent>,
    readiness: Option<(PhaseId, f64, f64)>,
    version: u64,
}

/// The checkpoint state machine.
///
/// Holds no durable state of its own; the store owns the data, the
/// readiness monitor only remembers which alerts already fired. Every
/// operation commits its store transaction before publishing events or
/// calling out to the worker.
pub struct Machine {
    store: Arc<RunStore>,
    criteria: HashMap<PhaseId, GateCriteria>,
    monitor: Mutex<ReadinessMonitor>,
    transport: Arc<dyn ResumeTransport>,
    publisher: Arc<dyn EventPublisher>,
}

impl Machine {
    #[must_use]
    pub fn new(
        store: Arc<RunStore>,
        config: &Config,
        transport: Arc<dyn ResumeTransport>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        let criteria = PhaseId::ALL
            .iter()
            .map(|p| (*p, config.gate_criteria(*p)))
            .collect();
        Self {
            store,
            criteria,
            monitor: Mutex::new(ReadinessMonitor::new(Duration::hours(
                config.alerts.cooldown_hours,
            ))),
            transport,
            publisher,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<RunStore> {
        &self.store
    }

    fn criteria_for(&self, phase: PhaseId) -> &GateCriteria {
        // The map is populated for every phase at construction.
        self.criteria
            .get(&phase)
            .unwrap_or_else(|| unreachable!("criteria exist for all phases"))
    }

    fn monitor_lock(&self) -> MutexGuard<'_, ReadinessMonitor> {
        match self.monitor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Apply one inbound worker event.
    ///
    /// Redelivery of a known idempotency key acknowledges without state
    /// change and publishes nothing. Guard violations reject the whole
    /// event; nothing is partially applied.
    pub fn handle_worker_event(&self, event: &WorkerEvent) -> Result<EventAck, MachineError> {
        let run_id = event.run_id;
        let result = self.store.transact::<Applied, Tx>(run_id, |state| {
            if state.has_seen(&event.idempotency_key) {
                return Err(Tx::Duplicate);
            }
            let mut events = Vec::new();
            let mut readiness = None;
            match event.event_type {
                WorkerEventType::PhaseProgress => {
                    readiness = self.apply_progress(state, event, &mut events)?;
                }
                WorkerEventType::CheckpointRequested => {
                    self.apply_checkpoint_request(state, event, &mut events)?;
                }
                WorkerEventType::PhaseCompleted => {
                    apply_completed(state, event, &mut events)?;
                }
                WorkerEventType::PhaseFailed => {
                    apply_failed(state, event, &mut events)?;
                }
            }
            state.mark_seen(&event.idempotency_key);
            Ok(Applied {
                events,
                readiness,
                version: state.version + 1,
            })
        });

        match result {
            Ok(applied) => {
                info!(
                    run_id = %run_id,
                    event_type = event.event_type.as_str(),
                    phase = %event.phase,
                    "worker event applied"
                );
                let mut to_publish = applied.events;
                if let Some((phase, score, threshold)) = applied.readiness {
                    let alert =
                        self.monitor_lock()
                            .observe(run_id, phase, score, threshold, Utc::now());
                    if let Some(alert) = alert {
                        to_publish.push(RunEvent::ReadinessAlert {
                            run_id,
                            phase,
                            readiness: alert.readiness,
                            threshold: alert.threshold,
                            at: alert.generated_at,
                        });
                    }
                }
                for e in &to_publish {
                    self.publisher.publish(e);
                }
                Ok(EventAck {
                    run_id,
                    disposition: EventDisposition::Applied,
                    run_version: applied.version,
                })
            }
            Err(Tx::Duplicate) => {
                info!(
                    run_id = %run_id,
                    idempotency_key = %event.idempotency_key,
                    "duplicate worker event acknowledged"
                );
                let snapshot = self.store.snapshot(run_id)?;
                Ok(EventAck {
                    run_id,
                    disposition: EventDisposition::Duplicate,
                    run_version: snapshot.version,
                })
            }
            Err(Tx::Fail(err)) => {
                warn!(
                    run_id = %run_id,
                    event_type = event.event_type.as_str(),
                    error = %err,
                    "worker event rejected"
                );
                Err(err)
            }
        }
    }

    fn apply_progress(
        &self,
        state: &mut RunState,
        event: &WorkerEvent,
        events: &mut Vec<RunEvent>,
    ) -> Result<Option<(PhaseId, f64, f64)>, Tx> {
        guard_current_phase(state, event.phase)?;
        let now = Utc::now();
        ensure_running(state, event.phase, now)?;
        let payload: ProgressPayload = parse_payload(&event.payload)?;

        if let Some(p) = payload.progress {
            if let Some(rec) = state.latest_attempt_mut(event.phase) {
                // Progress never moves backwards within an attempt.
                rec.progress = rec.progress.max(p.min(100));
            }
        }

        let mut readiness = None;
        if !payload.evidence.is_empty() {
            for submission in &payload.evidence {
                state
                    .append_evidence(build_evidence(state.run_id, event.phase, submission))
                    .map_err(Tx::from)?;
            }
            let criteria = self.criteria_for(event.phase);
            let active = state.active_evidence(event.phase);
            let result = evaluate(criteria, &active);
            readiness = Some((event.phase, result.readiness, criteria.pass_threshold));
            state.push_audit(
                "worker",
                "evidence_appended",
                format!(
                    "{} item(s) for {}, readiness {:.2}",
                    payload.evidence.len(),
                    event.phase,
                    result.readiness
                ),
                now,
            );
        }

        if let Some(rec) = state.latest_attempt(event.phase) {
            events.push(RunEvent::PhaseChanged {
                run_id: state.run_id,
                phase: event.phase,
                status: rec.status,
                progress: rec.progress,
                at: now,
            });
        }
        Ok(readiness)
    }

    fn apply_checkpoint_request(
        &self,
        state: &mut RunState,
        event: &WorkerEvent,
        events: &mut Vec<RunEvent>,
    ) -> Result<(), Tx> {
        guard_current_phase(state, event.phase)?;
        let kind = event.checkpoint_type.ok_or_else(|| {
            Tx::Fail(MachineError::MalformedEvent(
                "checkpoint_requested without checkpointType".to_string(),
            ))
        })?;
        let now = Utc::now();
        ensure_running(state, event.phase, now)?;

        if let Some(rec) = state.latest_attempt_mut(event.phase) {
            rec.status = PhaseStatus::AwaitingApproval;
        }
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            run_id: state.run_id,
            phase: event.phase,
            kind,
            requested_at: now,
            decision: CheckpointDecision::Pending,
            decided_by: None,
            decided_at: None,
            comment: None,
            idempotency_key: event.idempotency_key.clone(),
        };
        let checkpoint_id = checkpoint.id;
        state.checkpoints.push(checkpoint);
        state.push_audit(
            "worker",
            "checkpoint_requested",
            format!("{kind} for {}", event.phase),
            now,
        );
        events.push(RunEvent::CheckpointRequested {
            run_id: state.run_id,
            checkpoint_id,
            phase: event.phase,
            kind,
            at: now,
        });
        events.push(RunEvent::PhaseChanged {
            run_id: state.run_id,
            phase: event.phase,
            status: PhaseStatus::AwaitingApproval,
            progress: state
                .latest_attempt(event.phase)
                .map(|r| r.progress)
                .unwrap_or(0),
            at: now,
        });
        Ok(())
    }

    /// Record a human decision on a pending checkpoint.
    ///
    /// Approved and Overridden resume the worker with the checkpoint's
    /// original idempotency key; if delivery exhausts its retries the phase
    /// is marked Failed and `WorkerUnreachable` is returned. Rejected fails
    /// the phase, or revises to `fallback_phase` when one is supplied.
    pub async fn record_decision(
        &self,
        checkpoint_id: CheckpointId,
        request: &DecisionRequest,
    ) -> Result<DecisionOutcome, MachineError> {
        if !matches!(
            request.decision,
            CheckpointDecision::Approved
                | CheckpointDecision::Rejected
                | CheckpointDecision::Overridden
        ) {
            return Err(MachineError::MalformedEvent(format!(
                "decision must be approved, rejected, or overridden, got {}",
                request.decision.as_str()
            )));
        }

        let run_id = self.store.run_for_checkpoint(checkpoint_id)?;
        let (outcome, events, resume) = self.store.transact::<_, MachineError>(run_id, |state| {
            self.apply_decision(state, checkpoint_id, request)
        })?;

        for e in &events {
            self.publisher.publish(e);
        }
        info!(
            run_id = %run_id,
            checkpoint_id = %checkpoint_id,
            decision = request.decision.as_str(),
            actor = %request.actor,
            "checkpoint decided"
        );

        if let Some(resume_request) = resume {
            if let Err(err) = self.transport.resume(&resume_request).await {
                return Err(self.fail_phase_for_resume(run_id, outcome.phase.phase, err));
            }
        }
        Ok(outcome)
    }

    #[allow(clippy::type_complexity)]
    fn apply_decision(
        &self,
        state: &mut RunState,
        checkpoint_id: CheckpointId,
        request: &DecisionRequest,
    ) -> Result<(DecisionOutcome, Vec<RunEvent>, Option<ResumeRequest>), MachineError> {
        let now = Utc::now();
        let (phase, kind, idempotency_key) = {
            let cp = state
                .checkpoint(checkpoint_id)
                .ok_or(StoreError::CheckpointNotFound(checkpoint_id))?;
            (cp.phase, cp.kind, cp.idempotency_key.clone())
        };
        let phase_status = state
            .latest_attempt(phase)
            .map(|r| r.status)
            .unwrap_or(PhaseStatus::NotStarted);
        let cp_decision = state
            .checkpoint(checkpoint_id)
            .map(|c| c.decision)
            .unwrap_or(CheckpointDecision::Pending);

        if cp_decision != CheckpointDecision::Pending
            || phase_status != PhaseStatus::AwaitingApproval
        {
            return Err(MachineError::StaleCheckpoint {
                checkpoint_id,
                decision: cp_decision,
                phase_status,
            });
        }

        if let Some(cp) = state.checkpoint_mut(checkpoint_id) {
            cp.decision = request.decision;
            cp.decided_by = Some(request.actor.clone());
            cp.decided_at = Some(now);
            cp.comment = request.comment.clone();
        }

        let mut events = Vec::new();
        let mut resume = None;

        if request.decision.resumes_worker() {
            if let Some(rec) = state.latest_attempt_mut(phase) {
                rec.status = PhaseStatus::Running;
            }
            resume = Some(ResumeRequest {
                run_id: state.run_id,
                checkpoint_type: kind,
                idempotency_key,
                decision: request.decision,
                comment: request.comment.clone(),
            });
            events.push(RunEvent::PhaseChanged {
                run_id: state.run_id,
                phase,
                status: PhaseStatus::Running,
                progress: state.latest_attempt(phase).map(|r| r.progress).unwrap_or(0),
                at: now,
            });
        } else if let Some(target) = request.fallback_phase {
            // A fallback may redo the rejected phase or an earlier one,
            // never a later one.
            if target > phase {
                return Err(MachineError::InvalidTransition {
                    phase: target,
                    from: state
                        .latest_attempt(target)
                        .map(|r| r.status)
                        .unwrap_or(PhaseStatus::NotStarted),
                    to: PhaseStatus::Running,
                });
            }
            revise_in_place(state, target, &request.actor, now);
            events.push(RunEvent::PhaseChanged {
                run_id: state.run_id,
                phase: target,
                status: PhaseStatus::Running,
                progress: 0,
                at: now,
            });
        } else {
            if let Some(rec) = state.latest_attempt_mut(phase) {
                rec.status = PhaseStatus::Failed;
                rec.completed_at = Some(now);
                rec.failure_reason = Some(format!("rejected at {kind}"));
            }
            events.push(RunEvent::PhaseChanged {
                run_id: state.run_id,
                phase,
                status: PhaseStatus::Failed,
                progress: state.latest_attempt(phase).map(|r| r.progress).unwrap_or(0),
                at: now,
            });
        }

        state.push_audit(
            &request.actor,
            "checkpoint_decided",
            format!("{kind}: {}", request.decision.as_str()),
            now,
        );
        events.push(RunEvent::CheckpointDecided {
            run_id: state.run_id,
            checkpoint_id,
            decision: request.decision,
            at: now,
        });

        let outcome = DecisionOutcome {
            checkpoint: state
                .checkpoint(checkpoint_id)
                .cloned()
                .ok_or(StoreError::CheckpointNotFound(checkpoint_id))?,
            phase: state
                .latest_attempt(phase)
                .cloned()
                .unwrap_or_else(|| PhaseRecord::new(phase)),
            run_version: state.version + 1,
        };
        Ok((outcome, events, resume))
    }

    /// Mark a phase Failed after resume delivery gave up, then surface the
    /// failure. The run stays consistent even though the worker never heard
    /// the decision; an operator re-runs delivery manually.
    fn fail_phase_for_resume(
        &self,
        run_id: RunId,
        phase: PhaseId,
        err: WorkerError,
    ) -> MachineError {
        let attempts = match &err {
            WorkerError::Exhausted { attempts, .. } => *attempts,
            _ => 1,
        };
        let reason = err.to_string();
        let now = Utc::now();
        let marked = self.store.transact::<_, MachineError>(run_id, |state| {
            if let Some(rec) = state.latest_attempt_mut(phase) {
                rec.status = PhaseStatus::Failed;
                rec.completed_at = Some(now);
                rec.failure_reason = Some("resume delivery failed".to_string());
            }
            state.push_audit("system", "resume_failed", reason.clone(), now);
            Ok(RunEvent::PhaseChanged {
                run_id,
                phase,
                status: PhaseStatus::Failed,
                progress: 0,
                at: now,
            })
        });
        match marked {
            Ok(event) => self.publisher.publish(&event),
            Err(mark_err) => warn!(
                run_id = %run_id,
                error = %mark_err,
                "failed to record resume failure"
            ),
        }
        warn!(run_id = %run_id, phase = %phase, attempts, "resume delivery failed");
        MachineError::WorkerUnreachable { attempts, reason }
    }

    /// Expire a pending checkpoint. Same guards as a decision; the phase is
    /// failed with an expiry reason and no resume is sent. Driven by an
    /// external sweep, never by the core itself.
    pub fn expire_checkpoint(
        &self,
        checkpoint_id: CheckpointId,
        actor: &str,
    ) -> Result<DecisionOutcome, MachineError> {
        let run_id = self.store.run_for_checkpoint(checkpoint_id)?;
        let (outcome, events) = self.store.transact::<_, MachineError>(run_id, |state| {
            let now = Utc::now();
            let (phase, kind) = {
                let cp = state
                    .checkpoint(checkpoint_id)
                    .ok_or(StoreError::CheckpointNotFound(checkpoint_id))?;
                (cp.phase, cp.kind)
            };
            let phase_status = state
                .latest_attempt(phase)
                .map(|r| r.status)
                .unwrap_or(PhaseStatus::NotStarted);
            let cp_decision = state
                .checkpoint(checkpoint_id)
                .map(|c| c.decision)
                .unwrap_or(CheckpointDecision::Pending);
            if cp_decision != CheckpointDecision::Pending
                || phase_status != PhaseStatus::AwaitingApproval
            {
                return Err(MachineError::StaleCheckpoint {
                    checkpoint_id,
                    decision: cp_decision,
                    phase_status,
                });
            }

            if let Some(cp) = state.checkpoint_mut(checkpoint_id) {
                cp.decision = CheckpointDecision::Expired;
                cp.decided_by = Some(actor.to_string());
                cp.decided_at = Some(now);
            }
            if let Some(rec) = state.latest_attempt_mut(phase) {
                rec.status = PhaseStatus::Failed;
                rec.completed_at = Some(now);
                rec.failure_reason = Some("checkpoint expired".to_string());
            }
            state.push_audit(actor, "checkpoint_expired", kind.to_string(), now);

            let events = vec![
                RunEvent::CheckpointDecided {
                    run_id: state.run_id,
                    checkpoint_id,
                    decision: CheckpointDecision::Expired,
                    at: now,
                },
                RunEvent::PhaseChanged {
                    run_id: state.run_id,
                    phase,
                    status: PhaseStatus::Failed,
                    progress: state.latest_attempt(phase).map(|r| r.progress).unwrap_or(0),
                    at: now,
                },
            ];
            let outcome = DecisionOutcome {
                checkpoint: state
                    .checkpoint(checkpoint_id)
                    .cloned()
                    .ok_or(StoreError::CheckpointNotFound(checkpoint_id))?,
                phase: state
                    .latest_attempt(phase)
                    .cloned()
                    .unwrap_or_else(|| PhaseRecord::new(phase)),
                run_version: state.version + 1,
            };
            Ok((outcome, events))
        })?;
        for e in &events {
            self.publisher.publish(e);
        }
        Ok(outcome)
    }

    /// Revise the run back to `target`, opening a fresh attempt. Revise only
    /// ever moves backwards; phases are sequential and are never skipped.
    /// Terminal attempts stay closed; evidence from the target phase onward
    /// is retained but marked superseded so gates see a clean slate.
    pub fn revise(
        &self,
        run_id: RunId,
        target: PhaseId,
        actor: &str,
    ) -> Result<RunSnapshot, MachineError> {
        let (snapshot, event) = self.store.transact::<_, MachineError>(run_id, |state| {
            if let Some(active) = state.active_attempt() {
                if active.status == PhaseStatus::AwaitingApproval {
                    return Err(MachineError::InvalidTransition {
                        phase: active.phase,
                        from: PhaseStatus::AwaitingApproval,
                        to: PhaseStatus::Running,
                    });
                }
            }
            if target >= state.current_phase {
                return Err(MachineError::InvalidTransition {
                    phase: target,
                    from: state
                        .latest_attempt(target)
                        .map(|r| r.status)
                        .unwrap_or(PhaseStatus::NotStarted),
                    to: PhaseStatus::Running,
                });
            }
            let now = Utc::now();
            revise_in_place(state, target, actor, now);
            let event = RunEvent::PhaseChanged {
                run_id,
                phase: target,
                status: PhaseStatus::Running,
                progress: 0,
                at: now,
            };
            let mut snapshot = state.snapshot();
            snapshot.version += 1;
            Ok((snapshot, event))
        })?;
        self.publisher.publish(&event);
        Ok(snapshot)
    }

    /// Append evidence outside the webhook path (analyst tooling), with the
    /// same gate re-evaluation and alerting as worker-submitted evidence.
    ///
    /// Callers that read a snapshot first can pass its version as
    /// `expected_version`; a stale expectation is rejected with
    /// `ConcurrentModification` and nothing is applied.
    pub fn append_evidence(
        &self,
        run_id: RunId,
        phase: PhaseId,
        items: &[NewEvidence],
        actor: &str,
        expected_version: Option<u64>,
    ) -> Result<GateResult, MachineError> {
        let criteria = self.criteria_for(phase);
        let apply = |state: &mut RunState| -> Result<GateResult, MachineError> {
            let now = Utc::now();
            for submission in items {
                state.append_evidence(build_evidence(run_id, phase, submission))?;
            }
            let active = state.active_evidence(phase);
            let result = evaluate(criteria, &active);
            state.push_audit(
                actor,
                "evidence_appended",
                format!("{} item(s) for {phase}", items.len()),
                now,
            );
            Ok(result)
        };
        let result = match expected_version {
            Some(expected) => self.store.transact_at(run_id, expected, apply)?,
            None => self.store.transact(run_id, apply)?,
        };

        let alert = self.monitor_lock().observe(
            run_id,
            phase,
            result.readiness,
            criteria.pass_threshold,
            Utc::now(),
        );
        if let Some(alert) = alert {
            self.publisher.publish(&RunEvent::ReadinessAlert {
                run_id,
                phase,
                readiness: alert.readiness,
                threshold: alert.threshold,
                at: alert.generated_at,
            });
        }
        Ok(result)
    }

    /// Recompute a phase gate on demand. Pure read: no version bump, no
    /// events, no alerts.
    pub fn gate(&self, run_id: RunId, phase: PhaseId) -> Result<GateResult, MachineError> {
        let criteria = self.criteria_for(phase);
        let result = self
            .store
            .read(run_id, |state| evaluate(criteria, &state.active_evidence(phase)))?;
        Ok(result)
    }
}

fn parse_payload<T: serde::de::DeserializeOwned + Default>(value: &Value) -> Result<T, Tx> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone())
        .map_err(|e| Tx::Fail(MachineError::MalformedEvent(e.to_string())))
}

fn build_evidence(run_id: RunId, phase: PhaseId, submission: &NewEvidence) -> EvidenceItem {
    EvidenceItem {
        id: Uuid::new_v4(),
        run_id,
        phase,
        kind: submission.kind,
        strength: submission.strength,
        quality_score: submission.quality_score,
        source: submission.source.clone(),
        created_at: Utc::now(),
        supersedes: submission.supersedes,
        superseded_by_revision: false,
    }
}

/// Worker events must target the run's current phase; anything else is an
/// ordering violation, not a retryable race.
fn guard_current_phase(state: &RunState, phase: PhaseId) -> Result<(), Tx> {
    if phase != state.current_phase {
        let from = state
            .latest_attempt(phase)
            .map(|r| r.status)
            .unwrap_or(PhaseStatus::NotStarted);
        return Err(Tx::Fail(MachineError::InvalidTransition {
            phase,
            from,
            to: PhaseStatus::Running,
        }));
    }
    Ok(())
}

/// Bring the current phase's attempt to Running, starting it if needed.
fn ensure_running(
    state: &mut RunState,
    phase: PhaseId,
    now: chrono::DateTime<Utc>,
) -> Result<(), Tx> {
    let status = state
        .latest_attempt(phase)
        .map(|r| r.status)
        .unwrap_or(PhaseStatus::NotStarted);
    match status {
        PhaseStatus::Running => Ok(()),
        PhaseStatus::NotStarted => {
            state.begin_attempt(phase, now);
            Ok(())
        }
        other => Err(Tx::Fail(MachineError::InvalidTransition {
            phase,
            from: other,
            to: PhaseStatus::Running,
        })),
    }
}

fn apply_completed(
    state: &mut RunState,
    event: &WorkerEvent,
    events: &mut Vec<RunEvent>,
) -> Result<(), Tx> {
    guard_current_phase(state, event.phase)?;
    let now = Utc::now();
    let status = state
        .latest_attempt(event.phase)
        .map(|r| r.status)
        .unwrap_or(PhaseStatus::NotStarted);
    if status != PhaseStatus::Running {
        return Err(Tx::Fail(MachineError::InvalidTransition {
            phase: event.phase,
            from: status,
            to: PhaseStatus::Completed,
        }));
    }
    if let Some(rec) = state.latest_attempt_mut(event.phase) {
        rec.status = PhaseStatus::Completed;
        rec.progress = 100;
        rec.completed_at = Some(now);
    }
    // The next phase becomes current but stays NotStarted until the worker
    // sends its first event for it.
    if let Some(next) = event.phase.next() {
        state.current_phase = next;
    }
    state.push_audit("worker", "phase_completed", event.phase.to_string(), now);
    events.push(RunEvent::PhaseChanged {
        run_id: state.run_id,
        phase: event.phase,
        status: PhaseStatus::Completed,
        progress: 100,
        at: now,
    });
    Ok(())
}

fn apply_failed(
    state: &mut RunState,
    event: &WorkerEvent,
    events: &mut Vec<RunEvent>,
) -> Result<(), Tx> {
    guard_current_phase(state, event.phase)?;
    let now = Utc::now();
    let status = state
        .latest_attempt(event.phase)
        .map(|r| r.status)
        .unwrap_or(PhaseStatus::NotStarted);
    if !status.is_active() {
        return Err(Tx::Fail(MachineError::InvalidTransition {
            phase: event.phase,
            from: status,
            to: PhaseStatus::Failed,
        }));
    }
    let payload: FailurePayload = parse_payload(&event.payload)?;
    if let Some(rec) = state.latest_attempt_mut(event.phase) {
        rec.status = PhaseStatus::Failed;
        rec.completed_at = Some(now);
        rec.failure_reason = payload.reason.or(Some("worker reported failure".to_string()));
    }
    state.push_audit("worker", "phase_failed", event.phase.to_string(), now);
    events.push(RunEvent::PhaseChanged {
        run_id: state.run_id,
        phase: event.phase,
        status: PhaseStatus::Failed,
        progress: state
            .latest_attempt(event.phase)
            .map(|r| r.progress)
            .unwrap_or(0),
        at: now,
    });
    Ok(())
}

/// Shared revise mechanics: close the active attempt, supersede evidence
/// from the target onward, open a fresh attempt, audit the jump.
fn revise_in_place(state: &mut RunState, target: PhaseId, actor: &str, now: chrono::DateTime<Utc>) {
    let previous = state.current_phase;
    let active_phase = state.active_attempt().map(|r| r.phase);
    if let Some(phase) = active_phase {
        if let Some(rec) = state.latest_attempt_mut(phase) {
            rec.status = PhaseStatus::Failed;
            rec.completed_at = Some(now);
            rec.failure_reason = Some(format!("superseded by revise to {target}"));
        }
    }
    state.supersede_evidence_from(target);
    state.begin_attempt(target, now);
    state.push_audit(
        actor,
        "revise",
        format!("from {previous} to {target}"),
        now,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::EventPublisher;
    use async_trait::async_trait;
    use serde_json::json;
    use stagegate_types::CheckpointKind;

    struct MockTransport {
        calls: Mutex<Vec<ResumeRequest>>,
        fail: bool,
    }

    impl MockTransport {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail,
            })
        }

        fn calls(&self) -> Vec<ResumeRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ResumeTransport for MockTransport {
        async fn resume(&self, request: &ResumeRequest) -> Result<(), WorkerError> {
            self.calls.lock().unwrap().push(request.clone());
            if self.fail {
                Err(WorkerError::Exhausted {
                    attempts: 5,
                    last_error: "connection refused".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<RunEvent>>,
    }

    impl EventPublisher for RecordingPublisher {
        fn publish(&self, event: &RunEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    struct Harness {
        machine: Machine,
        transport: Arc<MockTransport>,
        publisher: Arc<RecordingPublisher>,
        run_id: RunId,
    }

    fn harness(fail_resume: bool) -> Harness {
        let store = Arc::new(RunStore::new());
        let transport = MockTransport::new(fail_resume);
        let publisher = Arc::new(RecordingPublisher::default());
        let machine = Machine::new(
            Arc::clone(&store),
            &Config::default(),
            transport.clone(),
            publisher.clone(),
        );
        let run_id = store.create_run().run_id;
        Harness {
            machine,
            transport,
            publisher,
            run_id,
        }
    }

    fn progress(run_id: RunId, phase: PhaseId, key: &str, payload: Value) -> WorkerEvent {
        WorkerEvent {
            run_id,
            event_type: WorkerEventType::PhaseProgress,
            phase,
            checkpoint_type: None,
            idempotency_key: key.to_string(),
            payload,
        }
    }

    fn checkpoint_request(run_id: RunId, phase: PhaseId, kind: CheckpointKind, key: &str) -> WorkerEvent {
        WorkerEvent {
            run_id,
            event_type: WorkerEventType::CheckpointRequested,
            phase,
            checkpoint_type: Some(kind),
            idempotency_key: key.to_string(),
            payload: Value::Null,
        }
    }

    fn completed(run_id: RunId, phase: PhaseId, key: &str) -> WorkerEvent {
        WorkerEvent {
            run_id,
            event_type: WorkerEventType::PhaseCompleted,
            phase,
            checkpoint_type: None,
            idempotency_key: key.to_string(),
            payload: Value::Null,
        }
    }

    fn decision(decision: CheckpointDecision) -> DecisionRequest {
        DecisionRequest {
            decision,
            actor: "reviewer@example.com".to_string(),
            comment: None,
            fallback_phase: None,
        }
    }

    fn pending_checkpoint(h: &Harness) -> CheckpointId {
        h.machine
            .handle_worker_event(&checkpoint_request(
                h.run_id,
                PhaseId::Brief,
                CheckpointKind::ApproveBrief,
                "wk-brief-cp",
            ))
            .unwrap();
        h.machine
            .store()
            .snapshot(h.run_id)
            .unwrap()
            .checkpoints[0]
            .id
    }

    #[test]
    fn test_progress_starts_phase() {
        let h = harness(false);
        let ack = h
            .machine
            .handle_worker_event(&progress(
                h.run_id,
                PhaseId::Brief,
                "wk-1",
                json!({"progress": 40}),
            ))
            .unwrap();
        assert_eq!(ack.disposition, EventDisposition::Applied);
        let snap = h.machine.store().snapshot(h.run_id).unwrap();
        assert_eq!(snap.phases[0].status, PhaseStatus::Running);
        assert_eq!(snap.phases[0].progress, 40);
        assert_eq!(snap.version, 2);
    }

    #[test]
    fn test_duplicate_event_acks_without_state_change() {
        let h = harness(false);
        let event = progress(h.run_id, PhaseId::Brief, "wk-1", json!({"progress": 40}));
        let first = h.machine.handle_worker_event(&event).unwrap();
        assert_eq!(first.disposition, EventDisposition::Applied);

        let mut replay = event.clone();
        replay.payload = json!({"progress": 99});
        let second = h.machine.handle_worker_event(&replay).unwrap();
        assert_eq!(second.disposition, EventDisposition::Duplicate);
        assert_eq!(second.run_version, first.run_version);

        let snap = h.machine.store().snapshot(h.run_id).unwrap();
        assert_eq!(snap.phases[0].progress, 40);
    }

    #[test]
    fn test_event_for_non_current_phase_rejected() {
        let h = harness(false);
        let err = h
            .machine
            .handle_worker_event(&progress(
                h.run_id,
                PhaseId::Discovery,
                "wk-ooo",
                json!({"progress": 10}),
            ))
            .unwrap_err();
        assert!(matches!(err, MachineError::InvalidTransition { .. }));
        // Nothing applied, key not burned.
        assert_eq!(h.machine.store().snapshot(h.run_id).unwrap().version, 1);
    }

    #[test]
    fn test_progress_is_monotonic_within_attempt() {
        let h = harness(false);
        h.machine
            .handle_worker_event(&progress(h.run_id, PhaseId::Brief, "wk-1", json!({"progress": 60})))
            .unwrap();
        h.machine
            .handle_worker_event(&progress(h.run_id, PhaseId::Brief, "wk-2", json!({"progress": 30})))
            .unwrap();
        let snap = h.machine.store().snapshot(h.run_id).unwrap();
        assert_eq!(snap.phases[0].progress, 60);
    }

    #[test]
    fn test_checkpoint_request_without_kind_rejected() {
        let h = harness(false);
        let mut event = checkpoint_request(
            h.run_id,
            PhaseId::Brief,
            CheckpointKind::ApproveBrief,
            "wk-cp",
        );
        event.checkpoint_type = None;
        assert!(matches!(
            h.machine.handle_worker_event(&event),
            Err(MachineError::MalformedEvent(_))
        ));
    }

    #[tokio::test]
    async fn test_approve_resumes_worker_with_original_key() {
        let h = harness(false);
        let cp_id = pending_checkpoint(&h);

        let outcome = h
            .machine
            .record_decision(cp_id, &decision(CheckpointDecision::Approved))
            .await
            .unwrap();
        assert_eq!(outcome.checkpoint.decision, CheckpointDecision::Approved);
        assert_eq!(outcome.phase.status, PhaseStatus::Running);

        let calls = h.transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].idempotency_key, "wk-brief-cp");
        assert_eq!(calls[0].decision, CheckpointDecision::Approved);
        assert_eq!(calls[0].checkpoint_type, CheckpointKind::ApproveBrief);
    }

    #[tokio::test]
    async fn test_second_decision_is_stale() {
        let h = harness(false);
        let cp_id = pending_checkpoint(&h);
        h.machine
            .record_decision(cp_id, &decision(CheckpointDecision::Approved))
            .await
            .unwrap();
        let err = h
            .machine
            .record_decision(cp_id, &decision(CheckpointDecision::Rejected))
            .await
            .unwrap_err();
        assert!(matches!(err, MachineError::StaleCheckpoint { .. }));
        // First decision untouched.
        let snap = h.machine.store().snapshot(h.run_id).unwrap();
        assert_eq!(snap.checkpoints[0].decision, CheckpointDecision::Approved);
    }

    #[tokio::test]
    async fn test_reject_without_fallback_fails_phase() {
        let h = harness(false);
        let cp_id = pending_checkpoint(&h);
        let outcome = h
            .machine
            .record_decision(cp_id, &decision(CheckpointDecision::Rejected))
            .await
            .unwrap();
        assert_eq!(outcome.phase.status, PhaseStatus::Failed);
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reject_with_fallback_revises() {
        let h = harness(false);
        // Put evidence on Brief so the revise has something to supersede.
        h.machine
            .handle_worker_event(&progress(
                h.run_id,
                PhaseId::Brief,
                "wk-ev",
                json!({"evidence": [{
                    "kind": "interview",
                    "strength": "strong",
                    "qualityScore": 0.9,
                    "source": "founder call"
                }]}),
            ))
            .unwrap();
        let cp_id = pending_checkpoint(&h);

        let mut request = decision(CheckpointDecision::Rejected);
        request.fallback_phase = Some(PhaseId::Brief);
        h.machine.record_decision(cp_id, &request).await.unwrap();

        let (attempt, active_evidence) = h
            .machine
            .store()
            .read(h.run_id, |state| {
                (
                    state.latest_attempt(PhaseId::Brief).cloned().unwrap(),
                    state.active_evidence(PhaseId::Brief).len(),
                )
            })
            .unwrap();
        assert_eq!(attempt.attempt, 2);
        assert_eq!(attempt.status, PhaseStatus::Running);
        assert_eq!(active_evidence, 0);
    }

    #[tokio::test]
    async fn test_resume_exhaustion_fails_phase() {
        let h = harness(true);
        let cp_id = pending_checkpoint(&h);
        let err = h
            .machine
            .record_decision(cp_id, &decision(CheckpointDecision::Approved))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MachineError::WorkerUnreachable { attempts: 5, .. }
        ));
        let snap = h.machine.store().snapshot(h.run_id).unwrap();
        assert_eq!(snap.phases[0].status, PhaseStatus::Failed);
        assert_eq!(
            snap.phases[0].failure_reason.as_deref(),
            Some("resume delivery failed")
        );
        // The decision itself stays recorded.
        assert_eq!(snap.checkpoints[0].decision, CheckpointDecision::Approved);
    }

    #[test]
    fn test_expire_checkpoint_fails_phase() {
        let h = harness(false);
        let cp_id = pending_checkpoint(&h);
        let outcome = h.machine.expire_checkpoint(cp_id, "sweep").unwrap();
        assert_eq!(outcome.checkpoint.decision, CheckpointDecision::Expired);
        assert_eq!(outcome.phase.status, PhaseStatus::Failed);
        assert_eq!(
            outcome.phase.failure_reason.as_deref(),
            Some("checkpoint expired")
        );
        // Second expiry hits the same staleness guard as decisions.
        assert!(matches!(
            h.machine.expire_checkpoint(cp_id, "sweep"),
            Err(MachineError::StaleCheckpoint { .. })
        ));
    }

    #[test]
    fn test_phase_completed_advances_current_phase() {
        let h = harness(false);
        h.machine
            .handle_worker_event(&progress(h.run_id, PhaseId::Brief, "wk-1", json!({"progress": 80})))
            .unwrap();
        h.machine
            .handle_worker_event(&completed(h.run_id, PhaseId::Brief, "wk-2"))
            .unwrap();
        let snap = h.machine.store().snapshot(h.run_id).unwrap();
        assert_eq!(snap.current_phase, PhaseId::Discovery);
        assert_eq!(snap.phases[0].status, PhaseStatus::Completed);
        assert_eq!(snap.phases[0].progress, 100);
        assert_eq!(snap.phases[1].status, PhaseStatus::NotStarted);
    }

    #[test]
    fn test_evidence_alert_fires_once() {
        let h = harness(false);
        let items = [NewEvidence {
            kind: EvidenceKind::Interview,
            strength: EvidenceStrength::Strong,
            quality_score: 0.9,
            source: "founder call".to_string(),
            supersedes: None,
        }];
        // Brief gate needs one item; quality 0.9 clears the pass threshold.
        h.machine
            .append_evidence(h.run_id, PhaseId::Brief, &items, "analyst", None)
            .unwrap();
        h.machine
            .append_evidence(h.run_id, PhaseId::Brief, &items, "analyst", None)
            .unwrap();
        let alerts = h
            .publisher
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, RunEvent::ReadinessAlert { .. }))
            .count();
        assert_eq!(alerts, 1);
    }

    #[test]
    fn test_evidence_with_stale_expected_version_conflicts() {
        let h = harness(false);
        let items = [NewEvidence {
            kind: EvidenceKind::Interview,
            strength: EvidenceStrength::Strong,
            quality_score: 0.9,
            source: "founder call".to_string(),
            supersedes: None,
        }];
        h.machine
            .append_evidence(h.run_id, PhaseId::Brief, &items, "analyst", Some(1))
            .unwrap();
        let err = h
            .machine
            .append_evidence(h.run_id, PhaseId::Brief, &items, "analyst", Some(1))
            .unwrap_err();
        assert!(matches!(
            err,
            MachineError::Store(StoreError::ConcurrentModification {
                expected: 1,
                found: 2,
                ..
            })
        ));
        // The losing write applied nothing.
        let count = h
            .machine
            .store()
            .read(h.run_id, |s| s.evidence.len())
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_gate_read_does_not_mutate() {
        let h = harness(false);
        let before = h.machine.store().snapshot(h.run_id).unwrap().version;
        let a = h.machine.gate(h.run_id, PhaseId::Desirability).unwrap();
        let b = h.machine.gate(h.run_id, PhaseId::Desirability).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            h.machine.store().snapshot(h.run_id).unwrap().version,
            before
        );
    }

    #[test]
    fn test_revise_blocked_while_awaiting_approval() {
        let h = harness(false);
        let _cp = pending_checkpoint(&h);
        assert!(matches!(
            h.machine.revise(h.run_id, PhaseId::Brief, "analyst"),
            Err(MachineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_revise_never_moves_forward() {
        let h = harness(false);
        // A fresh run sits at Brief; every other phase is later.
        let err = h
            .machine
            .revise(h.run_id, PhaseId::Viability, "analyst")
            .unwrap_err();
        assert!(matches!(
            err,
            MachineError::InvalidTransition {
                phase: PhaseId::Viability,
                ..
            }
        ));
        // Revising to the current phase is not a revise either.
        assert!(h.machine.revise(h.run_id, PhaseId::Brief, "analyst").is_err());
        let snap = h.machine.store().snapshot(h.run_id).unwrap();
        assert_eq!(snap.current_phase, PhaseId::Brief);
        assert_eq!(snap.version, 1);
    }

    #[tokio::test]
    async fn test_reject_with_forward_fallback_rejected() {
        let h = harness(false);
        let cp_id = pending_checkpoint(&h);
        let mut request = decision(CheckpointDecision::Rejected);
        request.fallback_phase = Some(PhaseId::Feasibility);
        let err = h.machine.record_decision(cp_id, &request).await.unwrap_err();
        assert!(matches!(err, MachineError::InvalidTransition { .. }));
        // The whole decision rolled back; the checkpoint is still pending.
        let snap = h.machine.store().snapshot(h.run_id).unwrap();
        assert_eq!(snap.checkpoints[0].decision, CheckpointDecision::Pending);
        assert_eq!(snap.phases[0].status, PhaseStatus::AwaitingApproval);
    }

    #[test]
    fn test_revise_opens_new_attempt_and_supersedes() {
        let h = harness(false);
        h.machine
            .handle_worker_event(&progress(h.run_id, PhaseId::Brief, "wk-1", json!({"progress": 80})))
            .unwrap();
        h.machine
            .handle_worker_event(&completed(h.run_id, PhaseId::Brief, "wk-2"))
            .unwrap();
        let snap = h.machine.revise(h.run_id, PhaseId::Brief, "analyst").unwrap();
        assert_eq!(snap.current_phase, PhaseId::Brief);
        let attempt = h
            .machine
            .store()
            .read(h.run_id, |s| s.latest_attempt(PhaseId::Brief).cloned())
            .unwrap()
            .unwrap();
        assert_eq!(attempt.attempt, 2);
        assert_eq!(attempt.status, PhaseStatus::Running);
        // The completed first attempt stays closed.
        let first = h
            .machine
            .store()
            .read(h.run_id, |s| {
                s.phases
                    .iter()
                    .find(|r| r.phase == PhaseId::Brief && r.attempt == 1)
                    .cloned()
            })
            .unwrap()
            .unwrap();
        assert_eq!(first.status, PhaseStatus::Completed);
    }
}
