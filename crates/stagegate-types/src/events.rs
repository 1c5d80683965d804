//! Wire events: inbound worker webhooks and outbound subscriber events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{CheckpointKind, PhaseId};

/// Event types a worker may deliver over the webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerEventType {
    PhaseProgress,
    CheckpointRequested,
    PhaseCompleted,
    PhaseFailed,
}

impl WorkerEventType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PhaseProgress => "phase_progress",
            Self::CheckpointRequested => "checkpoint_requested",
            Self::PhaseCompleted => "phase_completed",
            Self::PhaseFailed => "phase_failed",
        }
    }
}

/// An inbound event from a pipeline worker.
///
/// Every event carries an idempotency key; redelivery of a key already in
/// the ledger is acknowledged without re-applying the mutation.
///
/// # Example
///
/// ```
/// use stagegate_types::{WorkerEvent, WorkerEventType, PhaseId};
///
/// let raw = r#"{
///     "runId": "5f0c54e6-1bb4-4e9e-93f4-6c40975a6a0e",
///     "eventType": "phase_progress",
///     "phase": 2,
///     "idempotencyKey": "wk-01-progress-40",
///     "payload": {"progress": 40}
/// }"#;
/// let event: WorkerEvent = serde_json::from_str(raw).unwrap();
/// assert_eq!(event.event_type, WorkerEventType::PhaseProgress);
/// assert_eq!(event.phase, PhaseId::Desirability);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerEvent {
    pub run_id: Uuid,
    pub event_type: WorkerEventType,
    pub phase: PhaseId,
    /// Which approval to open; only meaningful for `checkpoint_requested`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_type: Option<CheckpointKind>,
    pub idempotency_key: String,
    /// Event-specific body: progress percent, evidence batch, failure reason.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// How an inbound worker event was disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDisposition {
    Applied,
    /// Idempotency key already seen; no state changed.
    Duplicate,
}

/// Acknowledgement returned to the worker for a webhook delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAck {
    pub run_id: Uuid,
    pub disposition: EventDisposition,
    pub run_version: u64,
}

/// Events published to subscribers (dashboards, notifiers) after a
/// mutation commits. Never published for duplicate deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    PhaseChanged {
        run_id: Uuid,
        phase: PhaseId,
        status: crate::types::PhaseStatus,
        progress: u8,
        at: DateTime<Utc>,
    },
    CheckpointRequested {
        run_id: Uuid,
        checkpoint_id: Uuid,
        phase: PhaseId,
        kind: CheckpointKind,
        at: DateTime<Utc>,
    },
    CheckpointDecided {
        run_id: Uuid,
        checkpoint_id: Uuid,
        decision: crate::types::CheckpointDecision,
        at: DateTime<Utc>,
    },
    ReadinessAlert {
        run_id: Uuid,
        phase: PhaseId,
        readiness: f64,
        threshold: f64,
        at: DateTime<Utc>,
    },
}

impl RunEvent {
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        match self {
            Self::PhaseChanged { run_id, .. }
            | Self::CheckpointRequested { run_id, .. }
            | Self::CheckpointDecided { run_id, .. }
            | Self::ReadinessAlert { run_id, .. } => *run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_event_parses_camel_case() {
        let raw = r#"{
            "runId": "5f0c54e6-1bb4-4e9e-93f4-6c40975a6a0e",
            "eventType": "checkpoint_requested",
            "phase": 0,
            "checkpointType": "approve_brief",
            "idempotencyKey": "wk-brief-cp",
            "payload": {}
        }"#;
        let event: WorkerEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.event_type, WorkerEventType::CheckpointRequested);
        assert_eq!(event.checkpoint_type, Some(CheckpointKind::ApproveBrief));
        assert_eq!(event.phase, PhaseId::Brief);
    }

    #[test]
    fn test_worker_event_payload_defaults_to_null() {
        let raw = r#"{
            "runId": "5f0c54e6-1bb4-4e9e-93f4-6c40975a6a0e",
            "eventType": "phase_completed",
            "phase": 1,
            "idempotencyKey": "wk-disc-done"
        }"#;
        let event: WorkerEvent = serde_json::from_str(raw).unwrap();
        assert!(event.payload.is_null());
        assert!(event.checkpoint_type.is_none());
    }

    #[test]
    fn test_run_event_tagged_by_type() {
        let event = RunEvent::ReadinessAlert {
            run_id: Uuid::nil(),
            phase: PhaseId::Desirability,
            readiness: 0.82,
            threshold: 0.8,
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "readiness_alert");
        assert_eq!(json["phase"], 2);
    }

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(WorkerEventType::PhaseProgress.as_str(), "phase_progress");
        assert_eq!(WorkerEventType::PhaseFailed.as_str(), "phase_failed");
    }
}
