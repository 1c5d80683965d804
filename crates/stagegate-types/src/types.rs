use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a validation run (one per project).
pub type RunId = Uuid;

/// Identifier of a checkpoint.
pub type CheckpointId = Uuid;

/// Phase identifiers for the validation pipeline.
///
/// A `ValidationRun` progresses through five sequential phases. Phases
/// execute in order; the current phase is monotonically non-decreasing
/// except for an explicit, audit-logged revise transition.
///
/// ```text
/// Brief → Discovery → Desirability → Feasibility → Viability
/// ```
///
/// # Serialization
///
/// `PhaseId` serializes to its zero-based index (`0`–`4`), matching the
/// webhook wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PhaseId {
    /// Entrepreneur brief: structured capture of the business idea.
    Brief,
    /// Discovery: customer, problem, and market research.
    Discovery,
    /// Desirability: evidence that customers want the solution.
    Desirability,
    /// Feasibility: evidence that the solution can be built and priced.
    Feasibility,
    /// Viability: evidence that the business model sustains itself.
    Viability,
}

impl PhaseId {
    /// All phases in execution order.
    pub const ALL: [Self; 5] = [
        Self::Brief,
        Self::Discovery,
        Self::Desirability,
        Self::Feasibility,
        Self::Viability,
    ];

    /// Canonical lowercase name used in logs, status output, and routes.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Brief => "brief",
            Self::Discovery => "discovery",
            Self::Desirability => "desirability",
            Self::Feasibility => "feasibility",
            Self::Viability => "viability",
        }
    }

    /// Zero-based index (0–4) used on the wire.
    #[must_use]
    pub const fn index(&self) -> u8 {
        match self {
            Self::Brief => 0,
            Self::Discovery => 1,
            Self::Desirability => 2,
            Self::Feasibility => 3,
            Self::Viability => 4,
        }
    }

    /// The phase that follows this one, if any.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self {
            Self::Brief => Some(Self::Discovery),
            Self::Discovery => Some(Self::Desirability),
            Self::Desirability => Some(Self::Feasibility),
            Self::Feasibility => Some(Self::Viability),
            Self::Viability => None,
        }
    }
}

impl TryFrom<u8> for PhaseId {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Brief),
            1 => Ok(Self::Discovery),
            2 => Ok(Self::Desirability),
            3 => Ok(Self::Feasibility),
            4 => Ok(Self::Viability),
            other => Err(format!("invalid phase index {other} (expected 0-4)")),
        }
    }
}

impl From<PhaseId> for u8 {
    fn from(value: PhaseId) -> Self {
        value.index()
    }
}

impl std::fmt::Display for PhaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a phase attempt.
///
/// ```text
/// NotStarted → Running → {AwaitingApproval ⇄ Running} → {Completed | Failed}
/// ```
///
/// `AwaitingApproval → Running` occurs only through an approved or
/// overridden checkpoint decision. `Completed` and `Failed` are terminal
/// for the attempt; a revise creates a new attempt rather than reopening
/// a terminal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    NotStarted,
    Running,
    AwaitingApproval,
    Approved,
    Rejected,
    Completed,
    Failed,
}

impl PhaseStatus {
    /// Whether this status admits no further transitions for the attempt.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the attempt currently occupies the run's single active slot.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::AwaitingApproval)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// The ten canonical human-approval gates.
///
/// Each kind belongs to a fixed home phase; the worker requests at most a
/// handful per phase, and the same kind can recur across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    ApproveBrief,
    ApproveDiscoveryOutput,
    ApproveCustomerProfile,
    ApproveValueMap,
    ApproveDesirabilityEvidence,
    ApproveExperimentPlan,
    ApprovePricingTest,
    ApproveFeasibilityAssessment,
    ApproveViabilityModel,
    ApproveFinalReport,
}

impl CheckpointKind {
    /// The phase this checkpoint kind guards.
    #[must_use]
    pub const fn home_phase(&self) -> PhaseId {
        match self {
            Self::ApproveBrief => PhaseId::Brief,
            Self::ApproveDiscoveryOutput | Self::ApproveCustomerProfile => PhaseId::Discovery,
            Self::ApproveValueMap
            | Self::ApproveDesirabilityEvidence
            | Self::ApproveExperimentPlan => PhaseId::Desirability,
            Self::ApprovePricingTest | Self::ApproveFeasibilityAssessment => PhaseId::Feasibility,
            Self::ApproveViabilityModel | Self::ApproveFinalReport => PhaseId::Viability,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ApproveBrief => "approve_brief",
            Self::ApproveDiscoveryOutput => "approve_discovery_output",
            Self::ApproveCustomerProfile => "approve_customer_profile",
            Self::ApproveValueMap => "approve_value_map",
            Self::ApproveDesirabilityEvidence => "approve_desirability_evidence",
            Self::ApproveExperimentPlan => "approve_experiment_plan",
            Self::ApprovePricingTest => "approve_pricing_test",
            Self::ApproveFeasibilityAssessment => "approve_feasibility_assessment",
            Self::ApproveViabilityModel => "approve_viability_model",
            Self::ApproveFinalReport => "approve_final_report",
        }
    }
}

impl std::fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision state of a checkpoint. Once non-Pending the decision is
/// immutable; corrections happen through new checkpoints, never edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointDecision {
    Pending,
    Approved,
    Rejected,
    Overridden,
    /// Expired by an external sweep; treated like a rejection for the phase.
    Expired,
}

impl CheckpointDecision {
    /// Whether the decision unblocks the worker (resume is sent).
    #[must_use]
    pub const fn resumes_worker(&self) -> bool {
        matches!(self, Self::Approved | Self::Overridden)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Overridden => "overridden",
            Self::Expired => "expired",
        }
    }
}

/// Categories of evidence collected during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    /// Customer interview notes or recordings.
    Interview,
    /// Product or market analytics data.
    Analytics,
    /// A structured experiment with a measured outcome.
    Experiment,
    /// Desk research: reports, articles, third-party data.
    Desk,
}

impl EvidenceKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Interview => "interview",
            Self::Analytics => "analytics",
            Self::Experiment => "experiment",
            Self::Desk => "desk",
        }
    }
}

impl std::fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How strongly a piece of evidence supports its claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceStrength {
    Weak,
    Medium,
    Strong,
}

/// A single piece of validation evidence.
///
/// Evidence is append-only. A correction is a new item whose `supersedes`
/// field references the corrected item; the original is never edited, so
/// the audit trail stays intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceItem {
    pub id: Uuid,
    pub run_id: RunId,
    pub phase: PhaseId,
    pub kind: EvidenceKind,
    pub strength: EvidenceStrength,
    /// Quality score in `[0.0, 1.0]`.
    pub quality_score: f64,
    /// Where the evidence came from (tool, interviewer, data source).
    pub source: String,
    pub created_at: DateTime<Utc>,
    /// Item this one corrects, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<Uuid>,
    /// Set when a revise transition marks this item as belonging to a
    /// superseded phase attempt. Superseded items are excluded from gate
    /// evaluation but retained for audit.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub superseded_by_revision: bool,
}

/// A human-approval gate within a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub run_id: RunId,
    pub phase: PhaseId,
    pub kind: CheckpointKind,
    pub requested_at: DateTime<Utc>,
    pub decision: CheckpointDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Correlates to exactly one external-worker request; replays of the
    /// same key are acknowledged without effect.
    pub idempotency_key: String,
}

impl Checkpoint {
    /// Whether a decision can still be recorded against this checkpoint.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self.decision, CheckpointDecision::Pending)
    }
}

/// One attempt at a phase. A revise creates a fresh attempt with
/// `attempt + 1` rather than reopening a terminal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRecord {
    pub phase: PhaseId,
    pub attempt: u32,
    pub status: PhaseStatus,
    /// Progress within the phase, 0–100.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl PhaseRecord {
    #[must_use]
    pub fn new(phase: PhaseId) -> Self {
        Self {
            phase,
            attempt: 1,
            status: PhaseStatus::NotStarted,
            progress: 0,
            started_at: None,
            completed_at: None,
            failure_reason: None,
        }
    }
}

/// Immutable audit record of a state-changing action.
///
/// Audit entries are appended alongside the mutation they describe and are
/// never rewritten; later corrections add entries instead of editing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub run_id: RunId,
    pub at: DateTime<Utc>,
    /// Human actor or `"worker"` / `"system"`.
    pub actor: String,
    /// Machine-readable action name, e.g. `"checkpoint_decided"`.
    pub action: String,
    pub detail: String,
}

/// Read-only view of a run, served to dashboards and used by subscribers to
/// reconcile after missed events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub current_phase: PhaseId,
    /// Weighted completion across all phases, 0–100.
    pub overall_progress: u8,
    pub phases: Vec<PhaseRecord>,
    pub checkpoints: Vec<Checkpoint>,
    pub evidence_count: usize,
    /// Store version counter; mutations carrying a stale version fail.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
