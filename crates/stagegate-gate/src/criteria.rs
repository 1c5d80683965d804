//! Per-phase gate criteria and their compiled-in defaults.

use serde::{Deserialize, Serialize};
use stagegate_types::{EvidenceKind, PhaseId};

/// Weights for combining the three readiness components. Must sum to a
/// positive value; `Config::validate` enforces this for overrides.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    /// Evidence-count ratio against `min_total_evidence`.
    pub count: f64,
    /// Mean quality score of the active evidence.
    pub quality: f64,
    /// Experiment-count ratio against `min_experiments`.
    pub experiments: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            count: 0.4,
            quality: 0.35,
            experiments: 0.25,
        }
    }
}

/// What a phase's evidence base must look like before its gate passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateCriteria {
    pub min_total_evidence: usize,
    pub min_experiments: usize,
    /// Minimum acceptable mean quality, 0.0–1.0.
    pub min_evidence_quality: f64,
    /// Kinds that must each appear at least once.
    pub required_kinds: Vec<EvidenceKind>,
    #[serde(default)]
    pub weights: ScoreWeights,
    /// Readiness at or above this passes (absent blocking reasons).
    pub pass_threshold: f64,
    /// Readiness below this fails outright.
    pub fail_threshold: f64,
}

impl GateCriteria {
    /// Default criteria ladder. Later phases are strictly stricter: more
    /// evidence, more experiments, higher quality.
    #[must_use]
    pub fn defaults_for(phase: PhaseId) -> Self {
        match phase {
            PhaseId::Brief => Self {
                min_total_evidence: 1,
                min_experiments: 0,
                min_evidence_quality: 0.5,
                required_kinds: vec![],
                weights: ScoreWeights::default(),
                pass_threshold: 0.6,
                fail_threshold: 0.3,
            },
            PhaseId::Discovery => Self {
                min_total_evidence: 6,
                min_experiments: 1,
                min_evidence_quality: 0.6,
                required_kinds: vec![EvidenceKind::Interview, EvidenceKind::Desk],
                weights: ScoreWeights::default(),
                pass_threshold: 0.7,
                fail_threshold: 0.35,
            },
            PhaseId::Desirability => Self {
                min_total_evidence: 10,
                min_experiments: 5,
                min_evidence_quality: 0.7,
                required_kinds: vec![
                    EvidenceKind::Interview,
                    EvidenceKind::Analytics,
                    EvidenceKind::Experiment,
                ],
                weights: ScoreWeights::default(),
                pass_threshold: 0.8,
                fail_threshold: 0.4,
            },
            PhaseId::Feasibility => Self {
                min_total_evidence: 12,
                min_experiments: 6,
                min_evidence_quality: 0.75,
                required_kinds: vec![EvidenceKind::Analytics, EvidenceKind::Experiment],
                weights: ScoreWeights::default(),
                pass_threshold: 0.82,
                fail_threshold: 0.45,
            },
            PhaseId::Viability => Self {
                min_total_evidence: 15,
                min_experiments: 8,
                min_evidence_quality: 0.8,
                required_kinds: vec![EvidenceKind::Analytics, EvidenceKind::Experiment],
                weights: ScoreWeights::default(),
                pass_threshold: 0.85,
                fail_threshold: 0.5,
            },
        }
    }
}
