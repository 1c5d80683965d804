//! Pure gate evaluation.

use serde::{Deserialize, Serialize};
use stagegate_types::{EvidenceItem, EvidenceKind};

use crate::criteria::GateCriteria;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateVerdict {
    Passed,
    Failed,
    Pending,
}

impl GateVerdict {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Pending => "pending",
        }
    }
}

/// Outcome of one gate evaluation. Derived state: recomputed on every read
/// and never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateResult {
    pub verdict: GateVerdict,
    /// Weighted readiness, 0.0–1.0.
    pub readiness: f64,
    /// Blocking and failure reasons, in deterministic order.
    pub reasons: Vec<String>,
    pub evidence_count: usize,
    pub experiment_count: usize,
}

/// Evaluate a phase gate against its active evidence.
///
/// Pure and side-effect-free: identical inputs produce identical output.
/// Readiness is the weighted combination of the evidence-count ratio, mean
/// quality, and experiment-count ratio, each capped at 1.0.
///
/// Reasons split into two classes. Blocking reasons (quality below minimum,
/// too few experiments, a missing required kind) force `Failed`. A shortfall
/// in total evidence is an accumulation gap, not a defect: the gate stays
/// `Pending` while items arrive, as does an empty evidence set. Absent any
/// reason, the verdict is `Passed` at or above the pass threshold, `Failed`
/// below the fail threshold, and `Pending` in between.
#[must_use]
pub fn evaluate(criteria: &GateCriteria, evidence: &[&EvidenceItem]) -> GateResult {
    let evidence_count = evidence.len();
    let experiment_count = evidence
        .iter()
        .filter(|e| e.kind == EvidenceKind::Experiment)
        .count();

    let mean_quality = if evidence_count == 0 {
        0.0
    } else {
        evidence.iter().map(|e| e.quality_score).sum::<f64>() / evidence_count as f64
    };

    let count_ratio = ratio(evidence_count, criteria.min_total_evidence);
    let experiment_ratio = ratio(experiment_count, criteria.min_experiments);

    let w = &criteria.weights;
    let weight_sum = w.count + w.quality + w.experiments;
    let readiness = if weight_sum <= 0.0 {
        0.0
    } else {
        (w.count * count_ratio + w.quality * mean_quality + w.experiments * experiment_ratio)
            / weight_sum
    };

    // Reason order is part of the contract: totals, experiments, quality,
    // then missing kinds in criteria order.
    let mut reasons = Vec::new();
    let mut blocking = false;
    if evidence_count < criteria.min_total_evidence {
        reasons.push(format!(
            "insufficient total evidence: {evidence_count} of {} required",
            criteria.min_total_evidence
        ));
    }
    // An empty set has nothing to judge yet; quality and kind checks only
    // apply once evidence exists.
    if evidence_count > 0 {
        if experiment_count < criteria.min_experiments {
            reasons.push(format!(
                "insufficient experiments: {experiment_count} of {} required",
                criteria.min_experiments
            ));
            blocking = true;
        }
        if mean_quality < criteria.min_evidence_quality {
            reasons.push(format!(
                "mean evidence quality {mean_quality:.2} below minimum {:.2}",
                criteria.min_evidence_quality
            ));
            blocking = true;
        }
        for kind in &criteria.required_kinds {
            if !evidence.iter().any(|e| e.kind == *kind) {
                reasons.push(format!("missing required evidence kind: {kind}"));
                blocking = true;
            }
        }
    }

    let verdict = if blocking || (evidence_count > 0 && readiness < criteria.fail_threshold) {
        GateVerdict::Failed
    } else if reasons.is_empty() && readiness >= criteria.pass_threshold {
        GateVerdict::Passed
    } else {
        GateVerdict::Pending
    };

    GateResult {
        verdict,
        readiness,
        reasons,
        evidence_count,
        experiment_count,
    }
}

fn ratio(have: usize, need: usize) -> f64 {
    if need == 0 {
        1.0
    } else {
        (have as f64 / need as f64).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::ScoreWeights;
    use chrono::Utc;
    use stagegate_types::{EvidenceStrength, PhaseId};
    use uuid::Uuid;

    fn item(kind: EvidenceKind, quality: f64) -> EvidenceItem {
        EvidenceItem {
            id: Uuid::new_v4(),
            run_id: Uuid::nil(),
            phase: PhaseId::Desirability,
            kind,
            strength: EvidenceStrength::Medium,
            quality_score: quality,
            source: "test".to_string(),
            created_at: Utc::now(),
            supersedes: None,
            superseded_by_revision: false,
        }
    }

    fn desirability_full_set() -> Vec<EvidenceItem> {
        let mut items = Vec::new();
        for _ in 0..5 {
            items.push(item(EvidenceKind::Experiment, 0.85));
        }
        for _ in 0..3 {
            items.push(item(EvidenceKind::Interview, 0.8));
        }
        items.push(item(EvidenceKind::Analytics, 0.9));
        items.push(item(EvidenceKind::Desk, 0.75));
        items
    }

    #[test]
    fn test_passes_at_exact_threshold_with_full_evidence() {
        let criteria = GateCriteria::defaults_for(PhaseId::Desirability);
        let items = desirability_full_set();
        let refs: Vec<&EvidenceItem> = items.iter().collect();
        let result = evaluate(&criteria, &refs);
        assert!(result.reasons.is_empty(), "reasons: {:?}", result.reasons);
        assert!(result.readiness >= criteria.pass_threshold);
        assert_eq!(result.verdict, GateVerdict::Passed);
        assert_eq!(result.evidence_count, 10);
        assert_eq!(result.experiment_count, 5);
    }

    #[test]
    fn test_empty_evidence_is_pending_not_failed() {
        let criteria = GateCriteria::defaults_for(PhaseId::Desirability);
        let result = evaluate(&criteria, &[]);
        assert_eq!(result.verdict, GateVerdict::Pending);
        assert_eq!(result.readiness, 0.0);
        assert_eq!(result.reasons.len(), 1);
        assert!(result.reasons[0].starts_with("insufficient total evidence"));
    }

    #[test]
    fn test_count_shortfall_alone_stays_pending_until_met() {
        let criteria = GateCriteria {
            min_total_evidence: 3,
            min_experiments: 0,
            min_evidence_quality: 0.7,
            required_kinds: vec![],
            weights: ScoreWeights::default(),
            pass_threshold: 0.8,
            fail_threshold: 0.4,
        };
        let items = vec![
            item(EvidenceKind::Interview, 0.9),
            item(EvidenceKind::Interview, 0.9),
        ];

        // Two of three items: nothing is wrong with the evidence itself,
        // the set is just not complete yet.
        let refs: Vec<&EvidenceItem> = items.iter().collect();
        let short = evaluate(&criteria, &refs);
        assert_eq!(short.verdict, GateVerdict::Pending);
        assert_eq!(short.reasons.len(), 1);
        assert!(short.reasons[0].starts_with("insufficient total evidence"));
        assert!(short.readiness >= criteria.fail_threshold);

        // The third item flips the gate to Passed.
        let items = vec![
            item(EvidenceKind::Interview, 0.9),
            item(EvidenceKind::Interview, 0.9),
            item(EvidenceKind::Interview, 0.9),
        ];
        let refs: Vec<&EvidenceItem> = items.iter().collect();
        let full = evaluate(&criteria, &refs);
        assert_eq!(full.verdict, GateVerdict::Passed);
        assert!(full.reasons.is_empty());
    }

    #[test]
    fn test_blocking_reasons_fail_in_deterministic_order() {
        let criteria = GateCriteria::defaults_for(PhaseId::Desirability);
        let items = vec![item(EvidenceKind::Desk, 0.2)];
        let refs: Vec<&EvidenceItem> = items.iter().collect();
        let result = evaluate(&criteria, &refs);
        assert_eq!(result.verdict, GateVerdict::Failed);
        assert!(result.reasons[0].starts_with("insufficient total evidence"));
        assert!(result.reasons[1].starts_with("insufficient experiments"));
        assert!(result.reasons[2].starts_with("mean evidence quality"));
        assert!(result.reasons[3].contains("interview"));
        assert!(result.reasons[4].contains("analytics"));
        assert!(result.reasons[5].contains("experiment"));
    }

    #[test]
    fn test_missing_required_kind_blocks_despite_high_readiness() {
        let criteria = GateCriteria::defaults_for(PhaseId::Desirability);
        let mut items = Vec::new();
        for _ in 0..6 {
            items.push(item(EvidenceKind::Experiment, 0.95));
        }
        for _ in 0..5 {
            items.push(item(EvidenceKind::Interview, 0.95));
        }
        // No analytics.
        let refs: Vec<&EvidenceItem> = items.iter().collect();
        let result = evaluate(&criteria, &refs);
        assert!(result.readiness >= criteria.pass_threshold);
        assert_eq!(result.verdict, GateVerdict::Failed);
        assert_eq!(result.reasons.len(), 1);
        assert!(result.reasons[0].contains("analytics"));
    }

    #[test]
    fn test_low_quality_blocks() {
        let criteria = GateCriteria::defaults_for(PhaseId::Desirability);
        let mut items = desirability_full_set();
        for e in &mut items {
            e.quality_score = 0.5;
        }
        let refs: Vec<&EvidenceItem> = items.iter().collect();
        let result = evaluate(&criteria, &refs);
        assert_eq!(result.verdict, GateVerdict::Failed);
        assert!(result
            .reasons
            .iter()
            .any(|r| r.starts_with("mean evidence quality")));
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let criteria = GateCriteria::defaults_for(PhaseId::Discovery);
        let items = desirability_full_set();
        let refs: Vec<&EvidenceItem> = items.iter().collect();
        let a = evaluate(&criteria, &refs);
        let b = evaluate(&criteria, &refs);
        assert_eq!(a, b);
    }

    #[test]
    fn test_readiness_increases_with_evidence() {
        let criteria = GateCriteria::defaults_for(PhaseId::Desirability);
        let items = desirability_full_set();
        let few: Vec<&EvidenceItem> = items.iter().take(3).collect();
        let all: Vec<&EvidenceItem> = items.iter().collect();
        assert!(evaluate(&criteria, &few).readiness < evaluate(&criteria, &all).readiness);
    }
}
