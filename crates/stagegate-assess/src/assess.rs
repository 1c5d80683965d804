//! The deterministic assessment pass.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::stages::StageConfig;

const CLARITY_HIGH: f64 = 0.92;
const CLARITY_MEDIUM: f64 = 0.68;
const CLARITY_LOW: f64 = 0.38;

const COMPLETENESS_COMPLETE: f64 = 1.0;
const COMPLETENESS_PARTIAL: f64 = 0.66;
const COMPLETENESS_INSUFFICIENT: f64 = 0.35;

/// Where a session stands in the interview. Owned by the caller and passed
/// back on each assessment; the assessor never holds session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    pub session_id: Uuid,
    pub stage_index: usize,
    /// Topic ids covered so far within the current stage.
    pub covered: BTreeSet<String>,
    /// All stages fully covered.
    pub completed: bool,
}

impl SessionProgress {
    #[must_use]
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            stage_index: 0,
            covered: BTreeSet::new(),
            completed: false,
        }
    }
}

/// Transcript quality signals, each 0.0–1.0. Advisory only: they inform
/// downstream scoring and never gate stage progression.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualitySignals {
    pub clarity: f64,
    pub completeness: f64,
    pub detail: f64,
}

/// Result of assessing one transcript delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageAssessment {
    pub session_id: Uuid,
    pub config_version: u32,
    /// Index of the stage that was assessed (before any advance).
    pub stage_index: usize,
    pub stage_name: String,
    pub topics_covered: Vec<String>,
    pub newly_covered: Vec<String>,
    /// Topic coverage within the stage, 0–100.
    pub stage_progress: u8,
    pub signals: QualitySignals,
    /// The session moved to the next stage as a result of this delta.
    pub advanced: bool,
    pub completed: bool,
}

/// Assess a transcript delta against the session's current stage.
///
/// Deterministic: the same (config, progress, delta) triple always yields
/// the same output. Coverage only grows; a delta matching zero new topics
/// returns unchanged progress, so replayed deltas are harmless. A stage
/// advances exactly one step, only at full topic coverage; covering the
/// final stage marks the session completed instead.
#[must_use]
pub fn assess(
    config: &StageConfig,
    progress: &SessionProgress,
    transcript_delta: &str,
) -> (SessionProgress, StageAssessment) {
    let mut next = progress.clone();

    let Some(stage) = config.stage(progress.stage_index) else {
        // Past the last stage: nothing to assess.
        next.completed = true;
        let assessment = StageAssessment {
            session_id: progress.session_id,
            config_version: config.version,
            stage_index: progress.stage_index,
            stage_name: String::new(),
            topics_covered: Vec::new(),
            newly_covered: Vec::new(),
            stage_progress: 100,
            signals: quality_signals(transcript_delta, 1.0),
            advanced: false,
            completed: true,
        };
        return (next, assessment);
    };

    let lower = transcript_delta.to_lowercase();
    let mut newly_covered = Vec::new();
    for topic in &stage.topics {
        if !next.covered.contains(&topic.id) && topic.matches(&lower) {
            next.covered.insert(topic.id.clone());
            newly_covered.push(topic.id.clone());
        }
    }

    let required = stage.topics.len();
    let coverage = if required == 0 {
        1.0
    } else {
        next.covered.len() as f64 / required as f64
    };

    let mut advanced = false;
    let mut completed = progress.completed;
    if coverage >= 1.0 {
        if config.is_final_stage(progress.stage_index) {
            completed = true;
        } else {
            advanced = true;
        }
    }

    let assessment = StageAssessment {
        session_id: progress.session_id,
        config_version: config.version,
        stage_index: progress.stage_index,
        stage_name: stage.name.clone(),
        topics_covered: next.covered.iter().cloned().collect(),
        newly_covered,
        stage_progress: (coverage * 100.0).round() as u8,
        signals: quality_signals(transcript_delta, coverage),
        advanced,
        completed,
    };

    if advanced {
        next.stage_index += 1;
        next.covered.clear();
    }
    next.completed = completed;

    debug!(
        session_id = %progress.session_id,
        stage = %assessment.stage_name,
        progress = assessment.stage_progress,
        advanced,
        "assessment"
    );
    (next, assessment)
}

/// Heuristic quality signals from the raw delta. Clarity rewards specifics
/// (numbers, currency, percentages) and sustained answers; completeness
/// tracks topic coverage; detail is coverage expressed as a fraction.
fn quality_signals(delta: &str, coverage: f64) -> QualitySignals {
    let specificity = delta
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '%' || *c == '$')
        .count();
    let word_count = delta.split_whitespace().count();

    let clarity = if specificity >= 4 {
        CLARITY_HIGH
    } else if specificity >= 1 || word_count >= 40 {
        CLARITY_MEDIUM
    } else {
        CLARITY_LOW
    };

    let completeness = if coverage >= 1.0 {
        COMPLETENESS_COMPLETE
    } else if coverage >= 0.5 {
        COMPLETENESS_PARTIAL
    } else {
        COMPLETENESS_INSUFFICIENT
    };

    QualitySignals {
        clarity,
        completeness,
        detail: coverage.clamp(0.0, 1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StageConfig {
        StageConfig::default()
    }

    fn fresh() -> SessionProgress {
        SessionProgress::new(Uuid::new_v4())
    }

    #[test]
    fn test_partial_coverage_does_not_advance() {
        let config = config();
        let progress = fresh();
        // Stage 0 ("welcome") needs founder_intro only; start on stage 1.
        let (progress, a) = assess(&config, &progress, "My name is Dana, background in retail");
        assert!(a.advanced);
        assert_eq!(progress.stage_index, 1);

        let (progress, a) = assess(&config, &progress, "The product is a meal-planning app");
        assert!(!a.advanced);
        assert_eq!(a.stage_progress, 50);
        assert_eq!(progress.stage_index, 1);
        assert_eq!(a.newly_covered, vec!["idea_summary".to_string()]);
    }

    #[test]
    fn test_full_coverage_advances_exactly_one_stage() {
        let config = config();
        let progress = fresh();
        // Text covering topics from several stages at once still advances
        // only the active stage.
        let delta = "My name is Dana. The product solves a real problem for customers \
                     in a huge market with clear pricing.";
        let (progress, a) = assess(&config, &progress, delta);
        assert!(a.advanced);
        assert_eq!(a.stage_index, 0);
        assert_eq!(progress.stage_index, 1);
        assert!(progress.covered.is_empty());
    }

    #[test]
    fn test_zero_new_topics_is_idempotent() {
        let config = config();
        let progress = fresh();
        let (progress, _) = assess(&config, &progress, "uh let me think");
        let before = progress.clone();
        let (after, a) = assess(&config, &progress, "hmm okay");
        assert_eq!(after, before);
        assert!(!a.advanced);
        assert_eq!(a.stage_progress, 0);
    }

    #[test]
    fn test_replayed_delta_does_not_double_count() {
        let config = config();
        let progress = fresh();
        let (p1, _) = assess(&config, &progress, "my name is Dana");
        // Replay after advance lands in stage 1 where it matches nothing new.
        let (p2, a) = assess(&config, &p1, "my name is Dana");
        assert!(a.newly_covered.is_empty());
        assert_eq!(p2.stage_index, p1.stage_index);
    }

    #[test]
    fn test_final_stage_completes_instead_of_advancing() {
        let config = config();
        let mut progress = fresh();
        progress.stage_index = 6;
        let (progress, a) = assess(&config, &progress, "our next goal is a pilot");
        assert!(!a.advanced);
        assert!(a.completed);
        assert!(progress.completed);
        assert_eq!(progress.stage_index, 6);
    }

    #[test]
    fn test_clarity_rewards_specific_numbers() {
        let vague = quality_signals("it went well", 0.0);
        let specific = quality_signals("we charge $49, churn is 3%, 120 users", 0.0);
        assert!((vague.clarity - CLARITY_LOW).abs() < f64::EPSILON);
        assert!((specific.clarity - CLARITY_HIGH).abs() < f64::EPSILON);
    }

    #[test]
    fn test_completeness_tracks_coverage_bands() {
        assert!((quality_signals("x", 1.0).completeness - COMPLETENESS_COMPLETE).abs() < f64::EPSILON);
        assert!((quality_signals("x", 0.5).completeness - COMPLETENESS_PARTIAL).abs() < f64::EPSILON);
        assert!(
            (quality_signals("x", 0.2).completeness - COMPLETENESS_INSUFFICIENT).abs()
                < f64::EPSILON
        );
    }

    #[test]
    fn test_determinism() {
        let config = config();
        let progress = fresh();
        let delta = "customers struggle with the problem of pricing";
        let (p1, a1) = assess(&config, &progress, delta);
        let (p2, a2) = assess(&config, &progress, delta);
        assert_eq!(p1, p2);
        assert_eq!(a1, a2);
    }
}
