//! Two-Pass Assessment Engine.
//!
//! Pass 1 (the conversational generator) lives outside this system. This
//! crate is pass 2: a deterministic assessor that owns all stage
//! progression. Given an immutable stage configuration, the session's
//! current progress, and the transcript delta since the last assessment, it
//! computes topic coverage, quality signals, and whether the interview
//! advances to the next stage.

pub mod assess;
pub mod stages;

pub use assess::{assess, QualitySignals, SessionProgress, StageAssessment};
pub use stages::{InterviewStage, StageConfig, Topic};
