//! Configuration for the stagegate daemon.
//!
//! Precedence is CLI flags > TOML file > built-in defaults. The file is
//! optional; every section and field has a compiled-in default, and partial
//! gate overrides merge field-by-field over the default criteria ladder.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use stagegate_assess::{InterviewStage, StageConfig, Topic};
use stagegate_gate::GateCriteria;
use stagegate_types::PhaseId;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Name of the environment variable holding the webhook bearer token.
    #[serde(default = "default_token_env")]
    pub bearer_token_env: String,
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_token_env() -> String {
    "STAGEGATE_WEBHOOK_TOKEN".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            bearer_token_env: default_token_env(),
        }
    }
}

/// `[worker]` section: where resume calls go and how hard they retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_url")]
    pub base_url: String,
    #[serde(default = "default_max_attempts")]
    pub max_resume_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub initial_backoff_ms: u64,
}

fn default_worker_url() -> String {
    "http://127.0.0.1:8900".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    250
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            base_url: default_worker_url(),
            max_resume_attempts: default_max_attempts(),
            initial_backoff_ms: default_backoff_ms(),
        }
    }
}

/// `[alerts]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: i64,
}

fn default_cooldown_hours() -> i64 {
    24
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_hours: default_cooldown_hours(),
        }
    }
}

/// Partial gate-criteria override from a `[gates.<phase>]` table. Unset
/// fields keep the default ladder's values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateOverride {
    pub min_total_evidence: Option<usize>,
    pub min_experiments: Option<usize>,
    pub min_evidence_quality: Option<f64>,
    pub required_kinds: Option<Vec<stagegate_types::EvidenceKind>>,
    pub pass_threshold: Option<f64>,
    pub fail_threshold: Option<f64>,
}

impl GateOverride {
    fn apply(&self, mut base: GateCriteria) -> GateCriteria {
        if let Some(v) = self.min_total_evidence {
            base.min_total_evidence = v;
        }
        if let Some(v) = self.min_experiments {
            base.min_experiments = v;
        }
        if let Some(v) = self.min_evidence_quality {
            base.min_evidence_quality = v;
        }
        if let Some(kinds) = &self.required_kinds {
            base.required_kinds = kinds.clone();
        }
        if let Some(v) = self.pass_threshold {
            base.pass_threshold = v;
        }
        if let Some(v) = self.fail_threshold {
            base.fail_threshold = v;
        }
        base
    }
}

/// `[[stages]]` entry: replaces the built-in interview when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEntry {
    pub name: String,
    #[serde(default)]
    pub topics: Vec<TopicEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicEntry {
    pub id: String,
    pub keywords: Vec<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    /// Keyed by phase name (`brief`, `discovery`, ...).
    #[serde(default)]
    pub gates: HashMap<String, GateOverride>,
    #[serde(default)]
    pub stages: Vec<StageEntry>,
}

impl Config {
    /// Load from a TOML file and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Reject configurations that would misbehave at runtime rather than
    /// letting them fail mid-request.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for phase in PhaseId::ALL {
            let criteria = self.gate_criteria(phase);
            if criteria.fail_threshold >= criteria.pass_threshold {
                return Err(ConfigError::Invalid(format!(
                    "gate {phase}: fail threshold {} must be below pass threshold {}",
                    criteria.fail_threshold, criteria.pass_threshold
                )));
            }
            if !(0.0..=1.0).contains(&criteria.min_evidence_quality) {
                return Err(ConfigError::Invalid(format!(
                    "gate {phase}: min evidence quality {} outside [0.0, 1.0]",
                    criteria.min_evidence_quality
                )));
            }
            let w = &criteria.weights;
            if w.count + w.quality + w.experiments <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "gate {phase}: score weights must sum to a positive value"
                )));
            }
        }
        for name in self.gates.keys() {
            if !PhaseId::ALL.iter().any(|p| p.as_str() == name) {
                return Err(ConfigError::Invalid(format!(
                    "unknown phase in [gates]: {name}"
                )));
            }
        }
        for stage in &self.stages {
            if stage.topics.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "stage {} has no topics",
                    stage.name
                )));
            }
            for t in &stage.topics {
                if t.keywords.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "topic {} in stage {} has no keywords",
                        t.id, stage.name
                    )));
                }
            }
        }
        if self.worker.max_resume_attempts == 0 {
            return Err(ConfigError::Invalid(
                "worker.max_resume_attempts must be at least 1".to_string(),
            ));
        }
        if self.alerts.cooldown_hours < 0 {
            return Err(ConfigError::Invalid(
                "alerts.cooldown_hours must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective criteria for a phase: defaults with any override applied.
    #[must_use]
    pub fn gate_criteria(&self, phase: PhaseId) -> GateCriteria {
        let base = GateCriteria::defaults_for(phase);
        match self.gates.get(phase.as_str()) {
            Some(ov) => ov.apply(base),
            None => base,
        }
    }

    /// Effective interview stages: `[[stages]]` if present, else built-in.
    /// A file-supplied table gets version 2 to distinguish its assessments.
    #[must_use]
    pub fn stage_config(&self) -> StageConfig {
        if self.stages.is_empty() {
            return StageConfig::default();
        }
        StageConfig {
            version: 2,
            stages: self
                .stages
                .iter()
                .map(|s| InterviewStage {
                    name: s.name.clone(),
                    topics: s
                        .topics
                        .iter()
                        .map(|t| Topic {
                            id: t.id.clone(),
                            keywords: t.keywords.iter().map(|k| k.to_lowercase()).collect(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}
