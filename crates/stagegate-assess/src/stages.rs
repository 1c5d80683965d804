//! Immutable, versioned interview stage configuration.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// One topic the interview must cover, matched against transcript text by
/// case-insensitive keyword containment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    /// Stable identifier, e.g. `"target_customer"`.
    pub id: String,
    /// Any one keyword appearing in the delta marks the topic covered.
    pub keywords: Vec<String>,
}

impl Topic {
    #[must_use]
    pub fn matches(&self, text_lower: &str) -> bool {
        self.keywords
            .iter()
            .any(|k| text_lower.contains(k.as_str()))
    }
}

/// One stage of the onboarding interview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterviewStage {
    pub name: String,
    /// All topics must be covered before the stage advances.
    pub topics: Vec<Topic>,
}

/// The full stage table, immutable once constructed and carried by value
/// into every assessment call. The version ties an assessment to the exact
/// configuration that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub version: u32,
    pub stages: Vec<InterviewStage>,
}

impl StageConfig {
    #[must_use]
    pub fn stage(&self, index: usize) -> Option<&InterviewStage> {
        self.stages.get(index)
    }

    #[must_use]
    pub fn is_final_stage(&self, index: usize) -> bool {
        index + 1 >= self.stages.len()
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        DEFAULT_STAGES.clone()
    }
}

fn topic(id: &str, keywords: &[&str]) -> Topic {
    Topic {
        id: id.to_string(),
        keywords: keywords.iter().map(|k| (*k).to_string()).collect(),
    }
}

fn stage(name: &str, topics: Vec<Topic>) -> InterviewStage {
    InterviewStage {
        name: name.to_string(),
        topics,
    }
}

/// The built-in seven-stage interview.
static DEFAULT_STAGES: Lazy<StageConfig> = Lazy::new(|| StageConfig {
    version: 1,
    stages: vec![
        stage(
            "welcome",
            vec![topic("founder_intro", &["name", "background", "founder"])],
        ),
        stage(
            "business_idea",
            vec![
                topic("idea_summary", &["idea", "product", "service"]),
                topic("motivation", &["why", "motivat", "inspir"]),
            ],
        ),
        stage(
            "target_customer",
            vec![
                topic("customer_segment", &["customer", "segment", "audience"]),
                topic("customer_context", &["job", "daily", "context", "workflow"]),
            ],
        ),
        stage(
            "problem",
            vec![
                topic("pain_point", &["problem", "pain", "struggle", "frustrat"]),
                topic("current_alternatives", &["currently", "alternative", "workaround", "today"]),
            ],
        ),
        stage(
            "solution",
            vec![
                topic("value_proposition", &["solve", "value", "benefit"]),
                topic("differentiation", &["different", "unique", "better than", "competitor"]),
            ],
        ),
        stage(
            "market",
            vec![
                topic("market_size", &["market", "size", "tam"]),
                topic("pricing_intent", &["price", "pricing", "charge", "pay"]),
            ],
        ),
        stage(
            "wrap_up",
            vec![topic("next_steps", &["next", "goal", "timeline", "plan"])],
        ),
    ],
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_seven_stages() {
        let config = StageConfig::default();
        assert_eq!(config.stages.len(), 7);
        assert_eq!(config.version, 1);
        assert!(config.is_final_stage(6));
        assert!(!config.is_final_stage(0));
    }

    #[test]
    fn test_topic_matching_is_containment_based() {
        let t = topic("pain_point", &["problem", "frustrat"]);
        assert!(t.matches("the biggest problem my customers face"));
        assert!(t.matches("they get frustrated every week"));
        assert!(!t.matches("everything is wonderful"));
    }

    #[test]
    fn test_every_stage_has_at_least_one_topic() {
        for stage in &StageConfig::default().stages {
            assert!(!stage.topics.is_empty(), "stage {} has no topics", stage.name);
        }
    }
}
