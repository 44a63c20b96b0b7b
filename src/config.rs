//! Pipeline configuration
//!
//! Thresholds are product policy, so every one of them lives here and is
//! passed into the components at construction.

use crate::error::PipelineError;
use crate::models::Dimension;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub controller: ControllerConfig,
    pub verifier: VerifierConfig,
    pub scoring: ScoringConfig,
    pub prompt: PromptConfig,
    pub fetcher: FetcherConfig,
    pub provider: ProviderConfig,
}

//
// ================= Retry Controller =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Minimum quality score (0-100) for acceptance.
    pub min_score: f64,
    /// Upper bound on generation attempts, including the first.
    pub max_retries: u32,
    /// Single generation pass, no extraction/verification/scoring.
    pub skip_verification: bool,
    /// Append improvement feedback from the previous attempt on retries.
    pub retry_feedback: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            min_score: 80.0,
            max_retries: 3,
            skip_verification: false,
            retry_feedback: true,
        }
    }
}

//
// ================= Claim Verifier =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Relative band for price claims, in percent of the reference price.
    pub price_tolerance_pct: f64,
    /// Absolute band for percentage-change claims, in percentage points.
    pub percent_tolerance_points: f64,
    /// Reference changes within this band count as flat.
    pub flat_band_points: f64,
    /// Minimum normalized similarity for fuzzy subject resolution.
    pub fuzzy_threshold: f64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            price_tolerance_pct: 2.0,
            percent_tolerance_points: 0.5,
            flat_band_points: 0.05,
            fuzzy_threshold: 0.8,
        }
    }
}

//
// ================= Quality Scorer =================
//

/// A report section the prompt contract requires, detected by heading markers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SectionRule {
    pub name: String,
    pub markers: Vec<String>,
}

impl SectionRule {
    pub fn new(name: &str, markers: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            markers: markers.iter().map(|m| m.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: BTreeMap<Dimension, f64>,
    /// Hard floors: any dimension below its floor fails the gate.
    pub floors: BTreeMap<Dimension, f64>,
    pub required_sections: Vec<SectionRule>,
    /// Regex matching a citation of a source article.
    pub citation_pattern: String,
    /// Accuracy credited when no claim could be matched.
    pub no_claim_accuracy: f64,
    /// Score points removed from the cap when every claim is unmatched.
    pub coverage_penalty: f64,
    pub stale_after_hours: i64,
    pub stale_score_cap: f64,
    /// Compliance deduction per fabricated target price or gain.
    pub fabrication_penalty: f64,
    /// Compliance deduction for placeholder text.
    pub placeholder_penalty: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let weights = BTreeMap::from([
            (Dimension::Accuracy, 0.5),
            (Dimension::Timeliness, 0.15),
            (Dimension::Structure, 0.2),
            (Dimension::Attribution, 0.15),
            (Dimension::Compliance, 0.0),
        ]);
        let floors = BTreeMap::from([
            (Dimension::Accuracy, 50.0),
            (Dimension::Timeliness, 0.0),
            (Dimension::Structure, 50.0),
            (Dimension::Attribution, 0.0),
            (Dimension::Compliance, 70.0),
        ]);

        Self {
            weights,
            floors,
            required_sections: vec![
                SectionRule::new("market overview", &["市场概况", "Market Overview"]),
                SectionRule::new("investment themes", &["投资主题", "Investment Themes"]),
                SectionRule::new("risks", &["风险", "Risk"]),
                SectionRule::new("recommendations", &["建议", "Recommendation"]),
            ],
            citation_pattern: r"【新闻\s*\d+】|\[(?:新闻|Article|Source)\s*\d+\]".to_string(),
            no_claim_accuracy: 50.0,
            coverage_penalty: 40.0,
            stale_after_hours: 24,
            stale_score_cap: 70.0,
            fabrication_penalty: 40.0,
            placeholder_penalty: 10.0,
        }
    }
}

impl ScoringConfig {
    pub fn weight(&self, dimension: Dimension) -> f64 {
        self.weights.get(&dimension).copied().unwrap_or(0.0)
    }

    pub fn floor(&self, dimension: Dimension) -> f64 {
        self.floors.get(&dimension).copied().unwrap_or(0.0)
    }
}

//
// ================= Prompt Assembly =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub max_articles: usize,
    pub max_chars_per_article: usize,
    pub max_total_chars: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            max_articles: 40,
            max_chars_per_article: 800,
            max_total_chars: 60_000,
        }
    }
}

//
// ================= Reference Fetcher =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    pub timeout_secs: u64,
    pub batch_size: usize,
    pub max_subjects: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5,
            batch_size: 20,
            max_subjects: 40,
        }
    }
}

impl FetcherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

//
// ================= Model Provider =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub call_timeout_secs: u64,
    pub gemini_models: Vec<String>,
    pub deepseek_model: String,
    pub deepseek_base_url: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 120,
            gemini_models: vec![
                "gemini-2.5-flash".to_string(),
                "gemini-2.5-pro".to_string(),
                "gemini-2.0-flash".to_string(),
            ],
            deepseek_model: "deepseek-chat".to_string(),
            deepseek_base_url: crate::provider::openai::DEEPSEEK_BASE_URL.to_string(),
        }
    }
}

impl ProviderConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

//
// ================= Loading & Validation =================
//

impl PipelineConfig {
    /// Defaults overlaid with environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<f64>("MIN_SCORE")? {
            config.controller.min_score = v;
        }
        if let Some(v) = env_parse::<u32>("MAX_RETRIES")? {
            config.controller.max_retries = v;
        }
        if let Some(v) = env_parse::<bool>("SKIP_VERIFICATION")? {
            config.controller.skip_verification = v;
        }
        if let Some(v) = env_parse::<f64>("PRICE_TOLERANCE_PCT")? {
            config.verifier.price_tolerance_pct = v;
        }
        if let Some(v) = env_parse::<u64>("REFERENCE_TIMEOUT_SECS")? {
            config.fetcher.timeout_secs = v;
        }
        if let Some(v) = env_parse::<u64>("MODEL_TIMEOUT_SECS")? {
            config.provider.call_timeout_secs = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PipelineError::InvalidConfig(msg));

        if self.controller.max_retries == 0 {
            return invalid("max_retries must be at least 1".to_string());
        }
        if !(0.0..=100.0).contains(&self.controller.min_score) {
            return invalid(format!(
                "min_score must be within 0..=100, got {}",
                self.controller.min_score
            ));
        }
        if self.verifier.price_tolerance_pct < 0.0
            || self.verifier.percent_tolerance_points < 0.0
            || self.verifier.flat_band_points < 0.0
        {
            return invalid("tolerances must be non-negative".to_string());
        }
        if !(0.0..=1.0).contains(&self.verifier.fuzzy_threshold) {
            return invalid("fuzzy_threshold must be within 0..=1".to_string());
        }
        if self.scoring.weights.values().any(|w| *w < 0.0) {
            return invalid("dimension weights must be non-negative".to_string());
        }
        if self.scoring.weights.values().sum::<f64>() <= 0.0 {
            return invalid("at least one dimension weight must be positive".to_string());
        }
        if self.prompt.max_articles == 0 {
            return invalid("max_articles must be at least 1".to_string());
        }
        if self.fetcher.batch_size == 0 {
            return invalid("batch_size must be at least 1".to_string());
        }
        regex::Regex::new(&self.scoring.citation_pattern)?;

        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| PipelineError::InvalidConfig(format!("{} has invalid value '{}'", name, raw))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.controller.min_score, 80.0);
        assert_eq!(config.controller.max_retries, 3);
        assert!(!config.controller.skip_verification);
    }

    #[test]
    fn test_zero_retries_rejected() {
        let mut config = PipelineConfig::default();
        config.controller.max_retries = 0;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_bad_citation_pattern_rejected() {
        let mut config = PipelineConfig::default();
        config.scoring.citation_pattern = "([".to_string();
        assert!(matches!(config.validate(), Err(PipelineError::Pattern(_))));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"controller": {"min_score": 90}}"#).unwrap();
        assert_eq!(config.controller.min_score, 90.0);
        assert_eq!(config.controller.max_retries, 3);
        assert_eq!(config.verifier.price_tolerance_pct, 2.0);
    }
}
