/// Engine configuration, loaded from RON.
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::core::generation::RetryPolicy;
use crate::core::matcher::MatcherStrategy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Sampling temperature per pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTemperatures {
    pub conflict: f32,
    pub interference: f32,
    pub generation: f32,
}

impl Default for StageTemperatures {
    fn default() -> Self {
        Self {
            conflict: 0.2,
            interference: 0.2,
            generation: 0.4,
        }
    }
}

/// What carries into a speaker's next turn when the extracted mode disagrees
/// with the tracked one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModePropagation {
    /// A declared, non-`none` observed mode replaces the tracked mode.
    #[default]
    ObservedOverrides,
    /// The tracker's prediction always carries.
    PredictedOnly,
}

/// How the IAP evaluator extracts speech acts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActExtraction {
    /// Ask the generator, memoized per (lang, context, text).
    #[default]
    Generator,
    /// Deterministic cue lexicon; no generation calls.
    Lexical,
}

/// Who scores z-axis preservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZapEvaluation {
    /// Marker recall and persona devices, read off the surface. No generation calls.
    #[default]
    Lexical,
    /// A persona-aware judgement from the generator. The lexical score still
    /// runs and stands in when the judge fails.
    Generator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub temperatures: StageTemperatures,
    pub evaluator_temperature: f32,
    pub retry: RetryPolicy,
    /// Number of previous turns rendered into each prompt.
    pub context_window: usize,
    pub matcher: MatcherStrategy,
    pub mode_propagation: ModePropagation,
    pub act_extraction: ActExtraction,
    pub zap_evaluation: ZapEvaluation,
    /// Run IAP and ZAP on every turn.
    pub evaluate: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            temperatures: StageTemperatures::default(),
            evaluator_temperature: 0.0,
            retry: RetryPolicy::default(),
            context_window: 5,
            matcher: MatcherStrategy::default(),
            mode_propagation: ModePropagation::default(),
            act_extraction: ActExtraction::default(),
            zap_evaluation: ZapEvaluation::default(),
            evaluate: true,
        }
    }
}

impl EngineConfig {
    pub fn parse_ron(input: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = ron::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_ron(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let temps = [
            ("temperatures.conflict", self.temperatures.conflict),
            ("temperatures.interference", self.temperatures.interference),
            ("temperatures.generation", self.temperatures.generation),
            ("evaluator_temperature", self.evaluator_temperature),
        ];
        for (name, t) in temps {
            if !(0.0..=2.0).contains(&t) {
                return Err(ConfigError::Invalid(format!("{name} {t} outside [0, 2]")));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.timeout_ms == 0 {
            return Err(ConfigError::Invalid("retry.timeout_ms must be positive".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.base_delay_ms exceeds retry.max_delay_ms".into(),
            ));
        }
        if let MatcherStrategy::KeywordOverlap { threshold } = self.matcher {
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "keyword_overlap threshold {threshold} outside (0, 1]"
                )));
            }
        }
        Ok(())
    }
}
