/// Generation boundary: the one capability the engine consumes, plus the
/// retry wrapper every call goes through.
use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

static CODE_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)```").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// Rate limits, network hiccups, unparseable output. Worth retrying.
    #[error("transient generation failure: {0}")]
    Transient(String),
    /// Auth or malformed request. Never retried.
    #[error("fatal generation failure: {0}")]
    Fatal(String),
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
}

impl GenerationError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// What a request is for. Lets stubs and logs tell calls apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationTask {
    ConflictExtraction,
    InterferenceAnalysis,
    Translation,
    FlatTranslation,
    ActExtraction,
    ZapJudgement,
    ReverseAnalysis,
}

impl GenerationTask {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConflictExtraction => "conflict_extraction",
            Self::InterferenceAnalysis => "interference_analysis",
            Self::Translation => "translation",
            Self::FlatTranslation => "flat_translation",
            Self::ActExtraction => "act_extraction",
            Self::ZapJudgement => "zap_judgement",
            Self::ReverseAnalysis => "reverse_analysis",
        }
    }
}

impl fmt::Display for GenerationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFormat {
    Text,
    /// JSON matching the given schema sketch.
    Structured { schema: serde_json::Value },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub task: GenerationTask,
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub format: ResponseFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    pub text: String,
}

impl GenerationOutput {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// "Generate text given a prompt and a sampling temperature."
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GenerationError>;
}

/// Adapts a synchronous closure into a `Generator`. Used for stubs and dry runs.
pub struct FnGenerator<F> {
    f: F,
}

impl<F> FnGenerator<F>
where
    F: Fn(&GenerationRequest) -> Result<GenerationOutput, GenerationError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Generator for FnGenerator<F>
where
    F: Fn(&GenerationRequest) -> Result<GenerationOutput, GenerationError> + Send + Sync,
{
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GenerationError> {
        (self.f)(request)
    }
}

/// Bounded exponential backoff with jitter, plus a per-attempt timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter_ms: 200,
            timeout_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryError {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: GenerationError },
    #[error(transparent)]
    Fatal(GenerationError),
}

/// Wraps a shared generator with timeout and retry.
#[derive(Clone)]
pub struct ResilientGenerator {
    inner: Arc<dyn Generator>,
    policy: RetryPolicy,
}

impl ResilientGenerator {
    pub fn new(inner: Arc<dyn Generator>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Call the generator and parse its output. A parse failure counts as a
    /// transient error and is retried like any other.
    pub async fn generate_with<T>(
        &self,
        request: &GenerationRequest,
        parse: impl Fn(&str) -> Result<T, GenerationError>,
    ) -> Result<T, RetryError> {
        let attempts = self.policy.max_attempts.max(1);
        let timeout = Duration::from_millis(self.policy.timeout_ms);
        let mut last = GenerationError::Transient("no attempt made".to_string());

        for attempt in 1..=attempts {
            if attempt > 1 {
                let jitter = match self.policy.jitter_ms {
                    0 => 0,
                    j => rand::thread_rng().gen_range(0..=j),
                };
                let delay = (self.policy.backoff(attempt - 1) + Duration::from_millis(jitter))
                    .min(Duration::from_millis(self.policy.max_delay_ms));
                tracing::warn!(
                    task = %request.task,
                    attempt,
                    ?delay,
                    error = %last,
                    "retrying generation"
                );
                tokio::time::sleep(delay).await;
            }

            let result = match tokio::time::timeout(timeout, self.inner.generate(request)).await {
                Ok(result) => result,
                Err(_) => Err(GenerationError::Timeout(timeout)),
            };
            match result.and_then(|output| parse(&output.text)) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_fatal() => {
                    tracing::warn!(task = %request.task, error = %err, "fatal generation error");
                    return Err(RetryError::Fatal(err));
                }
                Err(err) => last = err,
            }
        }

        Err(RetryError::Exhausted { attempts, last })
    }
}

/// Parse structured output leniently: bare JSON, a fenced block, or the
/// outermost `{...}` span. Missing fields fall back to defaults.
pub fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T, GenerationError> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }
    for cap in CODE_BLOCK.captures_iter(trimmed) {
        if let Some(m) = cap.get(1) {
            if let Ok(value) = serde_json::from_str(m.as_str().trim()) {
                return Ok(value);
            }
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                return Ok(value);
            }
        }
    }
    Err(GenerationError::Transient(format!(
        "unparseable structured output: {}",
        trimmed.chars().take(80).collect::<String>()
    )))
}
