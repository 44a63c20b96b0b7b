//! Model provider
//!
//! Sends the assembled prompt to an ordered list of candidate models and
//! returns the first non-empty completion. A candidate failing, timing out
//! or returning nothing just moves on to the next one.

pub mod gemini;
pub mod mock;
pub mod openai;
pub mod prompt;

pub use gemini::GeminiBackend;
pub use mock::ScriptedBackend;
pub use openai::ChatCompletionsBackend;
pub use prompt::{PromptBuilder, DEFAULT_REPORT_TEMPLATE};

use crate::config::ProviderConfig;
use crate::error::PipelineError;
use crate::models::{Article, ReferenceSnapshot, UsageMetadata};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Raw completion from one backend call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// A model API: text in, text and token counts out, or an error.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, model: &str, system: &str, user: &str) -> Result<Completion>;
}

#[derive(Clone)]
pub struct ModelCandidate {
    pub backend: Arc<dyn ModelBackend>,
    pub model: String,
}

impl ModelCandidate {
    pub fn new(backend: Arc<dyn ModelBackend>, model: impl Into<String>) -> Self {
        Self {
            backend,
            model: model.into(),
        }
    }

    fn label(&self) -> String {
        format!("{}/{}", self.backend.name(), self.model)
    }
}

pub struct ModelProvider {
    candidates: Vec<ModelCandidate>,
    prompt_builder: PromptBuilder,
    call_timeout: Duration,
}

impl ModelProvider {
    pub fn new(
        candidates: Vec<ModelCandidate>,
        prompt_builder: PromptBuilder,
        call_timeout: Duration,
    ) -> Self {
        Self {
            candidates,
            prompt_builder,
            call_timeout,
        }
    }

    pub fn prompt_builder(&self) -> &PromptBuilder {
        &self.prompt_builder
    }

    pub async fn generate(
        &self,
        template: &str,
        snapshot: &ReferenceSnapshot,
        articles: &[Article],
        model_hint: Option<&str>,
    ) -> Result<(String, UsageMetadata)> {
        self.generate_with_feedback(template, snapshot, articles, model_hint, None)
            .await
    }

    /// Same as `generate`, with improvement notes appended to the user content.
    pub async fn generate_with_feedback(
        &self,
        template: &str,
        snapshot: &ReferenceSnapshot,
        articles: &[Article],
        model_hint: Option<&str>,
        feedback: Option<&str>,
    ) -> Result<(String, UsageMetadata)> {
        let candidates = self.candidates_for(model_hint);
        if candidates.is_empty() {
            return Err(PipelineError::AllProvidersFailed {
                failures: vec!["no model candidates configured".to_string()],
            });
        }

        let user = self.prompt_builder.render_user(snapshot, articles, feedback);
        let mut failures = Vec::new();

        for candidate in &candidates {
            let system = self.prompt_builder.render_system(template, &candidate.model);
            let started = Instant::now();

            info!(
                candidate = %candidate.label(),
                prompt_chars = user.chars().count(),
                "Calling model"
            );

            let call = candidate.backend.complete(&candidate.model, &system, &user);
            let failure = match tokio::time::timeout(self.call_timeout, call).await {
                Ok(Ok(completion)) if !completion.text.trim().is_empty() => {
                    let usage = UsageMetadata {
                        provider: candidate.backend.name().to_string(),
                        model: candidate.model.clone(),
                        prompt_tokens: completion.prompt_tokens,
                        completion_tokens: completion.completion_tokens,
                        total_tokens: completion.total_tokens,
                        latency_ms: started.elapsed().as_millis() as u64,
                    };
                    info!(
                        candidate = %candidate.label(),
                        latency_ms = usage.latency_ms,
                        total_tokens = ?usage.total_tokens,
                        "Model call succeeded"
                    );
                    return Ok((completion.text, usage));
                }
                Ok(Ok(_)) => "empty response".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {}s", self.call_timeout.as_secs()),
            };

            warn!(candidate = %candidate.label(), error = %failure, "Model call failed");
            failures.push(format!("{}: {}", candidate.label(), failure));
        }

        Err(PipelineError::AllProvidersFailed { failures })
    }

    /// A hint restricts the attempt to the matching candidates. An unknown
    /// hinted model is sent to the first backend.
    fn candidates_for(&self, model_hint: Option<&str>) -> Vec<ModelCandidate> {
        let Some(hint) = model_hint.map(str::trim).filter(|h| !h.is_empty()) else {
            return self.candidates.clone();
        };

        let matching: Vec<ModelCandidate> = self
            .candidates
            .iter()
            .filter(|c| c.model == hint)
            .cloned()
            .collect();

        if !matching.is_empty() {
            return matching;
        }

        self.candidates
            .first()
            .map(|c| vec![ModelCandidate::new(c.backend.clone(), hint)])
            .unwrap_or_default()
    }
}

/// Candidate order: Gemini models first, then DeepSeek. A backend without a
/// key contributes no candidates.
pub fn configured_candidates(
    config: &ProviderConfig,
    gemini_api_key: Option<String>,
    deepseek_api_key: Option<String>,
) -> Result<Vec<ModelCandidate>> {
    let mut candidates = Vec::new();

    if let Some(key) = gemini_api_key.filter(|k| !k.trim().is_empty()) {
        let gemini: Arc<dyn ModelBackend> = Arc::new(GeminiBackend::new(key)?);
        for model in &config.gemini_models {
            candidates.push(ModelCandidate::new(gemini.clone(), model.clone()));
        }
    }

    if let Some(key) = deepseek_api_key.filter(|k| !k.trim().is_empty()) {
        let deepseek: Arc<dyn ModelBackend> = Arc::new(ChatCompletionsBackend::new(
            "deepseek",
            key,
            &config.deepseek_base_url,
        )?);
        candidates.push(ModelCandidate::new(deepseek, config.deepseek_model.clone()));
    }

    Ok(candidates)
}
