//! Resilient inference client.
//!
//! Walks an ordered list of candidate models. Each candidate gets a primary
//! attempt and, if that parses to nothing, one cheaper retry. Any failure
//! moves on to the next candidate; exhaustion yields an empty result tagged
//! `mock`.

use super::parse::parse_suggestion_array;
use prreview_adapters::config::InferenceConfig;
use prreview_core::{GenerateRequest, InferenceBackend, InferenceError, ProviderTag};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Candidate list and staged budgets.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub default_model: String,
    pub fallback_models: Vec<String>,
    pub primary_timeout: Duration,
    pub retry_timeout: Duration,
    pub max_tokens: u32,
    pub retry_max_tokens: u32,
    pub temperature: f32,
    pub num_ctx: u32,
    pub keep_alive: String,
}

impl From<&InferenceConfig> for ClientSettings {
    fn from(config: &InferenceConfig) -> Self {
        Self {
            default_model: config.default_model.clone(),
            fallback_models: config.fallback_models.clone(),
            primary_timeout: config.primary_timeout(),
            retry_timeout: config.retry_timeout(),
            max_tokens: config.max_tokens,
            retry_max_tokens: config.retry_max_tokens(),
            temperature: config.temperature,
            num_ctx: config.num_ctx,
            keep_alive: config.keep_alive.clone(),
        }
    }
}

/// Parsed array items plus the provider that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutcome {
    pub items: Vec<Value>,
    pub provider: ProviderTag,
}

impl InferenceOutcome {
    fn exhausted() -> Self {
        Self {
            items: Vec::new(),
            provider: ProviderTag::Mock,
        }
    }
}

#[derive(Clone, Copy)]
enum Stage {
    Primary,
    Retry,
}

fn push_unique_candidate(candidates: &mut Vec<String>, candidate: &str) {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return;
    }
    if !candidates.iter().any(|existing| existing == trimmed) {
        candidates.push(trimmed.to_string());
    }
}

pub struct ResilientClient {
    backend: Arc<dyn InferenceBackend>,
    settings: ClientSettings,
}

impl ResilientClient {
    pub fn new(backend: Arc<dyn InferenceBackend>, settings: ClientSettings) -> Self {
        Self { backend, settings }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Preferred (or default) model first, then fallbacks, without repeats.
    pub fn candidates(&self, preferred: Option<&str>) -> Vec<String> {
        let mut out = Vec::with_capacity(1 + self.settings.fallback_models.len());
        let first = preferred
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.settings.default_model.as_str());
        push_unique_candidate(&mut out, first);
        for model in &self.settings.fallback_models {
            push_unique_candidate(&mut out, model);
        }
        out
    }

    /// Never fails; exhaustion is reported through `ProviderTag::Mock`.
    pub async fn suggest(&self, prompt: &str, preferred: Option<&str>) -> InferenceOutcome {
        for model in self.candidates(preferred) {
            let started = Instant::now();
            match self.try_candidate(&model, prompt).await {
                Ok(items) if !items.is_empty() => {
                    info!(
                        model = %model,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        items = items.len(),
                        "Model returned suggestions"
                    );
                    return InferenceOutcome {
                        items,
                        provider: ProviderTag::model(self.backend.name(), model),
                    };
                }
                Ok(_) => warn!(model = %model, "Empty JSON from model"),
                Err(err) => warn!(model = %model, error = %err, "Model attempt failed"),
            }
        }
        InferenceOutcome::exhausted()
    }

    async fn try_candidate(&self, model: &str, prompt: &str) -> Result<Vec<Value>, InferenceError> {
        let items = self.attempt(model, prompt, Stage::Primary).await?;
        if !items.is_empty() {
            return Ok(items);
        }
        debug!(model = %model, "Empty result, retrying with reduced budget");
        self.attempt(model, prompt, Stage::Retry).await
    }

    async fn attempt(
        &self,
        model: &str,
        prompt: &str,
        stage: Stage,
    ) -> Result<Vec<Value>, InferenceError> {
        let (timeout, max_tokens) = match stage {
            Stage::Primary => (self.settings.primary_timeout, self.settings.max_tokens),
            Stage::Retry => (self.settings.retry_timeout, self.settings.retry_max_tokens),
        };
        let request = GenerateRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
            max_tokens,
            temperature: self.settings.temperature,
            num_ctx: self.settings.num_ctx,
            keep_alive: self.settings.keep_alive.clone(),
            timeout,
        };

        // Dropping the future on expiry aborts the in-flight request.
        let text = tokio::time::timeout(timeout, self.backend.generate(&request))
            .await
            .map_err(|_| InferenceError::Timeout {
                model: model.to_string(),
                after: timeout,
            })??;
        Ok(parse_suggestion_array(&text))
    }
}
