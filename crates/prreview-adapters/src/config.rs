//! Configuration management for prreview
//!
//! Defaults, then an optional TOML file, then environment overrides.

use anyhow::Context;
use prreview_core::SuggestionLimits;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_MODEL: &str = "qwen2.5-coder:7b";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub inference: InferenceConfig,
    pub patch: PatchConfig,
    pub suggestions: SuggestionLimits,
    pub queue: QueueConfig,
    pub store: StoreConfig,
}

/// Inference backend endpoint, candidate models and staged budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub base_url: String,
    pub default_model: String,
    pub fallback_models: Vec<String>,
    pub timeout_ms: u64,
    pub retry_timeout_floor_ms: u64,
    pub max_tokens: u32,
    pub min_retry_tokens: u32,
    pub temperature: f32,
    pub num_ctx: u32,
    pub keep_alive: String,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            fallback_models: Vec::new(),
            timeout_ms: 90_000,
            retry_timeout_floor_ms: 30_000,
            max_tokens: 512,
            min_retry_tokens: 128,
            temperature: 0.1,
            num_ctx: 8192,
            keep_alive: "5m".to_string(),
        }
    }
}

impl InferenceConfig {
    pub fn primary_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `max(floor, floor(primary * 0.66))`
    pub fn retry_timeout(&self) -> Duration {
        let two_thirds = self.timeout_ms.saturating_mul(66) / 100;
        Duration::from_millis(two_thirds.max(self.retry_timeout_floor_ms))
    }

    /// Halved token budget, never below `min_retry_tokens`.
    pub fn retry_max_tokens(&self) -> u32 {
        (self.max_tokens / 2).max(self.min_retry_tokens)
    }
}

/// Clamp limits applied to a file's patch before chunking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    pub max_lines: usize,
    pub max_chars: usize,
    pub max_hunks_per_file: usize,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            max_lines: 800,
            max_chars: 40_000,
            max_hunks_per_file: 6,
        }
    }
}

/// Retry/retention policy of the job transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub attempts: u32,
    pub backoff_ms: u64,
    pub retention_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 1000,
            retention_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("prreview.db"),
        }
    }
}

impl Config {
    /// Load config: defaults, then `path` (TOML) if given, then process environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// `load` with an explicit environment lookup.
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                toml::from_str::<Config>(&content)
                    .with_context(|| format!("Failed to parse config {}", path.display()))?
            }
            None => Config::default(),
        };
        config.apply_env(lookup);
        config.sanitize()?;
        Ok(config)
    }

    /// Apply environment-style overrides through `lookup`.
    ///
    /// Values that fail to parse keep the current setting.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let inf = &mut self.inference;
        if let Some(url) = lookup("OLLAMA_BASE_URL") {
            inf.base_url = url;
        }
        if let Some(model) = lookup("OLLAMA_MODEL").filter(|m| !m.trim().is_empty()) {
            inf.default_model = model.trim().to_string();
        }
        if let Some(list) = lookup("OLLAMA_FALLBACKS") {
            inf.fallback_models = parse_model_list(&list);
        }
        override_parsed(&lookup, "AI_TIMEOUT_MS", &mut inf.timeout_ms);
        override_parsed(&lookup, "AI_RETRY_TIMEOUT_FLOOR_MS", &mut inf.retry_timeout_floor_ms);
        override_parsed(&lookup, "AI_MAX_TOKENS", &mut inf.max_tokens);
        override_parsed(&lookup, "AI_MIN_RETRY_TOKENS", &mut inf.min_retry_tokens);
        override_parsed(&lookup, "AI_TEMPERATURE", &mut inf.temperature);
        override_parsed(&lookup, "AI_NUM_CTX", &mut inf.num_ctx);
        if let Some(keep_alive) = lookup("AI_KEEP_ALIVE").filter(|v| !v.trim().is_empty()) {
            inf.keep_alive = keep_alive.trim().to_string();
        }

        override_parsed(&lookup, "MAX_PATCH_LINES", &mut self.patch.max_lines);
        override_parsed(&lookup, "MAX_PATCH_CHARS", &mut self.patch.max_chars);
        override_parsed(&lookup, "MAX_HUNKS_PER_FILE", &mut self.patch.max_hunks_per_file);
        override_parsed(&lookup, "MAX_MESSAGE_CHARS", &mut self.suggestions.max_message_chars);
        override_parsed(&lookup, "MAX_FIX_PATCH_CHARS", &mut self.suggestions.max_fix_patch_chars);

        override_parsed(&lookup, "JOB_ATTEMPTS", &mut self.queue.attempts);
        override_parsed(&lookup, "JOB_BACKOFF_MS", &mut self.queue.backoff_ms);
        override_parsed(&lookup, "JOB_RETENTION_SECS", &mut self.queue.retention_secs);

        if let Some(path) = lookup("PRREVIEW_DB").filter(|p| !p.trim().is_empty()) {
            self.store.database_path = PathBuf::from(path.trim());
        }
    }

    /// Normalize values and reject settings the pipeline cannot run with.
    pub fn sanitize(&mut self) -> anyhow::Result<()> {
        let inf = &mut self.inference;
        inf.base_url = inf.base_url.trim().trim_end_matches('/').to_string();
        url::Url::parse(&inf.base_url)
            .with_context(|| format!("Invalid inference base URL '{}'", inf.base_url))?;
        inf.default_model = inf.default_model.trim().to_string();
        if inf.default_model.is_empty() {
            anyhow::bail!("A default model id is required");
        }
        inf.fallback_models = inf
            .fallback_models
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        if !inf.temperature.is_finite() || inf.temperature < 0.0 {
            tracing::warn!(temperature = inf.temperature, "invalid temperature, using default");
            inf.temperature = InferenceConfig::default().temperature;
        }
        inf.timeout_ms = inf.timeout_ms.max(1);
        inf.max_tokens = inf.max_tokens.max(1);

        self.patch.max_lines = self.patch.max_lines.max(1);
        self.patch.max_chars = self.patch.max_chars.max(1);
        self.patch.max_hunks_per_file = self.patch.max_hunks_per_file.max(1);
        self.queue.attempts = self.queue.attempts.max(1);
        Ok(())
    }
}

/// Split a comma-separated model list, trimming entries and dropping empties.
pub fn parse_model_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable config value"),
    }
}
