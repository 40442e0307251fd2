//! Review domain model: pull requests, runs and suggestions.

use crate::util::truncate_str;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// File path used when a suggestion cannot be tied to a specific file.
pub const UNKNOWN_FILE: &str = "unknown";

/// Provider label recorded when no real model output was obtained.
pub const MOCK_PROVIDER: &str = "mock";

/// Severity of a reviewer finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warn,
    Error,
    Security,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Info,
        Severity::Warn,
        Severity::Error,
        Severity::Security,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Security => "security",
        }
    }

    /// Exact (case-sensitive) match against the four wire values.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == raw)
    }

    /// Coerce an arbitrary JSON value, falling back to `Info`.
    pub fn coerce(value: Option<&serde_json::Value>) -> Self {
        value
            .and_then(|v| v.as_str())
            .and_then(Self::parse)
            .unwrap_or_default()
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a review run.
///
/// `Queued -> Running -> Completed | Failed`. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which backend/model produced a suggestion set.
///
/// Rendered as `<backend>:<model>` (e.g. `ollama:qwen2.5-coder:7b`) or `mock`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProviderTag {
    Model { backend: String, model: String },
    Mock,
}

impl ProviderTag {
    pub fn model(backend: impl Into<String>, model: impl Into<String>) -> Self {
        ProviderTag::Model {
            backend: backend.into(),
            model: model.into(),
        }
    }

    pub fn is_mock(&self) -> bool {
        matches!(self, ProviderTag::Mock)
    }

    /// Parse a stored label. Model ids may themselves contain `:`, so only the
    /// first separator splits backend from model.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((backend, model)) if !backend.is_empty() && !model.is_empty() => {
                ProviderTag::model(backend, model)
            }
            _ => ProviderTag::Mock,
        }
    }
}

impl fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderTag::Model { backend, model } => write!(f, "{}:{}", backend, model),
            ProviderTag::Mock => f.write_str(MOCK_PROVIDER),
        }
    }
}

/// Pick the run-level provider: first non-mock tag observed, else `mock`.
pub fn first_real_provider<'a, I>(seen: I) -> ProviderTag
where
    I: IntoIterator<Item = &'a ProviderTag>,
{
    seen.into_iter()
        .find(|tag| !tag.is_mock())
        .cloned()
        .unwrap_or(ProviderTag::Mock)
}

/// Immutable snapshot of one file's unified diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrFile {
    pub id: Uuid,
    pub path: String,
    pub patch: String,
}

/// The review target: a pull request with its ordered file list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: Uuid,
    pub repo: String,
    pub number: i64,
    pub title: String,
    pub author: String,
    pub head_sha: String,
    pub base_sha: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub files: Vec<PrFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPrFile {
    pub path: String,
    pub patch: String,
}

/// Input for creating (or replacing) a pull request, keyed by `(repo, number)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPullRequest {
    pub repo: String,
    pub number: i64,
    pub title: String,
    pub author: String,
    pub head_sha: String,
    pub base_sha: String,
    pub files: Vec<NewPrFile>,
}

/// One analysis attempt for one pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRun {
    pub id: Uuid,
    pub target_id: Uuid,
    pub status: RunStatus,
    pub provider: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ReviewRun {
    pub fn queued(target_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_id,
            status: RunStatus::Queued,
            provider: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Hard length limits applied to suggestion text before persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuggestionLimits {
    pub max_message_chars: usize,
    pub max_fix_patch_chars: usize,
}

impl Default for SuggestionLimits {
    fn default() -> Self {
        Self {
            max_message_chars: 1000,
            max_fix_patch_chars: 5000,
        }
    }
}

/// A normalized finding that does not yet belong to a run.
///
/// Serialized with the same camelCase keys the model is asked to emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionDraft {
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_patch: Option<String>,
}

impl SuggestionDraft {
    /// A whole-file note anchored at line 1.
    pub fn file_note(file_path: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            start_line: 1,
            end_line: 1,
            severity,
            message: message.into(),
            fix_patch: None,
        }
    }

    /// Enforce line ordering and hard-truncate message/fixPatch.
    pub fn clamped(mut self, limits: &SuggestionLimits) -> Self {
        self.start_line = self.start_line.max(1);
        self.end_line = self.end_line.max(self.start_line);
        if self.message.chars().count() > limits.max_message_chars {
            self.message = truncate_str(&self.message, limits.max_message_chars).to_string();
        }
        self.fix_patch = self
            .fix_patch
            .map(|patch| truncate_str(&patch, limits.max_fix_patch_chars).to_string());
        self
    }

    pub fn into_suggestion(self, run_id: Uuid) -> Suggestion {
        Suggestion {
            id: Uuid::new_v4(),
            run_id,
            file_path: self.file_path,
            start_line: self.start_line,
            end_line: self.end_line,
            severity: self.severity,
            message: self.message,
            fix_patch: self.fix_patch,
        }
    }
}

/// A persisted finding owned by exactly one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: Uuid,
    pub run_id: Uuid,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub severity: Severity,
    pub message: String,
    pub fix_patch: Option<String>,
}
