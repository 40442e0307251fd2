//! Contract between the resilient client and a concrete inference backend.

use futures::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;

/// One non-streaming generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub num_ctx: u32,
    pub keep_alive: String,
    /// Deadline for this attempt only.
    pub timeout: Duration,
}

/// Per-attempt failures. All of them are recoverable by moving on to the
/// next candidate model.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("{model} timed out after {}ms", .after.as_millis())]
    Timeout { model: String, after: Duration },
    #[error("{backend} {status}: {body}")]
    Status {
        backend: String,
        status: u16,
        body: String,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response body: {0}")]
    Decode(String),
}

pub trait InferenceBackend: Send + Sync {
    /// Short backend label used in provider tags (e.g. `ollama`).
    fn name(&self) -> &str;

    /// Return the raw response text for `request`.
    fn generate<'a>(
        &'a self,
        request: &'a GenerateRequest,
    ) -> BoxFuture<'a, Result<String, InferenceError>>;
}
