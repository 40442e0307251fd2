//! Ollama `/api/generate` backend.

use futures::future::BoxFuture;
use prreview_core::util::truncate_str;
use prreview_core::{GenerateRequest, InferenceBackend, InferenceError};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

pub const BACKEND_NAME: &str = "ollama";

/// Maximum length for error bodies carried in errors.
const MAX_ERROR_BODY_LEN: usize = 200;

#[derive(Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    options: GenerateOptions<'a>,
    stream: bool,
}

#[derive(Serialize)]
struct GenerateOptions<'a> {
    num_ctx: u32,
    num_predict: u32,
    temperature: f32,
    keep_alive: &'a str,
}

#[derive(Clone)]
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call(&self, request: &GenerateRequest) -> Result<String, InferenceError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateBody {
            model: &request.model,
            prompt: &request.prompt,
            options: GenerateOptions {
                num_ctx: request.num_ctx,
                num_predict: request.max_tokens,
                temperature: request.temperature,
                keep_alive: &request.keep_alive,
            },
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, request))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(InferenceError::Status {
                backend: BACKEND_NAME.to_string(),
                status: status.as_u16(),
                body: truncate_str(&text, MAX_ERROR_BODY_LEN).to_string(),
            });
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| map_reqwest_error(e, request))?;
        Ok(match json.get("response") {
            None | Some(Value::Null) => "[]".to_string(),
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
        })
    }
}

fn map_reqwest_error(err: reqwest::Error, request: &GenerateRequest) -> InferenceError {
    if err.is_timeout() {
        InferenceError::Timeout {
            model: request.model.clone(),
            after: request.timeout,
        }
    } else if err.is_decode() {
        InferenceError::Decode(err.to_string())
    } else {
        InferenceError::Transport(err.to_string())
    }
}

impl InferenceBackend for OllamaBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn generate<'a>(
        &'a self,
        request: &'a GenerateRequest,
    ) -> BoxFuture<'a, Result<String, InferenceError>> {
        Box::pin(self.call(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(timeout: Duration) -> GenerateRequest {
        GenerateRequest {
            model: "qwen2.5-coder:7b".to_string(),
            prompt: "review this".to_string(),
            max_tokens: 512,
            temperature: 0.1,
            num_ctx: 8192,
            keep_alive: "5m".to_string(),
            timeout,
        }
    }

    #[tokio::test]
    async fn test_generate_sends_options_and_returns_response_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({
                "model": "qwen2.5-coder:7b",
                "stream": false,
                "options": {"num_ctx": 8192, "num_predict": 512, "keep_alive": "5m"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "qwen2.5-coder:7b",
                "response": "[{\"message\":\"x\"}]",
                "done": true
            })))
            .mount(&server)
            .await;

        let backend = OllamaBackend::new(format!("{}/", server.uri()));
        let text = backend
            .generate(&request(Duration::from_secs(5)))
            .await
            .expect("generate");
        assert_eq!(text, "[{\"message\":\"x\"}]");
    }

    #[tokio::test]
    async fn test_missing_response_field_defaults_to_empty_array() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"done": true})))
            .mount(&server)
            .await;

        let backend = OllamaBackend::new(server.uri());
        let text = backend.generate(&request(Duration::from_secs(5))).await.unwrap();
        assert_eq!(text, "[]");
    }

    #[tokio::test]
    async fn test_server_error_carries_truncated_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(500)))
            .mount(&server)
            .await;

        let backend = OllamaBackend::new(server.uri());
        let err = backend
            .generate(&request(Duration::from_secs(5)))
            .await
            .unwrap_err();
        match err {
            InferenceError::Status { status, body, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body.len(), 200);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(500))
                    .set_body_json(serde_json::json!({"response": "[]"})),
            )
            .mount(&server)
            .await;

        let backend = OllamaBackend::new(server.uri());
        let err = backend
            .generate(&request(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Timeout { .. }));
    }
}
