//! LLM Gateway: JSON-producing text completion (batchable).
//!
//! Grounded on `aigent-llm`'s provider client shape (`OllamaClient`/
//! `OpenRouterClient` wrapping a `reqwest::Client`) and
//! `aigent-daemon::client::DaemonClient::connect_with_backoff`'s
//! exponential-backoff retry loop.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::LlmError;

/// Free-text-in, free-text-out completion call. The core applies tolerant
/// JSON parsing to whatever comes back; this trait makes no promise about
/// output shape.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        schema_hint: Option<&str>,
        options: &CompletionOptions,
    ) -> Result<String, LlmError>;
}

#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub timeout: Duration,
    pub max_retry: u32,
    pub temperature: f32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_retry: 3,
            temperature: 0.2,
        }
    }
}

/// Retry a transient-failing call with exponential backoff, capped at 2s per
/// step — the same shape as `DaemonClient::connect_with_backoff`.
pub async fn retry_with_backoff<F, Fut, T>(max_attempts: u32, mut call: F) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, LlmError>>,
{
    let mut delay = Duration::from_millis(100);
    let mut last_err = LlmError::Permanent("no attempts made".to_string());
    for attempt in 1..=max_attempts.max(1) {
        match call().await {
            Ok(v) => return Ok(v),
            Err(LlmError::Permanent(msg)) => return Err(LlmError::Permanent(msg)),
            Err(err) => {
                tracing::warn!(attempt, %err, "llm call failed; retrying");
                last_err = err;
                if attempt < max_attempts {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                }
            }
        }
    }
    Err(last_err)
}

/// A scripted gateway used by tests: returns queued responses in order, or a
/// fallback once the queue is drained.
pub struct MockLlmGateway {
    responses: Mutex<VecDeque<String>>,
    fallback: String,
}

impl MockLlmGateway {
    pub fn new(responses: impl IntoIterator<Item = String>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            fallback: "{}".to_string(),
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }
}

#[async_trait]
impl LlmGateway for MockLlmGateway {
    async fn complete(
        &self,
        _prompt: &str,
        _schema_hint: Option<&str>,
        _options: &CompletionOptions,
    ) -> Result<String, LlmError> {
        let mut guard = self.responses.lock().unwrap();
        Ok(guard.pop_front().unwrap_or_else(|| self.fallback.clone()))
    }
}

/// HTTP-backed LLM gateway, grounded on `aigent-llm`'s `OllamaClient` shape:
/// a `reqwest::Client` POSTing a chat-completions-style payload.
#[cfg(feature = "http-gateways")]
pub struct HttpLlmGateway {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

#[cfg(feature = "http-gateways")]
impl HttpLlmGateway {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
        }
    }
}

#[cfg(feature = "http-gateways")]
#[derive(serde::Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    temperature: f32,
}

#[cfg(feature = "http-gateways")]
#[derive(serde::Deserialize)]
struct CompletionResponse {
    text: String,
}

#[cfg(feature = "http-gateways")]
#[async_trait]
impl LlmGateway for HttpLlmGateway {
    async fn complete(
        &self,
        prompt: &str,
        _schema_hint: Option<&str>,
        options: &CompletionOptions,
    ) -> Result<String, LlmError> {
        retry_with_backoff(options.max_retry, || async {
            let resp = tokio::time::timeout(
                options.timeout,
                self.client
                    .post(&self.endpoint)
                    .json(&CompletionRequest {
                        model: &self.model,
                        prompt,
                        temperature: options.temperature,
                    })
                    .send(),
            )
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(|e| LlmError::Transient(e.to_string()))?;

            if !resp.status().is_success() {
                let status = resp.status();
                if status.is_client_error() {
                    return Err(LlmError::Permanent(format!("http {status}")));
                }
                return Err(LlmError::Transient(format!("http {status}")));
            }

            let parsed: CompletionResponse = resp
                .json()
                .await
                .map_err(|e| LlmError::Permanent(e.to_string()))?;
            Ok(parsed.text)
        })
        .await
    }
}
