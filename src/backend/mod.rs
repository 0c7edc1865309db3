//! Text completion backends used for LLM tag generation.
//!
//! The [`CompletionBackend`] trait abstracts over providers, translating a
//! normalized [`CompletionRequest`] into a provider HTTP call. It is a black
//! box to the pipeline: only [`LlmTagGenerator`](crate::services::LlmTagGenerator)
//! talks to it.
//!
//! ```text
//! LlmTagGenerator ──► CompletionRequest ──► with_backoff() ──► CompletionBackend::complete()
//!                                                                  │
//!                                                       ┌──────────┴──────────┐
//!                                                OllamaCompletion       MockCompletion
//!                                                 /api/generate          canned text
//! ```

pub mod backoff;
pub mod mock;
pub mod ollama;

pub use backoff::{BackoffConfig, JitterStrategy};
pub use mock::MockCompletion;
pub use ollama::OllamaCompletion;

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use reqwest::Client;

/// A provider-agnostic completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Model identifier (e.g. `"llama3.2:3b"`).
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the provider to constrain output to JSON.
    pub json_mode: bool,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            temperature: 0.2,
            max_tokens: 256,
            json_mode: false,
        }
    }
}

/// A normalized completion response.
#[derive(Debug)]
pub struct CompletionResponse {
    pub text: String,
    /// HTTP status code (for diagnostics).
    pub status: u16,
    /// Provider-specific metadata (token counts, timing, model info).
    pub metadata: Option<serde_json::Value>,
}

/// Abstraction over completion providers.
///
/// Object-safe; used as `Arc<dyn CompletionBackend>`.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse>;

    /// Human-readable name for logging.
    fn name(&self) -> &'static str;
}

/// Whether `error` is a transient transport failure worth retrying.
///
/// Retryable: [`PipelineError::HttpError`] with a status listed in
/// `config.retryable_statuses`, and [`PipelineError::Request`].
pub fn is_retryable(error: &PipelineError, config: &BackoffConfig) -> bool {
    match error {
        PipelineError::HttpError { status, .. } => config.retryable_statuses.contains(status),
        PipelineError::Request(_) => true,
        _ => false,
    }
}

/// Call `backend` with transport-level retry and exponential backoff.
///
/// Returns the first successful response, or the last error once retries
/// are exhausted. A `Retry-After` hint on an HTTP error overrides the
/// computed delay when `config.respect_retry_after` is set.
pub async fn with_backoff(
    backend: &dyn CompletionBackend,
    client: &Client,
    base_url: &str,
    request: &CompletionRequest,
    config: &BackoffConfig,
) -> Result<CompletionResponse> {
    let mut attempt = 0;
    loop {
        match backend.complete(client, base_url, request).await {
            Ok(response) => return Ok(response),
            Err(e) if attempt < config.max_retries && is_retryable(&e, config) => {
                let delay = match &e {
                    PipelineError::HttpError {
                        retry_after: Some(ra),
                        ..
                    } if config.respect_retry_after => *ra,
                    _ => config.delay_for_attempt(attempt),
                };
                attempt += 1;
                tracing::warn!(
                    backend = backend.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying completion"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
