//! Completion backend for Ollama's native `/api/generate` endpoint.

use super::{CompletionBackend, CompletionRequest, CompletionResponse};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

/// Non-streaming completions against a local or remote Ollama server.
#[derive(Debug, Clone, Default)]
pub struct OllamaCompletion;

impl OllamaCompletion {
    fn build_body(request: &CompletionRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "prompt": request.prompt,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        });
        if request.json_mode {
            body["format"] = json!("json");
        }
        body
    }

    /// `Retry-After` in integer seconds. HTTP-date values are ignored.
    fn parse_retry_after(value: &str) -> Option<Duration> {
        value.trim().parse::<u64>().ok().map(Duration::from_secs)
    }

    fn extract_metadata(resp: &Value) -> Option<Value> {
        let mut meta = serde_json::Map::new();
        for key in ["model", "total_duration", "eval_count", "prompt_eval_count"] {
            if let Some(v) = resp.get(key) {
                meta.insert(key.into(), v.clone());
            }
        }
        if meta.is_empty() {
            None
        } else {
            Some(Value::Object(meta))
        }
    }
}

#[async_trait]
impl CompletionBackend for OllamaCompletion {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse> {
        let url = format!("{}/api/generate", base_url.trim_end_matches('/'));
        let body = Self::build_body(request);
        tracing::debug!(%url, model = %request.model, "ollama generate");

        let resp = client.post(&url).json(&body).send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(Self::parse_retry_after);
            let text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::HttpError {
                status,
                body: text,
                retry_after,
            });
        }

        let json_resp: Value = resp.json().await?;
        let text = json_resp
            .get("response")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        Ok(CompletionResponse {
            text,
            status,
            metadata: Self::extract_metadata(&json_resp),
        })
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_body() {
        let mut request = CompletionRequest::new("llama3.2", "Tag this");
        request.max_tokens = 64;
        let body = OllamaCompletion::build_body(&request);
        assert_eq!(body["model"], "llama3.2");
        assert_eq!(body["prompt"], "Tag this");
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["num_predict"], 64);
        assert!(body.get("format").is_none());

        request.json_mode = true;
        assert_eq!(OllamaCompletion::build_body(&request)["format"], "json");
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(
            OllamaCompletion::parse_retry_after(" 12 "),
            Some(Duration::from_secs(12))
        );
        assert_eq!(
            OllamaCompletion::parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            None
        );
    }

    #[test]
    fn test_extract_metadata() {
        let resp = json!({"response": "x", "model": "m", "eval_count": 3});
        let meta = OllamaCompletion::extract_metadata(&resp).unwrap();
        assert_eq!(meta["model"], "m");
        assert_eq!(meta["eval_count"], 3);
        assert!(OllamaCompletion::extract_metadata(&json!({"response": "x"})).is_none());
    }

    #[tokio::test]
    async fn test_connection_refused_is_request_error() {
        let client = Client::new();
        let request = CompletionRequest::new("m", "p");
        let err = OllamaCompletion
            .complete(&client, "http://127.0.0.1:1", &request)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Request(_)));
    }
}
