//! Mock completion backend for testing without a live LLM.
//!
//! # Example
//!
//! ```
//! use ingest_pipeline::backend::MockCompletion;
//!
//! let mock = MockCompletion::new(vec!["[\"finance\", \"q3\"]".to_string()]);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Client;

use super::{CompletionBackend, CompletionRequest, CompletionResponse};
use crate::error::{PipelineError, Result};

/// Returns canned responses in order, cycling when exhausted.
///
/// Every prompt is recorded for assertions. The first `n` calls can be made
/// to fail with an HTTP status to exercise retry.
#[derive(Debug)]
pub struct MockCompletion {
    responses: Vec<String>,
    index: AtomicUsize,
    calls: AtomicUsize,
    fail_first: usize,
    fail_status: u16,
    prompts: Mutex<Vec<String>>,
}

impl MockCompletion {
    /// An empty `responses` list yields empty completions.
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            index: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            fail_first: 0,
            fail_status: 503,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A mock that always returns the same response.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// Fail the first `n` calls with HTTP `status`.
    pub fn failing_first(mut self, n: usize, status: u16) -> Self {
        self.fail_first = n;
        self.fail_status = status;
        self
    }

    /// Number of `complete` calls so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received by successful calls, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn next_response(&self) -> String {
        if self.responses.is_empty() {
            return String::new();
        }
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.responses.len();
        self.responses[idx].clone()
    }
}

#[async_trait]
impl CompletionBackend for MockCompletion {
    async fn complete(
        &self,
        _client: &Client,
        _base_url: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(PipelineError::HttpError {
                status: self.fail_status,
                body: "mock failure".into(),
                retry_after: None,
            });
        }
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.clone());
        }
        Ok(CompletionResponse {
            text: self.next_response(),
            status: 200,
            metadata: None,
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
