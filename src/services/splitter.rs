use super::TextSplitter;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;

/// Treats whitespace-separated words as tokens.
///
/// Each segment holds at most `max_tokens` words joined by single spaces,
/// so input spacing is normalized.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceSplitter;

#[async_trait]
impl TextSplitter for WhitespaceSplitter {
    async fn split(&self, text: &str, max_tokens: usize) -> Result<Vec<String>> {
        if max_tokens == 0 {
            return Err(PipelineError::Configuration(
                "max tokens per chunk must be at least 1".to_string(),
            ));
        }
        let words: Vec<&str> = text.split_whitespace().collect();
        Ok(words.chunks(max_tokens).map(|c| c.join(" ")).collect())
    }
}
