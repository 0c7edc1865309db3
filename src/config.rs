//! Configuration for the standard ingestion pipelines.
//!
//! Every field has a default, so an empty document (`{}`) is a valid
//! configuration. JSON is always supported; YAML needs the `yaml` feature.

use crate::backend::BackoffConfig;
use crate::error::{PipelineError, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings shared by the preset pipelines and their steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Token budget of one chunk.
    #[serde(default = "default_max_tokens_per_chunk")]
    pub max_tokens_per_chunk: usize,

    /// First segment of every blob key: `{prefix}/{conversation}/{file}/{name}`.
    #[serde(default = "default_storage_prefix")]
    pub storage_prefix: String,

    /// Action name written to the history by the log step.
    #[serde(default = "default_history_action")]
    pub history_action: String,

    /// Chunks tagged concurrently by the chunk tagging step.
    #[serde(default = "default_tag_concurrency")]
    pub tag_concurrency: usize,

    #[serde(default)]
    pub tagging: TaggingConfig,
}

/// LLM tag generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaggingConfig {
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    /// Completion budget per call.
    pub max_tokens: u32,
    pub json_mode: bool,
    /// Tags kept per call.
    pub max_tags: usize,
    /// Input longer than this many characters is cut before prompting.
    pub max_input_chars: usize,
    /// Placeholders: `{text}`, `{max_tags}`.
    pub prompt_template: String,
    pub backoff: BackoffConfig,
}

fn default_max_tokens_per_chunk() -> usize {
    100
}

fn default_storage_prefix() -> String {
    "documents".to_string()
}

fn default_history_action() -> String {
    "upload".to_string()
}

fn default_tag_concurrency() -> usize {
    4
}

const DEFAULT_TAG_PROMPT: &str = "Extract at most {max_tags} short topical tags from the \
text below. Answer with a JSON array of lowercase strings and nothing else.\n\nText:\n{text}";

impl Default for TaggingConfig {
    fn default() -> Self {
        Self {
            model: "llama3.2:3b".to_string(),
            base_url: "http://localhost:11434".to_string(),
            temperature: 0.2,
            max_tokens: 256,
            json_mode: false,
            max_tags: 10,
            max_input_chars: 8_000,
            prompt_template: DEFAULT_TAG_PROMPT.to_string(),
            backoff: BackoffConfig::none(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_chunk: default_max_tokens_per_chunk(),
            storage_prefix: default_storage_prefix(),
            history_action: default_history_action(),
            tag_concurrency: default_tag_concurrency(),
            tagging: TaggingConfig::default(),
        }
    }
}

impl IngestConfig {
    pub fn with_max_tokens_per_chunk(mut self, max_tokens: usize) -> Self {
        self.max_tokens_per_chunk = max_tokens;
        self
    }

    pub fn with_storage_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.storage_prefix = prefix.into();
        self
    }

    pub fn with_history_action(mut self, action: impl Into<String>) -> Self {
        self.history_action = action.into();
        self
    }

    pub fn with_tag_concurrency(mut self, concurrency: usize) -> Self {
        self.tag_concurrency = concurrency;
        self
    }

    pub fn with_tagging(mut self, tagging: TaggingConfig) -> Self {
        self.tagging = tagging;
        self
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: IngestConfig =
            serde_json::from_str(json).context("invalid ingest configuration JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML document.
    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: IngestConfig =
            serde_yaml::from_str(yaml).context("invalid ingest configuration YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; the format follows the extension (`.json`, and
    /// `.yaml`/`.yml` with the `yaml` feature).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "json" => Self::from_json_str(&contents),
            #[cfg(feature = "yaml")]
            "yaml" | "yml" => Self::from_yaml_str(&contents),
            other => Err(PipelineError::Configuration(format!(
                "unsupported config file extension '{other}'"
            ))),
        }
    }

    /// Reject values no pipeline can run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens_per_chunk == 0 {
            return Err(PipelineError::Configuration(
                "max_tokens_per_chunk must be > 0".to_string(),
            ));
        }
        if self.tag_concurrency == 0 {
            return Err(PipelineError::Configuration(
                "tag_concurrency must be > 0".to_string(),
            ));
        }
        if self.storage_prefix.contains("..") {
            return Err(PipelineError::Configuration(
                "storage_prefix must not contain '..'".to_string(),
            ));
        }
        if !self.tagging.prompt_template.contains("{text}") {
            return Err(PipelineError::Configuration(
                "tagging.prompt_template must contain {text}".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = IngestConfig::from_json_str("{}").unwrap();
        assert_eq!(config, IngestConfig::default());
        assert_eq!(config.max_tokens_per_chunk, 100);
        assert_eq!(config.tagging.backoff.max_retries, 0);
    }

    #[test]
    fn test_partial_override() {
        let config = IngestConfig::from_json_str(
            r#"{"max_tokens_per_chunk": 250, "tagging": {"model": "qwen2.5", "backoff": {"max_retries": 3}}}"#,
        )
        .unwrap();
        assert_eq!(config.max_tokens_per_chunk, 250);
        assert_eq!(config.storage_prefix, "documents");
        assert_eq!(config.tagging.model, "qwen2.5");
        assert_eq!(config.tagging.base_url, "http://localhost:11434");
        assert_eq!(config.tagging.backoff.max_retries, 3);
    }

    #[test]
    fn test_validation() {
        let err = IngestConfig::from_json_str(r#"{"max_tokens_per_chunk": 0}"#).unwrap_err();
        assert!(err.is_configuration());
        let bad_prompt = IngestConfig::default().with_tagging(TaggingConfig {
            prompt_template: "no placeholder".into(),
            ..TaggingConfig::default()
        });
        assert!(bad_prompt.validate().is_err());
    }

    #[test]
    fn test_malformed_json_is_reported() {
        let err = IngestConfig::from_json_str("{not json").unwrap_err();
        assert!(err.to_string().contains("invalid ingest configuration JSON"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"storage_prefix": "uploads"}}"#).unwrap();
        let config = IngestConfig::from_file(file.path()).unwrap();
        assert_eq!(config.storage_prefix, "uploads");

        let other = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        assert!(IngestConfig::from_file(other.path()).unwrap_err().is_configuration());
    }

    #[cfg(feature = "yaml")]
    #[test]
    fn test_from_yaml() {
        let config = IngestConfig::from_yaml_str("max_tokens_per_chunk: 50\ntagging:\n  max_tags: 3\n")
            .unwrap();
        assert_eq!(config.max_tokens_per_chunk, 50);
        assert_eq!(config.tagging.max_tags, 3);
    }
}
