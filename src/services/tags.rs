//! Tag generation: a fixed generator for tests and an LLM-backed one.
//!
//! Models answer in many shapes, so [`parse_tag_list`] tries, in order:
//! 1. a JSON array of strings
//! 2. a JSON object with a `tags` (or `items`, `keywords`) array
//! 3. the same inside a markdown code fence
//! 4. the last bracketed `[...]` array in the text
//! 5. a bulleted or numbered list (two items or more)
//! 6. a comma-separated line
//!
//! `<think>` / `<thinking>` blocks are stripped first. Tags are trimmed and
//! lowercased; duplicates are kept.

use super::TagGenerator;
use crate::backend::{with_backoff, CompletionBackend, CompletionRequest};
use crate::config::TaggingConfig;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Longest tag accepted; longer items are prose, not tags.
const MAX_TAG_CHARS: usize = 64;

const LIST_KEYS: &[&str] = &["tags", "items", "keywords"];

/// Parse a model response into a list of tags.
pub fn parse_tag_list(response: &str) -> Result<Vec<String>> {
    let cleaned = strip_think_blocks(response);
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Err(PipelineError::TagGeneration("empty response".to_string()));
    }

    let raw = json_list(cleaned)
        .or_else(|| fenced_block(cleaned).and_then(json_list))
        .or_else(|| last_bracketed(cleaned).and_then(json_list))
        .or_else(|| bullet_list(cleaned))
        .unwrap_or_else(|| comma_list(cleaned));

    let tags: Vec<String> = raw
        .into_iter()
        .map(|t| clean_tag(&t))
        .filter(|t| !t.is_empty() && t.chars().count() <= MAX_TAG_CHARS)
        .collect();
    if tags.is_empty() {
        return Err(PipelineError::TagGeneration(format!(
            "no tags in response: {}",
            truncate(cleaned, 120)
        )));
    }
    Ok(tags)
}

fn clean_tag(tag: &str) -> String {
    tag.trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`' || c == '#')
        .trim()
        .to_lowercase()
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((i, _)) => format!("{}...", &s[..i]),
        None => s.to_string(),
    }
}

fn strip_think_blocks(text: &str) -> String {
    let mut out = text.to_string();
    for (open, close) in [("<think>", "</think>"), ("<thinking>", "</thinking>")] {
        while let Some(start) = out.find(open) {
            match out[start..].find(close) {
                Some(end) => out.replace_range(start..start + end + close.len(), ""),
                None => out.truncate(start),
            }
        }
    }
    out
}

/// `["a", "b"]` or `{"tags": ["a", "b"]}`.
fn json_list(text: &str) -> Option<Vec<String>> {
    let value: Value = serde_json::from_str(text.trim()).ok()?;
    let array = match &value {
        Value::Array(items) => items,
        Value::Object(map) => LIST_KEYS
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_array))?,
        _ => return None,
    };
    let items: Vec<String> = array
        .iter()
        .filter_map(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect();
    (!items.is_empty()).then_some(items)
}

/// Body of the first ``` fence.
fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after = &text[open + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

/// Last top-level `[...]` span, skipping brackets inside strings.
fn last_bracketed(text: &str) -> Option<&str> {
    let mut best = None;
    let mut depth = 0usize;
    let mut start = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '[' if !in_string => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            ']' if !in_string && depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    best = Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    best
}

/// `- a`, `* a`, `• a`, `1. a`, `2) a`.
fn bullet_list(text: &str) -> Option<Vec<String>> {
    let items: Vec<String> = text
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let numbered = line
                .trim_start_matches(|c: char| c.is_ascii_digit())
                .strip_prefix(['.', ')'])
                .filter(|_| line.starts_with(|c: char| c.is_ascii_digit()));
            let bulleted = ["-", "*", "\u{2022}"]
                .iter()
                .find_map(|p| line.strip_prefix(p));
            numbered.or(bulleted).map(|rest| rest.trim().to_string())
        })
        .filter(|t| !t.is_empty())
        .collect();
    (items.len() >= 2).then_some(items)
}

fn comma_list(text: &str) -> Vec<String> {
    let line = text
        .lines()
        .map(str::trim)
        .rfind(|l| l.contains(','))
        .unwrap_or(text);
    let line = line
        .split_once(':')
        .filter(|(head, _)| !head.contains(','))
        .map_or(line, |(_, tail)| tail);
    line.split(',').map(|s| s.to_string()).collect()
}

/// Returns the same tags for every input.
#[derive(Debug, Clone, Default)]
pub struct FixedTags {
    tags: Vec<String>,
}

impl FixedTags {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl TagGenerator for FixedTags {
    async fn generate_tags(&self, _text: &str) -> Result<Vec<String>> {
        Ok(self.tags.clone())
    }
}

/// Generates tags with a completion model.
///
/// The prompt template's `{text}` placeholder receives the input, and
/// `{max_tags}` the configured tag budget.
pub struct LlmTagGenerator {
    backend: Arc<dyn CompletionBackend>,
    client: reqwest::Client,
    config: TaggingConfig,
}

impl LlmTagGenerator {
    pub fn new(backend: Arc<dyn CompletionBackend>, config: TaggingConfig) -> Self {
        Self {
            backend,
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Reuse an existing HTTP client (connection pool).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn config(&self) -> &TaggingConfig {
        &self.config
    }

    fn render_prompt(&self, text: &str) -> String {
        let text = match text.char_indices().nth(self.config.max_input_chars) {
            Some((i, _)) => &text[..i],
            None => text,
        };
        self.config
            .prompt_template
            .replace("{max_tags}", &self.config.max_tags.to_string())
            .replace("{text}", text)
    }
}

impl std::fmt::Debug for LlmTagGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmTagGenerator")
            .field("backend", &self.backend.name())
            .field("model", &self.config.model)
            .finish()
    }
}

#[async_trait]
impl TagGenerator for LlmTagGenerator {
    async fn generate_tags(&self, text: &str) -> Result<Vec<String>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut request = CompletionRequest::new(&self.config.model, self.render_prompt(text));
        request.temperature = self.config.temperature;
        request.max_tokens = self.config.max_tokens;
        request.json_mode = self.config.json_mode;

        let response = with_backoff(
            self.backend.as_ref(),
            &self.client,
            &self.config.base_url,
            &request,
            &self.config.backoff,
        )
        .await?;
        let mut tags = parse_tag_list(&response.text)?;
        tags.truncate(self.config.max_tags);
        tracing::debug!(backend = self.backend.name(), count = tags.len(), "generated tags");
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockCompletion;

    #[test]
    fn test_parse_json_array() {
        assert_eq!(
            parse_tag_list(r#"["Finance", " Q3 "]"#).unwrap(),
            vec!["finance", "q3"]
        );
    }

    #[test]
    fn test_parse_object_and_fence() {
        assert_eq!(
            parse_tag_list(r#"{"tags": ["a", "b"]}"#).unwrap(),
            vec!["a", "b"]
        );
        let fenced = "Here you go:\n```json\n{\"keywords\": [\"x\"]}\n```";
        assert_eq!(parse_tag_list(fenced).unwrap(), vec!["x"]);
    }

    #[test]
    fn test_parse_bracketed_after_think() {
        let response = "<think>maybe [\"wrong\"]</think>Sure! Tags: [\"revenue\", \"growth\"] hope that helps";
        assert_eq!(parse_tag_list(response).unwrap(), vec!["revenue", "growth"]);
    }

    #[test]
    fn test_parse_lists() {
        assert_eq!(
            parse_tag_list("1. Alpha\n2) Beta\n- #gamma").unwrap(),
            vec!["alpha", "beta", "gamma"]
        );
        assert_eq!(
            parse_tag_list("Tags: rust, async, rust").unwrap(),
            vec!["rust", "async", "rust"]
        );
    }

    #[test]
    fn test_parse_empty_fails() {
        assert!(matches!(
            parse_tag_list("  <think>only thoughts</think> "),
            Err(PipelineError::TagGeneration(_))
        ));
    }

    #[tokio::test]
    async fn test_fixed_tags() {
        let tags = FixedTags::new(["a", "b"]).generate_tags("anything").await.unwrap();
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_llm_generator_renders_prompt_and_parses() {
        let mock = Arc::new(MockCompletion::fixed(r#"["budget", "forecast", "extra"]"#));
        let config = TaggingConfig {
            prompt_template: "Give {max_tags} tags for: {text}".into(),
            max_tags: 2,
            ..TaggingConfig::default()
        };
        let generator = LlmTagGenerator::new(mock.clone(), config);
        let tags = generator.generate_tags("2025 budget plan").await.unwrap();
        assert_eq!(tags, vec!["budget", "forecast"]);
        assert_eq!(mock.prompts(), vec!["Give 2 tags for: 2025 budget plan"]);
    }

    #[tokio::test]
    async fn test_llm_generator_skips_blank_text() {
        let mock = Arc::new(MockCompletion::fixed("[\"x\"]"));
        let generator = LlmTagGenerator::new(mock.clone(), TaggingConfig::default());
        assert!(generator.generate_tags("   ").await.unwrap().is_empty());
        assert_eq!(mock.calls(), 0);
    }
}
