//! Tagging steps: whole document, or every chunk.

use super::{events, unknown_function, DOCUMENT_PARAM};
use crate::error::{PipelineError, Result};
use crate::services::TagGenerator;
use crate::step::{Access, BoxFut, Emissions, RecordField, Step, StepCall, StepFunction};
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;

const DOCUMENT_FUNCTIONS: &[StepFunction] = &[StepFunction {
    name: "tagify",
    parameters: &[DOCUMENT_PARAM],
    access: Access {
        reads: &[RecordField::Content],
        writes: &[RecordField::Tags],
    },
}];

const CHUNK_FUNCTIONS: &[StepFunction] = &[StepFunction {
    name: "tagify_chunks",
    parameters: &[DOCUMENT_PARAM],
    access: Access {
        reads: &[RecordField::Chunks],
        writes: &[RecordField::Chunks],
    },
}];

/// Appends generated tags for the whole content to the record's tags.
pub struct TagifyDocumentStep {
    name: String,
    generator: Arc<dyn TagGenerator>,
}

impl TagifyDocumentStep {
    pub fn new(name: impl Into<String>, generator: Arc<dyn TagGenerator>) -> Self {
        Self {
            name: name.into(),
            generator,
        }
    }

    async fn tagify(&self, call: StepCall) -> Result<Emissions> {
        let content = call.record.read().await.content().to_string();
        let tags = self.generator.generate_tags(&content).await?;
        tracing::debug!(step = %self.name, count = tags.len(), "tagged document");
        call.record.write().await.append_tags(tags);
        Ok(Emissions::one(events::TAGS_GENERATED))
    }
}

impl Step for TagifyDocumentStep {
    fn kind(&self) -> &'static str {
        "tagify_document"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn functions(&self) -> &[StepFunction] {
        DOCUMENT_FUNCTIONS
    }

    fn invoke<'a>(&'a self, function: &'a str, call: StepCall) -> BoxFut<'a, Result<Emissions>> {
        Box::pin(async move {
            match function {
                "tagify" => self.tagify(call).await,
                other => Err(unknown_function(&self.name, other)),
            }
        })
    }
}

/// Appends generated tags to every chunk, tagging up to `concurrency`
/// chunks at once. Results are applied in chunk order.
pub struct TagifyChunksStep {
    name: String,
    generator: Arc<dyn TagGenerator>,
    concurrency: usize,
}

impl TagifyChunksStep {
    pub fn new(name: impl Into<String>, generator: Arc<dyn TagGenerator>) -> Self {
        Self {
            name: name.into(),
            generator,
            concurrency: 1,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    async fn tagify_chunks(&self, call: StepCall) -> Result<Emissions> {
        let texts: Vec<String> = call
            .record
            .read()
            .await
            .chunks()
            .iter()
            .map(|c| c.content.clone())
            .collect();

        let futs: Vec<_> = texts
            .iter()
            .map(|text| self.generator.generate_tags(text))
            .collect();
        let generated: Vec<Vec<String>> = futures::stream::iter(futs)
        .buffered(self.concurrency)
        .try_collect()
        .await?;

        let mut record = call.record.write().await;
        if record.chunks().len() != generated.len() {
            return Err(PipelineError::Other(format!(
                "chunks changed while tagging: {} before, {} after",
                generated.len(),
                record.chunks().len()
            )));
        }
        for (chunk, tags) in record.chunks_mut().iter_mut().zip(generated) {
            chunk.tags.extend(tags);
        }
        tracing::debug!(step = %self.name, chunks = texts.len(), "tagged chunks");
        Ok(Emissions::one(events::CHUNKS_TAGIFIED))
    }
}

impl Step for TagifyChunksStep {
    fn kind(&self) -> &'static str {
        "tagify_chunks"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn functions(&self) -> &[StepFunction] {
        CHUNK_FUNCTIONS
    }

    fn invoke<'a>(&'a self, function: &'a str, call: StepCall) -> BoxFut<'a, Result<Emissions>> {
        Box::pin(async move {
            match function {
                "tagify_chunks" => self.tagify_chunks(call).await,
                other => Err(unknown_function(&self.name, other)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockCompletion;
    use crate::config::TaggingConfig;
    use crate::services::{FixedTags, LlmTagGenerator};
    use crate::steps::build_chunks;
    use crate::steps::testing::{call, shared, text_record};

    #[tokio::test]
    async fn test_document_tags_appended_with_duplicates() {
        let step = TagifyDocumentStep::new("tagify", Arc::new(FixedTags::new(["a", "b"])));
        let rec = shared(text_record("x"));
        rec.write().await.append_tags(vec!["a".to_string()]);

        let out = step.invoke("tagify", call(&rec, "Readed")).await.unwrap();
        assert_eq!(out, Emissions::one(events::TAGS_GENERATED));
        assert_eq!(rec.read().await.tags(), ["a", "a", "b"]);
    }

    #[tokio::test]
    async fn test_chunk_tags_in_order() {
        let mock = Arc::new(MockCompletion::new(vec![
            r#"["one"]"#.to_string(),
            r#"["two"]"#.to_string(),
            r#"["three"]"#.to_string(),
        ]));
        let generator = Arc::new(LlmTagGenerator::new(mock, TaggingConfig::default()));
        let step = TagifyChunksStep::new("tagify_chunks", generator);
        let rec = shared(text_record("x"));
        rec.write().await.set_chunks(build_chunks(["alpha", "beta", "gamma"]));

        step.invoke("tagify_chunks", call(&rec, "Chunked")).await.unwrap();
        let rec = rec.read().await;
        let tags: Vec<_> = rec.chunks().iter().map(|c| c.tags.clone()).collect();
        assert_eq!(tags, vec![vec!["one"], vec!["two"], vec!["three"]]);
    }

    #[tokio::test]
    async fn test_chunk_tagging_failure_propagates() {
        let mock = Arc::new(MockCompletion::fixed("").failing_first(10, 400));
        let generator = Arc::new(LlmTagGenerator::new(mock, TaggingConfig::default()));
        let step = TagifyChunksStep::new("tagify_chunks", generator).with_concurrency(4);
        let rec = shared(text_record("x"));
        rec.write().await.set_chunks(build_chunks(["alpha", "beta"]));

        let err = step
            .invoke("tagify_chunks", call(&rec, "Chunked"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::HttpError { status: 400, .. }));
        assert!(rec.read().await.chunks().iter().all(|c| c.tags.is_empty()));
    }
}
