use super::{events, unknown_function, DOCUMENT_PARAM};
use crate::error::Result;
use crate::record::ChunkRecord;
use crate::step::{Access, BoxFut, Emissions, RecordField, Step, StepCall, StepFunction};
use std::collections::BTreeMap;

const FUNCTIONS: &[StepFunction] = &[StepFunction {
    name: "compose",
    parameters: &[DOCUMENT_PARAM],
    access: Access {
        reads: &[RecordField::Metadata, RecordField::Chunks],
        writes: &[RecordField::Chunks],
    },
}];

/// Flatten document metadata as `SourceDocument<key>` and chunk metadata as
/// `Chunk<key>` into one map.
pub fn compose_metadata(
    document: &BTreeMap<String, String>,
    chunk: &ChunkRecord,
) -> BTreeMap<String, String> {
    document
        .iter()
        .map(|(k, v)| (format!("SourceDocument{k}"), v.clone()))
        .chain(
            chunk
                .metadata
                .iter()
                .map(|(k, v)| (format!("Chunk{k}"), v.clone())),
        )
        .collect()
}

/// Writes the composed metadata map of every chunk.
pub struct MetadataComposerStep {
    name: String,
}

impl MetadataComposerStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    async fn compose(&self, call: StepCall) -> Result<Emissions> {
        let mut record = call.record.write().await;
        let document = record.metadata().clone();
        for chunk in record.chunks_mut() {
            chunk.composed = compose_metadata(&document, chunk);
        }
        tracing::debug!(step = %self.name, chunks = record.chunks().len(), "composed metadata");
        Ok(Emissions::one(events::METADATA_COMPOSED))
    }
}

impl Step for MetadataComposerStep {
    fn kind(&self) -> &'static str {
        "metadata_composer"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn functions(&self) -> &[StepFunction] {
        FUNCTIONS
    }

    fn invoke<'a>(&'a self, function: &'a str, call: StepCall) -> BoxFut<'a, Result<Emissions>> {
        Box::pin(async move {
            match function {
                "compose" => self.compose(call).await,
                other => Err(unknown_function(&self.name, other)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::build_chunks;
    use crate::steps::testing::{call, shared, text_record};

    #[test]
    fn test_compose_prefixes_keys() {
        let doc = BTreeMap::from([("Author".to_string(), "ana".to_string())]);
        let mut chunk = ChunkRecord::new(0, 0, "x");
        chunk.metadata.insert("Page".into(), "3".into());
        let composed = compose_metadata(&doc, &chunk);
        assert_eq!(composed.len(), 2);
        assert_eq!(composed["SourceDocumentAuthor"], "ana");
        assert_eq!(composed["ChunkPage"], "3");
    }

    #[tokio::test]
    async fn test_step_composes_every_chunk() {
        let rec = shared(text_record("x").with_metadata("Lang", "en"));
        rec.write().await.set_chunks(build_chunks(["a", "b"]));
        let out = MetadataComposerStep::new("compose")
            .invoke("compose", call(&rec, "Chunked"))
            .await
            .unwrap();
        assert_eq!(out, Emissions::one(events::METADATA_COMPOSED));
        let rec = rec.read().await;
        assert!(rec
            .chunks()
            .iter()
            .all(|c| c.composed.get("SourceDocumentLang").map(String::as_str) == Some("en")));
    }
}
