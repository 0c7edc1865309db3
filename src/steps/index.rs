use super::metadata::compose_metadata;
use super::{events, unknown_function, DOCUMENT_PARAM};
use crate::error::Result;
use crate::record::StepRecord;
use crate::services::{IndexEntry, VectorIndex};
use crate::step::{Access, BoxFut, Emissions, RecordField, Step, StepCall, StepFunction};
use std::sync::Arc;

const FUNCTIONS: &[StepFunction] = &[StepFunction {
    name: "index",
    parameters: &[DOCUMENT_PARAM],
    access: Access {
        reads: &[
            RecordField::Source,
            RecordField::Uri,
            RecordField::Content,
            RecordField::Chunks,
            RecordField::Tags,
            RecordField::Metadata,
        ],
        writes: &[],
    },
}];

const LIST_SEPARATOR: &str = ";";

/// One index entry per chunk, in chunk order.
///
/// Point ids are `{file_id}#{chunk index}`, so re-indexing a document
/// overwrites its previous points. Chunks without composed metadata get it
/// composed here.
pub fn index_entries(record: &StepRecord) -> Vec<IndexEntry> {
    let event_log = record.event_log().join(LIST_SEPARATOR);
    let source_uri = record.uri().unwrap_or_default().to_string();

    record
        .chunks()
        .iter()
        .map(|chunk| {
            let mut metadata = if chunk.composed.is_empty() {
                compose_metadata(record.metadata(), chunk)
            } else {
                chunk.composed.clone()
            };
            let tags: Vec<&str> = record
                .tags()
                .iter()
                .chain(&chunk.tags)
                .map(String::as_str)
                .collect();
            metadata.insert("Content".into(), chunk.content.clone());
            metadata.insert("SourceUri".into(), source_uri.clone());
            metadata.insert("Tags".into(), tags.join(LIST_SEPARATOR));
            metadata.insert("EventLog".into(), event_log.clone());
            metadata.insert("ChunkIndex".into(), chunk.index.to_string());
            metadata.insert("Start".into(), chunk.start.to_string());
            metadata.insert("End".into(), chunk.end.to_string());

            IndexEntry {
                point_id: format!("{}#{}", record.file_id(), chunk.index),
                partition_key: record.conversation_id().to_string(),
                document_id: record.file_id().to_string(),
                text: chunk.content.clone(),
                metadata,
            }
        })
        .collect()
}

/// Upserts every chunk into the vector index, one at a time.
///
/// The first failed upsert fails the step; points written before it stay
/// in the index.
pub struct IndexStep {
    name: String,
    index: Arc<dyn VectorIndex>,
}

impl IndexStep {
    pub fn new(name: impl Into<String>, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }

    async fn index(&self, call: StepCall) -> Result<Emissions> {
        let entries = index_entries(&*call.record.read().await);
        let total = entries.len();
        for (done, entry) in entries.into_iter().enumerate() {
            let point_id = entry.point_id.clone();
            if let Err(e) = self.index.upsert(entry).await {
                tracing::warn!(step = %self.name, %point_id, done, total, error = %e, "upsert failed");
                return Err(e);
            }
        }
        tracing::info!(step = %self.name, points = total, "indexed document");
        Ok(Emissions::one(events::EMBEDDING_ADDED))
    }
}

impl Step for IndexStep {
    fn kind(&self) -> &'static str {
        "index"
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
                "index" => self.index(call).await,
                other => Err(unknown_function(&self.name, other)),
            }
        })
    }
}
