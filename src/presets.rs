//! Standard ingestion pipelines assembled from the built-in steps.
//!
//! All presets start on [`events::START_PROCESS`](crate::steps::events::START_PROCESS)
//! and end when the last chain (usually `EmbeddingAdded`) has no binding.

use crate::config::IngestConfig;
use crate::error::{PipelineError, Result};
use crate::graph::StepHandle;
use crate::observer::RunObserver;
use crate::pipeline::{Pipeline, PipelineBuilder};
use crate::services::{
    BlobStorage, HistoryWriter, ReaderRegistry, TagGenerator, TextSplitter, VectorIndex,
    WhitespaceSplitter,
};
use crate::steps::{
    events, ChunkStep, IndexStep, LogActionStep, MetadataComposerStep, ReadStep,
    TagifyChunksStep, TagifyDocumentStep, UploadStep, DOCUMENT_PARAM,
};
use std::sync::Arc;

/// Collaborator handles shared by the steps of a preset pipeline.
#[derive(Clone)]
pub struct IngestServices {
    pub storage: Arc<dyn BlobStorage>,
    pub index: Arc<dyn VectorIndex>,
    pub history: Arc<dyn HistoryWriter>,
    pub splitter: Arc<dyn TextSplitter>,
    pub readers: ReaderRegistry,
    /// Required by [`tagged_ingestion`] only.
    pub tagger: Option<Arc<dyn TagGenerator>>,
    pub observer: Option<Arc<dyn RunObserver>>,
}

impl IngestServices {
    /// Whitespace splitting and the default readers.
    pub fn new(
        storage: Arc<dyn BlobStorage>,
        index: Arc<dyn VectorIndex>,
        history: Arc<dyn HistoryWriter>,
    ) -> Self {
        Self {
            storage,
            index,
            history,
            splitter: Arc::new(WhitespaceSplitter),
            readers: ReaderRegistry::with_defaults(),
            tagger: None,
            observer: None,
        }
    }

    pub fn with_splitter(mut self, splitter: Arc<dyn TextSplitter>) -> Self {
        self.splitter = splitter;
        self
    }

    pub fn with_readers(mut self, readers: ReaderRegistry) -> Self {
        self.readers = readers;
        self
    }

    pub fn with_tagger(mut self, tagger: Arc<dyn TagGenerator>) -> Self {
        self.tagger = Some(tagger);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

impl std::fmt::Debug for IngestServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestServices")
            .field("readers", &self.readers)
            .field("has_tagger", &self.tagger.is_some())
            .field("has_observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

fn declare(name: &str, services: &IngestServices) -> PipelineBuilder {
    let mut builder = Pipeline::declare(name);
    if let Some(observer) = &services.observer {
        builder.observer(observer.clone());
    }
    builder
}

/// `StartProcess -> upload -> Uploaded -> {log_action, read}`; returns the
/// read handle so the caller can continue the chain from `Readed`.
fn upload_then_read(
    builder: &mut PipelineBuilder,
    config: &IngestConfig,
    services: &IngestServices,
) -> StepHandle {
    let upload = builder.add_step(UploadStep::new(
        "upload",
        services.storage.clone(),
        config.storage_prefix.clone(),
    ));
    let log = builder.add_step(LogActionStep::new(
        "log_action",
        services.history.clone(),
        config.history_action.clone(),
    ));
    let read = builder.add_step(
        ReadStep::new("read", services.readers.clone()).with_storage(services.storage.clone()),
    );

    builder
        .on_entry_event(events::START_PROCESS)
        .send_to(upload, "upload", DOCUMENT_PARAM);
    builder
        .on_event(upload, events::UPLOADED)
        .send_to(log, "log", DOCUMENT_PARAM)
        .send_to(read, "read", DOCUMENT_PARAM);
    read
}

/// `from --event--> compose_metadata -> MetadataComposed -> index`.
fn compose_then_index(
    builder: &mut PipelineBuilder,
    from: StepHandle,
    event: &str,
    services: &IngestServices,
) {
    let compose = builder.add_step(MetadataComposerStep::new("compose_metadata"));
    let index = builder.add_step(IndexStep::new("index", services.index.clone()));
    builder
        .on_event(from, event)
        .send_to(compose, "compose", DOCUMENT_PARAM);
    builder
        .on_event(compose, events::METADATA_COMPOSED)
        .send_to(index, "index", DOCUMENT_PARAM);
}

/// Upload, log the action, read, chunk, compose metadata, index.
///
/// ```text
/// StartProcess -> upload -> Uploaded -> log_action -> ActionLogSaved
///                                    -> read -> Readed -> chunk -> Chunked
///                                       -> compose_metadata -> MetadataComposed
///                                       -> index -> EmbeddingAdded
/// ```
pub fn upload_and_index(config: &IngestConfig, services: &IngestServices) -> Result<Pipeline> {
    config.validate()?;
    let mut builder = declare("upload_and_index", services);
    let read = upload_then_read(&mut builder, config, services);
    let chunk = builder.add_step(ChunkStep::new(
        "chunk",
        services.splitter.clone(),
        config.max_tokens_per_chunk,
    )?);
    builder
        .on_event(read, events::READED)
        .send_to(chunk, "chunk", DOCUMENT_PARAM);
    compose_then_index(&mut builder, chunk, events::CHUNKED, services);
    builder.build()
}

/// Like [`upload_and_index`], with document tags generated before
/// chunking and chunk tags after.
///
/// Fails with a configuration error if `services.tagger` is unset.
pub fn tagged_ingestion(config: &IngestConfig, services: &IngestServices) -> Result<Pipeline> {
    config.validate()?;
    let tagger = services.tagger.clone().ok_or_else(|| {
        PipelineError::Configuration("tagged_ingestion needs a tag generator".to_string())
    })?;

    let mut builder = declare("tagged_ingestion", services);
    let read = upload_then_read(&mut builder, config, services);
    let tag_document = builder.add_step(TagifyDocumentStep::new("tagify_document", tagger.clone()));
    let chunk = builder.add_step(ChunkStep::new(
        "chunk",
        services.splitter.clone(),
        config.max_tokens_per_chunk,
    )?);
    let tag_chunks = builder.add_step(
        TagifyChunksStep::new("tagify_chunks", tagger).with_concurrency(config.tag_concurrency),
    );

    builder
        .on_event(read, events::READED)
        .send_to(tag_document, "tagify", DOCUMENT_PARAM);
    builder
        .on_event(tag_document, events::TAGS_GENERATED)
        .send_to(chunk, "chunk", DOCUMENT_PARAM);
    builder
        .on_event(chunk, events::CHUNKED)
        .send_to(tag_chunks, "tagify_chunks", DOCUMENT_PARAM);
    compose_then_index(&mut builder, tag_chunks, events::CHUNKS_TAGIFIED, services);
    builder.build()
}

/// Web pages and raw text: no upload, no history.
///
/// ```text
/// StartProcess -> read -> Readed -> chunk -> Chunked -> compose_metadata
///              -> MetadataComposed -> index -> EmbeddingAdded
/// ```
pub fn text_ingestion(config: &IngestConfig, services: &IngestServices) -> Result<Pipeline> {
    config.validate()?;
    let mut builder = declare("text_ingestion", services);
    let read = builder.add_step(
        ReadStep::new("read", services.readers.clone()).with_storage(services.storage.clone()),
    );
    let chunk = builder.add_step(ChunkStep::new(
        "chunk",
        services.splitter.clone(),
        config.max_tokens_per_chunk,
    )?);
    builder
        .on_entry_event(events::START_PROCESS)
        .send_to(read, "read", DOCUMENT_PARAM);
    builder
        .on_event(read, events::READED)
        .send_to(chunk, "chunk", DOCUMENT_PARAM);
    compose_then_index(&mut builder, chunk, events::CHUNKED, services);
    builder.build()
}
