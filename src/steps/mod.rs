//! Built-in step kinds for document ingestion.
//!
//! | Step | function | emits |
//! |---|---|---|
//! | [`UploadStep`] | `upload` | `Uploaded` |
//! | [`LogActionStep`] | `log` | `ActionLogSaved` |
//! | [`ReadStep`] | `read` | `Readed` |
//! | [`ChunkStep`] | `chunk` | `Chunked` |
//! | [`TagifyDocumentStep`] | `tagify` | `TagsGenerated` |
//! | [`TagifyChunksStep`] | `tagify_chunks` | `ChunksTagified` |
//! | [`MetadataComposerStep`] | `compose` | `MetadataComposed` |
//! | [`IndexStep`] | `index` | `EmbeddingAdded` |
//! | [`BarrierStep`] | `arrive` | its configured release event |
//!
//! Every function takes a single `document` parameter.

pub mod barrier;
pub mod chunk;
pub mod index;
pub mod log_action;
pub mod metadata;
pub mod read;
pub mod tagify;
pub mod upload;

pub use barrier::BarrierStep;
pub use chunk::{build_chunks, ChunkStep};
pub use index::{index_entries, IndexStep};
pub use log_action::LogActionStep;
pub use metadata::{compose_metadata, MetadataComposerStep};
pub use read::ReadStep;
pub use tagify::{TagifyChunksStep, TagifyDocumentStep};
pub use upload::UploadStep;

use crate::error::PipelineError;

/// Event names emitted by the built-in steps.
pub mod events {
    /// Entry event of the preset pipelines.
    pub const START_PROCESS: &str = "StartProcess";
    pub const UPLOADED: &str = "Uploaded";
    pub const ACTION_LOG_SAVED: &str = "ActionLogSaved";
    pub const READED: &str = "Readed";
    pub const CHUNKED: &str = "Chunked";
    pub const TAGS_GENERATED: &str = "TagsGenerated";
    pub const CHUNKS_TAGIFIED: &str = "ChunksTagified";
    pub const METADATA_COMPOSED: &str = "MetadataComposed";
    pub const EMBEDDING_ADDED: &str = "EmbeddingAdded";
}

/// Parameter name every built-in function accepts.
pub const DOCUMENT_PARAM: &str = "document";

fn unknown_function(step: &str, function: &str) -> PipelineError {
    PipelineError::Configuration(format!("step '{step}' has no function '{function}'"))
}
