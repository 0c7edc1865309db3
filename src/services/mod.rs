//! Collaborator interfaces consumed by the steps.
//!
//! Every external effect of a pipeline (blob storage, vector index, history,
//! tag generation, text extraction, splitting) goes through one of these
//! traits. Steps hold them as `Arc<dyn _>` handles; the in-memory
//! implementations in [`memory`] double as test fixtures.

pub mod fs;
pub mod memory;
pub mod readers;
pub mod splitter;
pub mod tags;

pub use fs::{FsBlobStorage, JsonlHistory};
pub use memory::{MemoryBlobStorage, MemoryHistory, MemoryVectorIndex};
pub use readers::{DocxReader, HtmlReader, PlainTextReader, ReaderRegistry};
pub use splitter::WhitespaceSplitter;
pub use tags::{parse_tag_list, FixedTags, LlmTagGenerator};

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Object storage for uploaded documents.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Store `bytes` under `key` and return a URI that [`download`](Self::download)
    /// accepts. With `overwrite == false` an existing object is an error.
    async fn upload(
        &self,
        key: &str,
        bytes: Vec<u8>,
        overwrite: bool,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String>;

    async fn download(&self, uri: &str) -> Result<Vec<u8>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether `uri` belongs to this store.
    fn owns(&self, uri: &str) -> bool;
}

/// One point written to the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Stable id; upserting the same id twice overwrites.
    pub point_id: String,
    pub partition_key: String,
    pub document_id: String,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

/// Index acknowledgement for one upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexAck {
    pub point_id: String,
    /// `false` when an existing point was replaced.
    pub created: bool,
}

/// Embedding/vector store. Embedding happens behind this interface.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, entry: IndexEntry) -> Result<IndexAck>;
}

/// Splits text into segments of at most `max_tokens` tokens each.
#[async_trait]
pub trait TextSplitter: Send + Sync {
    async fn split(&self, text: &str, max_tokens: usize) -> Result<Vec<String>>;
}

/// Produces descriptive tags for a text.
#[async_trait]
pub trait TagGenerator: Send + Sync {
    async fn generate_tags(&self, text: &str) -> Result<Vec<String>>;
}

/// An entry in the conversation action history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub conversation_id: String,
    pub session_id: String,
    pub file_id: String,
    pub action: String,
    pub source_uri: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Append-only action history.
#[async_trait]
pub trait HistoryWriter: Send + Sync {
    async fn append(&self, record: HistoryRecord) -> Result<()>;
}

/// Extracts plain text from raw document bytes.
pub trait DocumentReader: Send + Sync {
    fn name(&self) -> &'static str;

    fn read(&self, bytes: &[u8]) -> Result<String>;
}
