//! The per-run data carrier passed between steps.
//!
//! A [`StepRecord`] describes one document's journey through a pipeline run.
//! Identity fields are fixed at construction; payload fields are filled in by
//! the steps that own them; bookkeeping (metadata, event log) only grows.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Raw input reference for a document.
#[derive(Clone, Serialize, Deserialize)]
pub enum DocumentSource {
    /// An uploaded file held in memory.
    Upload {
        file_name: String,
        /// MIME type reported by the uploader, if any.
        content_type: Option<String>,
        bytes: Vec<u8>,
    },
    /// A location: `http(s)://` web page or a blob URI returned by storage.
    Uri(String),
    /// Raw text supplied directly by the caller.
    Text(String),
}

impl DocumentSource {
    pub fn upload(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        DocumentSource::Upload {
            file_name: file_name.into(),
            content_type: None,
            bytes: bytes.into(),
        }
    }

    pub fn uri(uri: impl Into<String>) -> Self {
        DocumentSource::Uri(uri.into())
    }

    pub fn text(text: impl Into<String>) -> Self {
        DocumentSource::Text(text.into())
    }

    /// Best-effort format detection: explicit content type first, then extension.
    pub fn format(&self) -> DocumentFormat {
        match self {
            DocumentSource::Upload {
                file_name,
                content_type,
                ..
            } => content_type
                .as_deref()
                .and_then(DocumentFormat::from_content_type)
                .unwrap_or_else(|| DocumentFormat::from_path(file_name)),
            DocumentSource::Uri(uri) => {
                let uri = uri.split(['?', '#']).next().unwrap_or(uri);
                match web_path(uri) {
                    Some(path) => match DocumentFormat::from_path(path) {
                        DocumentFormat::Other(ext)
                            if ext.is_empty() || WEB_PAGE_EXTENSIONS.contains(&ext.as_str()) =>
                        {
                            DocumentFormat::Html
                        }
                        format => format,
                    },
                    None => DocumentFormat::from_path(uri),
                }
            }
            DocumentSource::Text(_) => DocumentFormat::PlainText,
        }
    }
}

/// Server-side page extensions that still render to HTML.
const WEB_PAGE_EXTENSIONS: &[&str] = &["php", "asp", "aspx", "jsp"];

/// Path component of an `http(s)` URI, `None` for any other scheme.
fn web_path(uri: &str) -> Option<&str> {
    let rest = uri
        .strip_prefix("http://")
        .or_else(|| uri.strip_prefix("https://"))?;
    Some(rest.find('/').map_or("", |i| &rest[i..]))
}

impl fmt::Debug for DocumentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentSource::Upload {
                file_name,
                content_type,
                bytes,
            } => f
                .debug_struct("Upload")
                .field("file_name", file_name)
                .field("content_type", content_type)
                .field("len", &bytes.len())
                .finish(),
            DocumentSource::Uri(uri) => f.debug_tuple("Uri").field(uri).finish(),
            DocumentSource::Text(text) => f.debug_tuple("Text").field(&text.len()).finish(),
        }
    }
}

/// Document formats the read step can dispatch on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentFormat {
    PlainText,
    Markdown,
    Html,
    Docx,
    /// Anything else, carrying the lowercase extension (empty if none).
    Other(String),
}

impl DocumentFormat {
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type.split(';').next()?.trim().to_ascii_lowercase();
        match essence.as_str() {
            "text/plain" => Some(DocumentFormat::PlainText),
            "text/markdown" => Some(DocumentFormat::Markdown),
            "text/html" | "application/xhtml+xml" => Some(DocumentFormat::Html),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(DocumentFormat::Docx)
            }
            _ => None,
        }
    }

    pub fn from_path(path: &str) -> Self {
        let file = path.rsplit('/').next().unwrap_or(path);
        let ext = match file.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
            _ => String::new(),
        };
        match ext.as_str() {
            "txt" | "text" | "log" | "csv" => DocumentFormat::PlainText,
            "md" | "markdown" => DocumentFormat::Markdown,
            "html" | "htm" => DocumentFormat::Html,
            "docx" => DocumentFormat::Docx,
            _ => DocumentFormat::Other(ext),
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentFormat::PlainText => f.write_str("text"),
            DocumentFormat::Markdown => f.write_str("markdown"),
            DocumentFormat::Html => f.write_str("html"),
            DocumentFormat::Docx => f.write_str("docx"),
            DocumentFormat::Other(ext) if ext.is_empty() => f.write_str("unknown"),
            DocumentFormat::Other(ext) => write!(f, ".{ext}"),
        }
    }
}

/// One token-bounded segment of the document content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Position of the chunk in the document (0-based).
    pub index: usize,
    /// Character offset where the chunk starts.
    pub start: usize,
    /// Character offset where the chunk ends (`start + content length`).
    pub end: usize,
    pub content: String,
    pub tags: Vec<String>,
    /// Chunk-local metadata.
    pub metadata: BTreeMap<String, String>,
    /// Flattened document + chunk metadata, filled by the metadata composer.
    pub composed: BTreeMap<String, String>,
}

impl ChunkRecord {
    pub fn new(index: usize, start: usize, content: impl Into<String>) -> Self {
        let content = content.into();
        let end = start + content.chars().count();
        Self {
            index,
            start,
            end,
            content,
            ..Default::default()
        }
    }
}

/// Mutable per-run record shared by every step of one pipeline run.
///
/// Deserializing applies the same identity checks as [`StepRecord::new`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "StoredRecord")]
pub struct StepRecord {
    conversation_id: String,
    session_id: String,
    file_id: String,
    source: DocumentSource,
    uri: Option<String>,
    content: String,
    chunks: Vec<ChunkRecord>,
    tags: Vec<String>,
    metadata: BTreeMap<String, String>,
    event_log: Vec<String>,
    overwrite: bool,
}

impl StepRecord {
    /// Create a record for one document.
    ///
    /// Fails if `conversation_id` or `file_id` is blank.
    pub fn new(
        conversation_id: impl Into<String>,
        session_id: impl Into<String>,
        file_id: impl Into<String>,
        source: DocumentSource,
    ) -> Result<Self> {
        let conversation_id = conversation_id.into();
        let file_id = file_id.into();
        check_identity(&conversation_id, &file_id)?;
        Ok(Self {
            conversation_id,
            session_id: session_id.into(),
            file_id,
            source,
            uri: None,
            content: String::new(),
            chunks: Vec::new(),
            tags: Vec::new(),
            metadata: BTreeMap::new(),
            event_log: Vec::new(),
            overwrite: false,
        })
    }

    /// Set the overwrite flag (only meaningful before the run starts).
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Insert a metadata entry before the run starts.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn source(&self) -> &DocumentSource {
        &self.source
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn chunks(&self) -> &[ChunkRecord] {
        &self.chunks
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn event_log(&self) -> &[String] {
        &self.event_log
    }

    pub fn overwrite(&self) -> bool {
        self.overwrite
    }

    pub fn set_uri(&mut self, uri: impl Into<String>) {
        self.uri = Some(uri.into());
    }

    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
    }

    pub fn set_chunks(&mut self, chunks: Vec<ChunkRecord>) {
        self.chunks = chunks;
    }

    pub fn chunks_mut(&mut self) -> &mut [ChunkRecord] {
        &mut self.chunks
    }

    /// Append document-level tags. Duplicates are kept.
    pub fn append_tags<I>(&mut self, tags: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.tags.extend(tags);
    }

    /// Insert a metadata entry; an existing key is overwritten.
    pub fn insert_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub(crate) fn push_event(&mut self, event: impl Into<String>) {
        self.event_log.push(event.into());
    }
}

impl fmt::Debug for StepRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRecord")
            .field("conversation_id", &self.conversation_id)
            .field("session_id", &self.session_id)
            .field("file_id", &self.file_id)
            .field("source", &self.source)
            .field("uri", &self.uri)
            .field("content_len", &self.content.len())
            .field("chunks", &self.chunks.len())
            .field("tags", &self.tags.len())
            .field("metadata_keys", &self.metadata.keys().collect::<Vec<_>>())
            .field("event_log", &self.event_log)
            .field("overwrite", &self.overwrite)
            .finish()
    }
}

fn check_identity(conversation_id: &str, file_id: &str) -> Result<()> {
    if conversation_id.trim().is_empty() {
        return Err(PipelineError::InvalidRecord(
            "conversation id cannot be empty".to_string(),
        ));
    }
    if file_id.trim().is_empty() {
        return Err(PipelineError::InvalidRecord(
            "file id cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// Unchecked wire form of [`StepRecord`].
#[derive(Deserialize)]
struct StoredRecord {
    conversation_id: String,
    session_id: String,
    file_id: String,
    source: DocumentSource,
    uri: Option<String>,
    content: String,
    chunks: Vec<ChunkRecord>,
    tags: Vec<String>,
    metadata: BTreeMap<String, String>,
    event_log: Vec<String>,
    overwrite: bool,
}

impl TryFrom<StoredRecord> for StepRecord {
    type Error = PipelineError;

    fn try_from(stored: StoredRecord) -> Result<Self> {
        check_identity(&stored.conversation_id, &stored.file_id)?;
        Ok(Self {
            conversation_id: stored.conversation_id,
            session_id: stored.session_id,
            file_id: stored.file_id,
            source: stored.source,
            uri: stored.uri,
            content: stored.content,
            chunks: stored.chunks,
            tags: stored.tags,
            metadata: stored.metadata,
            event_log: stored.event_log,
            overwrite: stored.overwrite,
        })
    }
}
