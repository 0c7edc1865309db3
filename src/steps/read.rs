use super::{events, unknown_function, DOCUMENT_PARAM};
use crate::error::{PipelineError, Result};
use crate::record::DocumentSource;
use crate::services::{BlobStorage, ReaderRegistry};
use crate::step::{Access, BoxFut, Emissions, RecordField, Step, StepCall, StepFunction};
use std::sync::Arc;

const FUNCTIONS: &[StepFunction] = &[StepFunction {
    name: "read",
    parameters: &[DOCUMENT_PARAM],
    access: Access {
        reads: &[RecordField::Source, RecordField::Uri],
        writes: &[RecordField::Content],
    },
}];

/// Extracts the document's text with the reader registered for its format.
///
/// Bytes come from the upload itself, blob storage (for URIs the store
/// owns), an HTTP GET (for `http(s)` URIs), or the raw text source.
/// A format with no registered reader fails with
/// [`PipelineError::UnsupportedFormat`] before anything is fetched.
pub struct ReadStep {
    name: String,
    readers: ReaderRegistry,
    storage: Option<Arc<dyn BlobStorage>>,
    http: reqwest::Client,
}

impl ReadStep {
    pub fn new(name: impl Into<String>, readers: ReaderRegistry) -> Self {
        Self {
            name: name.into(),
            readers,
            storage: None,
            http: reqwest::Client::new(),
        }
    }

    /// Resolve blob URIs through `storage`.
    pub fn with_storage(mut self, storage: Arc<dyn BlobStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    async fn fetch(&self, uri: &str) -> Result<Vec<u8>> {
        if let Some(storage) = self.storage.as_ref().filter(|s| s.owns(uri)) {
            return storage.download(uri).await;
        }
        if uri.starts_with("http://") || uri.starts_with("https://") {
            let resp = self.http.get(uri).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(PipelineError::HttpError {
                    status: status.as_u16(),
                    body: resp.text().await.unwrap_or_default(),
                    retry_after: None,
                });
            }
            return Ok(resp.bytes().await?.to_vec());
        }
        Err(PipelineError::Reader(format!("no way to fetch '{uri}'")))
    }

    async fn read(&self, call: StepCall) -> Result<Emissions> {
        let source = call.record.read().await.source().clone();
        let format = source.format();
        let reader = self
            .readers
            .get(&format)
            .cloned()
            .ok_or_else(|| PipelineError::UnsupportedFormat {
                step: self.name.clone(),
                format: format.to_string(),
            })?;

        let bytes = match source {
            DocumentSource::Upload { bytes, .. } => bytes,
            DocumentSource::Text(text) => text.into_bytes(),
            DocumentSource::Uri(uri) => self.fetch(&uri).await?,
        };
        let content = reader.read(&bytes)?;
        tracing::debug!(
            step = %self.name,
            reader = reader.name(),
            %format,
            chars = content.chars().count(),
            "read document"
        );
        call.record.write().await.set_content(content);
        Ok(Emissions::one(events::READED))
    }
}

impl Step for ReadStep {
    fn kind(&self) -> &'static str {
        "read"
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
                "read" => self.read(call).await,
                other => Err(unknown_function(&self.name, other)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::StepRecord;
    use crate::services::{FsBlobStorage, MemoryBlobStorage};
    use crate::steps::testing::{call, shared, text_record};

    fn record(source: DocumentSource) -> StepRecord {
        StepRecord::new("c", "s", "f", source).unwrap()
    }

    #[tokio::test]
    async fn test_reads_raw_text() {
        let step = ReadStep::new("read", ReaderRegistry::with_defaults());
        let rec = shared(text_record("plain words"));
        let out = step.invoke("read", call(&rec, "Uploaded")).await.unwrap();
        assert_eq!(out, Emissions::one(events::READED));
        assert_eq!(rec.read().await.content(), "plain words");
    }

    #[tokio::test]
    async fn test_reads_upload_bytes_by_format() {
        let step = ReadStep::new("read", ReaderRegistry::with_defaults());
        let rec = shared(record(DocumentSource::upload(
            "page.html",
            b"<p>Hello</p><p>there</p>".to_vec(),
        )));
        step.invoke("read", call(&rec, "Uploaded")).await.unwrap();
        assert_eq!(rec.read().await.content(), "Hello\nthere");
    }

    #[tokio::test]
    async fn test_reads_blob_uri_through_storage() {
        let storage = Arc::new(MemoryBlobStorage::new());
        let uri = storage.put("docs/notes.md", b"# Title".to_vec());
        let step = ReadStep::new("read", ReaderRegistry::with_defaults()).with_storage(storage);
        let rec = shared(record(DocumentSource::uri(uri)));
        step.invoke("read", call(&rec, "Uploaded")).await.unwrap();
        assert_eq!(rec.read().await.content(), "# Title");
    }

    #[tokio::test]
    async fn test_unsupported_format() {
        let step = ReadStep::new("read", ReaderRegistry::with_defaults());
        let rec = shared(record(DocumentSource::upload("scan.pdf", vec![1, 2, 3])));
        let err = step.invoke("read", call(&rec, "Uploaded")).await.unwrap_err();
        assert!(err.is_unsupported_format());
        assert_eq!(err.failed_step(), Some("read"));
        assert!(err.to_string().contains(".pdf"));
        assert_eq!(rec.read().await.content(), "");
    }

    #[tokio::test]
    async fn test_unfetchable_uri() {
        let step = ReadStep::new("read", ReaderRegistry::with_defaults());
        let rec = shared(record(DocumentSource::uri("ftp://host/a.txt")));
        let err = step.invoke("read", call(&rec, "Uploaded")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Reader(_)));
    }

    #[tokio::test]
    async fn test_does_not_read_outside_storage_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FsBlobStorage::new(dir.path().join("store")).unwrap());
        std::fs::write(dir.path().join("secret.txt"), "outside the store").unwrap();
        let uri = format!("file://{}/../secret.txt", storage.root().display());

        let step = ReadStep::new("read", ReaderRegistry::with_defaults()).with_storage(storage);
        let rec = shared(record(DocumentSource::uri(uri)));
        assert!(step.invoke("read", call(&rec, "Uploaded")).await.is_err());
        assert_eq!(rec.read().await.content(), "");
    }
}
