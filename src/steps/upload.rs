use super::{events, unknown_function, DOCUMENT_PARAM};
use crate::error::Result;
use crate::record::DocumentSource;
use crate::services::BlobStorage;
use crate::step::{Access, BoxFut, Emissions, RecordField, Step, StepCall, StepFunction};
use std::collections::BTreeMap;
use std::sync::Arc;

const FUNCTIONS: &[StepFunction] = &[StepFunction {
    name: "upload",
    parameters: &[DOCUMENT_PARAM],
    access: Access {
        reads: &[RecordField::Source, RecordField::Metadata],
        writes: &[RecordField::Uri],
    },
}];

enum Plan {
    Store {
        key: String,
        bytes: Vec<u8>,
        overwrite: bool,
        metadata: BTreeMap<String, String>,
    },
    Existing(String),
    Inline,
}

/// Persists uploaded bytes to blob storage and records the resulting URI.
///
/// Sources that already live somewhere (`Uri`) keep their location; raw
/// text is not uploaded.
pub struct UploadStep {
    name: String,
    storage: Arc<dyn BlobStorage>,
    prefix: String,
}

impl UploadStep {
    pub fn new(name: impl Into<String>, storage: Arc<dyn BlobStorage>, prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage,
            prefix: prefix.into(),
        }
    }

    /// `{prefix}/{conversation_id}/{file_id}/{file_name}`, prefix omitted if empty.
    pub fn object_key(&self, conversation_id: &str, file_id: &str, file_name: &str) -> String {
        let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{conversation_id}/{file_id}/{base}")
        } else {
            format!("{prefix}/{conversation_id}/{file_id}/{base}")
        }
    }

    async fn upload(&self, call: StepCall) -> Result<Emissions> {
        let plan = {
            let record = call.record.read().await;
            match record.source() {
                DocumentSource::Upload {
                    file_name, bytes, ..
                } => Plan::Store {
                    key: self.object_key(record.conversation_id(), record.file_id(), file_name),
                    bytes: bytes.clone(),
                    overwrite: record.overwrite(),
                    metadata: record.metadata().clone(),
                },
                DocumentSource::Uri(uri) => Plan::Existing(uri.clone()),
                DocumentSource::Text(_) => Plan::Inline,
            }
        };

        match plan {
            Plan::Store {
                key,
                bytes,
                overwrite,
                metadata,
            } => {
                let size = bytes.len();
                let uri = self.storage.upload(&key, bytes, overwrite, &metadata).await?;
                tracing::info!(step = %self.name, %key, bytes = size, %uri, "uploaded document");
                call.record.write().await.set_uri(uri);
            }
            Plan::Existing(uri) => {
                tracing::debug!(step = %self.name, %uri, "source already stored");
                call.record.write().await.set_uri(uri);
            }
            Plan::Inline => {
                tracing::debug!(step = %self.name, "inline text, nothing to upload");
            }
        }
        Ok(Emissions::one(events::UPLOADED))
    }
}

impl Step for UploadStep {
    fn kind(&self) -> &'static str {
        "upload"
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
                "upload" => self.upload(call).await,
                other => Err(unknown_function(&self.name, other)),
            }
        })
    }
}
