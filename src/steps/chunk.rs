use super::{events, unknown_function, DOCUMENT_PARAM};
use crate::error::{PipelineError, Result};
use crate::record::ChunkRecord;
use crate::services::TextSplitter;
use crate::step::{Access, BoxFut, Emissions, RecordField, Step, StepCall, StepFunction};
use std::sync::Arc;

const FUNCTIONS: &[StepFunction] = &[StepFunction {
    name: "chunk",
    parameters: &[DOCUMENT_PARAM],
    access: Access {
        reads: &[RecordField::Content],
        writes: &[RecordField::Chunks],
    },
}];

/// Number segments and assign character offsets.
///
/// The first chunk starts at 0, each chunk ends at `start + chars`, and the
/// next one starts one past the previous end.
pub fn build_chunks<I, S>(segments: I) -> Vec<ChunkRecord>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut start = 0;
    segments
        .into_iter()
        .enumerate()
        .map(|(index, segment)| {
            let chunk = ChunkRecord::new(index, start, segment);
            start = chunk.end + 1;
            chunk
        })
        .collect()
}

/// Splits the content into token-bounded chunks.
pub struct ChunkStep {
    name: String,
    splitter: Arc<dyn TextSplitter>,
    max_tokens: usize,
}

impl ChunkStep {
    pub fn new(name: impl Into<String>, splitter: Arc<dyn TextSplitter>, max_tokens: usize) -> Result<Self> {
        let name = name.into();
        if max_tokens == 0 {
            return Err(PipelineError::Configuration(format!(
                "step '{name}': max tokens per chunk must be at least 1"
            )));
        }
        Ok(Self {
            name,
            splitter,
            max_tokens,
        })
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    async fn chunk(&self, call: StepCall) -> Result<Emissions> {
        let content = call.record.read().await.content().to_string();
        let chunks = build_chunks(self.splitter.split(&content, self.max_tokens).await?);
        tracing::debug!(
            step = %self.name,
            chunks = chunks.len(),
            max_tokens = self.max_tokens,
            "chunked content"
        );
        call.record.write().await.set_chunks(chunks);
        Ok(Emissions::one(events::CHUNKED))
    }
}

impl Step for ChunkStep {
    fn kind(&self) -> &'static str {
        "chunk"
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
                "chunk" => self.chunk(call).await,
                other => Err(unknown_function(&self.name, other)),
            }
        })
    }
}
