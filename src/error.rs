use std::time::Duration;
use thiserror::Error;

/// Errors produced by pipelines, steps, and collaborator services.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Invalid pipeline wiring detected while declaring or starting a pipeline.
    #[error("Invalid pipeline configuration: {0}")]
    Configuration(String),

    /// A step function failed. Wraps the originating error with the
    /// identity of the step and function that raised it.
    #[error("Step '{step}' failed in '{function}': {source}")]
    StepExecution {
        step: String,
        function: String,
        #[source]
        source: Box<PipelineError>,
    },

    /// The read step was given a source whose format has no registered reader.
    #[error("Step '{step}' has no reader registered for format '{format}'")]
    UnsupportedFormat { step: String, format: String },

    /// A step record was constructed with missing identity fields.
    #[error("Invalid step record: {0}")]
    InvalidRecord(String),

    /// Blob storage rejected or failed an operation.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The vector index rejected or failed an upsert.
    #[error("Index error: {0}")]
    Index(String),

    /// A document reader could not extract text.
    #[error("Reader error: {0}")]
    Reader(String),

    /// The tag generator produced no usable tags.
    #[error("Tag generation failed: {0}")]
    TagGeneration(String),

    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON (de)serialization failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem failure in a file-backed collaborator.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// The run was cancelled through its [`RunHandle`](crate::pipeline::RunHandle).
    #[error("Pipeline run was cancelled")]
    Cancelled,

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Wrap an error raised inside `step::function` as a step execution failure.
    ///
    /// Errors that already carry step identity, cancellation, and
    /// configuration errors pass through unchanged.
    pub fn in_step(self, step: &str, function: &str) -> Self {
        match self {
            e @ (PipelineError::StepExecution { .. }
            | PipelineError::UnsupportedFormat { .. }
            | PipelineError::Configuration(_)
            | PipelineError::Cancelled) => e,
            other => PipelineError::StepExecution {
                step: step.to_string(),
                function: function.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through step execution wrappers.
    pub fn root_cause(&self) -> &PipelineError {
        match self {
            PipelineError::StepExecution { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self.root_cause(), PipelineError::Configuration(_))
    }

    pub fn is_unsupported_format(&self) -> bool {
        matches!(self.root_cause(), PipelineError::UnsupportedFormat { .. })
    }

    /// Name of the step that failed, if the error carries one.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            PipelineError::StepExecution { step, .. }
            | PipelineError::UnsupportedFormat { step, .. } => Some(step),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
