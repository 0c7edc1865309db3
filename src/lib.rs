//! # Ingest Pipeline
//!
//! Event-routed pipelines that take a document from upload to a vector
//! index: store it, log the action, read it as text, split it into chunks,
//! tag it, compose metadata, and upsert every chunk.
//!
//! A pipeline is a fixed graph of **steps** wired together by **events**.
//! Each step exposes named functions; when a step emits an event, every
//! function bound to that event runs next. All steps of a run share one
//! [`StepRecord`], and a run ends when no binding is left to fire or when
//! any step fails.
//!
//! ## Core Concepts
//!
//! - **[`Step`]**: object-safe unit of work. Declares its functions and the
//!   record fields they read and write, and returns the events it emits.
//! - **[`PipelineBuilder`]**: registers steps and routes events to them.
//!   `build()` rejects unroutable or ambiguous graphs before any run.
//! - **[`Pipeline`]**: immutable and cheap to clone. `run()` drives one
//!   record to a [`RunOutcome`]; `start()` returns a cancellable [`RunHandle`].
//! - **[`services`]**: the collaborators the built-in steps talk to (blob
//!   storage, vector index, history, splitter, tagger, readers), with
//!   in-memory and filesystem implementations.
//! - **[`presets`]**: the standard ingestion graphs.
//!
//! ## Quick Start
//!
//! ```no_run
//! use ingest_pipeline::presets::{upload_and_index, IngestServices};
//! use ingest_pipeline::services::{MemoryBlobStorage, MemoryHistory, MemoryVectorIndex};
//! use ingest_pipeline::steps::events;
//! use ingest_pipeline::{DocumentSource, IngestConfig, StepRecord};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let services = IngestServices::new(
//!         Arc::new(MemoryBlobStorage::new()),
//!         Arc::new(MemoryVectorIndex::new()),
//!         Arc::new(MemoryHistory::new()),
//!     );
//!     let pipeline = upload_and_index(&IngestConfig::default(), &services)?;
//!
//!     let record = StepRecord::new(
//!         "conversation-1",
//!         "session-1",
//!         "report-2024",
//!         DocumentSource::upload("report.txt", b"Quarterly revenue grew".to_vec()),
//!     )?;
//!     let outcome = pipeline.run(events::START_PROCESS, record).await;
//!     let record = outcome.into_result()?;
//!     println!("{} chunks indexed", record.chunks().len());
//!     Ok(())
//! }
//! ```
//!
//! ## Custom Graphs
//!
//! ```no_run
//! use ingest_pipeline::services::{MemoryVectorIndex, ReaderRegistry, WhitespaceSplitter};
//! use ingest_pipeline::steps::{events, ChunkStep, IndexStep, ReadStep, DOCUMENT_PARAM};
//! use ingest_pipeline::Pipeline;
//! use std::sync::Arc;
//!
//! # fn main() -> ingest_pipeline::Result<()> {
//! let mut builder = Pipeline::declare("read_and_index");
//! let read = builder.add_step(ReadStep::new("read", ReaderRegistry::with_defaults()));
//! let chunk = builder.add_step(ChunkStep::new("chunk", Arc::new(WhitespaceSplitter), 200)?);
//! let index = builder.add_step(IndexStep::new("index", Arc::new(MemoryVectorIndex::new())));
//!
//! builder.on_entry_event(events::START_PROCESS).send_to(read, "read", DOCUMENT_PARAM);
//! builder.on_event(read, events::READED).send_to(chunk, "chunk", DOCUMENT_PARAM);
//! builder.on_event(chunk, events::CHUNKED).send_to(index, "index", DOCUMENT_PARAM);
//! let pipeline = builder.build()?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod graph;
pub mod observer;
pub mod pipeline;
pub mod presets;
pub mod record;
pub mod services;
pub mod step;
pub mod steps;

pub use backend::{BackoffConfig, CompletionBackend, MockCompletion, OllamaCompletion};
pub use config::{IngestConfig, TaggingConfig};
pub use error::{PipelineError, Result};
pub use graph::{EventBus, StepHandle};
pub use observer::{FnObserver, RunEvent, RunObserver};
pub use pipeline::{Pipeline, PipelineBuilder, RunHandle, RunOutcome, RunState};
pub use record::{ChunkRecord, DocumentFormat, DocumentSource, StepRecord};
pub use step::{Access, BoxFut, Emissions, Event, RecordField, Step, StepCall, StepFunction};
