//! # docflow
//!
//! Message-driven document processing: turn uploaded files into page
//! images, per-page text and per-word positions, then keep those artifacts
//! consistent while pages are recomposed or redacted.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload
//!  │
//!  ├─ 1. Convert        office formats → PDF (LibreOffice)
//!  ├─ 2. PageCache      page count, file hash, page counters
//!  ├─ 3. ExtractImages  render every size class; embedded text or OCR?
//!  ├─ 4. Ocr            tesseract / VLM, batch-scoped, concurrent
//!  ├─ 5. TextPositions  per-word boxes as page fractions
//!  └─ 6. AssembleText   document text in page order, final status
//!
//! modify ─┐
//! redact ─┴─▶ PageCache …   (same stages, fewer pages)
//! ```
//!
//! Each stage is a stateless task on a [`MessageBus`]. Progress lives in a
//! [`store::ProgressStore`] as per-page counters keyed by document and
//! generation, so tasks may complete in any order, be delivered twice, or
//! arrive after their run was cancelled without corrupting the result.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docflow::store::MemoryDocumentStore;
//! use docflow::{ChannelBus, Document, Orchestrator, PipelineConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let documents = Arc::new(MemoryDocumentStore::new());
//!     documents.insert(Document::new(1, "report", 1))?;
//!
//!     let (bus, rx) = ChannelBus::new();
//!     let orchestrator = Orchestrator::builder(PipelineConfig::default())
//!         .bus(Arc::new(bus))
//!         .documents(documents)
//!         .build()?;
//!
//!     let worker = orchestrator.clone();
//!     tokio::spawn(async move { worker.run(rx).await });
//!
//!     orchestrator
//!         .upload(1, std::fs::read("report.pdf")?, "pdf")
//!         .await?;
//!     orchestrator.trigger_processing(1, false).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `pdfium` | on      | [`engine::PdfiumEngine`], the real PDF backend |
//! | `cli`    | on      | Enables the `docflow` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Without `pdfium`, supply your own [`engine::PdfEngine`] to the builder.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod input;
pub mod model;
pub mod modification;
pub mod ocr;
pub mod orchestrator;
pub mod page_range;
pub mod pagespec;
pub mod paths;
pub mod pipeline;
pub mod progress;
pub mod redaction;
pub mod status;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use bus::{ChannelBus, MessageBus, QueueBus, RunMode, Stage, Task, Work};
pub use config::{PageImageFormat, PipelineConfig, PipelineConfigBuilder, SizeClass};
pub use error::{ErrorClass, PipelineError};
pub use model::{
    Access, Annotation, AnnotationKind, Bounds, Document, DocumentId, DocumentStatus,
    ErrorRecord, PageText, Permission, TextFile, UserId, Word,
};
pub use modification::ModificationSpec;
pub use orchestrator::{Orchestrator, OrchestratorBuilder, CANCELLED_MESSAGE};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use redaction::RedactionSpec;
pub use store::Remaining;
