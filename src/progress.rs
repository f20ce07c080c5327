//! Progress-callback trait for pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to observe a
//! document as it moves through the stages. Events for different documents
//! and batches may arrive concurrently and in any order.
//!
//! # Example
//!
//! ```rust
//! use docflow::{PipelineConfig, PipelineProgressCallback, Stage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct OcrCounter {
//!     pages: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for OcrCounter {
//!     fn on_stage_complete(&self, _doc_id: u64, stage: Stage, pages: &[u32]) {
//!         if stage == Stage::Ocr {
//!             self.pages.fetch_add(pages.len(), Ordering::SeqCst);
//!         }
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(OcrCounter { pages: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::bus::Stage;
use crate::model::{DocumentId, DocumentStatus};
use std::sync::Arc;

/// Called by the orchestrator as tasks complete.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait PipelineProgressCallback: Send + Sync {
    /// A new processing generation started.
    fn on_run_start(&self, doc_id: DocumentId, generation: u64) {
        let _ = (doc_id, generation);
    }

    /// The page cache determined how many pages the run covers.
    fn on_pages_known(&self, doc_id: DocumentId, page_count: u32) {
        let _ = (doc_id, page_count);
    }

    /// A stage finished for the given pages (empty for document-wide stages).
    fn on_stage_complete(&self, doc_id: DocumentId, stage: Stage, pages: &[u32]) {
        let _ = (doc_id, stage, pages);
    }

    /// A page was given up on.
    fn on_page_error(&self, doc_id: DocumentId, page: u32, error: &str) {
        let _ = (doc_id, page, error);
    }

    /// The run ended in `success` or `error`.
    fn on_document_complete(&self, doc_id: DocumentId, status: DocumentStatus) {
        let _ = (doc_id, status);
    }
}

/// A no-op implementation, the default when no callback is configured.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
