//! Pipeline stages.
//!
//! Each submodule implements one stage as an async function over a
//! [`PipelineContext`] and a [`Task`]. Stages never call each other: they
//! return a [`StageReport`] naming the pages they accounted, the follow-up
//! work they want, and the pages they failed on. The orchestrator turns that
//! report into counter updates and new tasks.
//!
//! ```text
//! convert ─▶ page_cache ─▶ extract ─┬─▶ ocr ─▶ positions ─▶ assemble
//!               ▲                   └────────▶ positions
//! modify ───────┤
//! redact ───────┘
//! ```

pub mod assemble;
pub mod convert;
pub mod extract;
pub mod modify;
pub mod ocr;
pub mod page_cache;
pub mod positions;
pub mod redact;

pub use convert::{DocumentConverter, LibreOfficeConverter};

use crate::bus::{MessageBus, Stage, Task, Work};
use crate::config::PipelineConfig;
use crate::engine::PdfEngine;
use crate::error::PipelineError;
use crate::ocr::{OcrEngine, TextPolicy};
use crate::paths::ArtifactPaths;
use crate::store::{Counter, DocumentStore, ObjectStore, ProgressStore};
use std::sync::Arc;
use tracing::warn;

/// Everything a stage may touch.
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub objects: Arc<dyn ObjectStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub progress: Arc<dyn ProgressStore>,
    pub bus: Arc<dyn MessageBus>,
    pub engine: Arc<dyn PdfEngine>,
    pub ocr: Arc<dyn OcrEngine>,
    pub converter: Arc<dyn DocumentConverter>,
    pub text_policy: Arc<dyn TextPolicy>,
}

/// What a stage invocation produced.
#[derive(Debug, Default)]
pub struct StageReport {
    /// Pages to account, per counter.
    pub marks: Vec<(Counter, Vec<u32>)>,
    /// Follow-up work, per stage.
    pub routes: Vec<(Stage, Vec<u32>)>,
    /// Pages this invocation failed on. The rest of the task succeeded.
    pub failures: Vec<(u32, PipelineError)>,
    /// Set by the page cache once the page count is known.
    pub pages_known: Option<u32>,
}

impl StageReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(mut self, counter: Counter, pages: Vec<u32>) -> Self {
        if !pages.is_empty() {
            self.marks.push((counter, pages));
        }
        self
    }

    /// Route `pages` to `stage`. Document-wide stages take an empty list.
    pub fn route(mut self, stage: Stage, pages: Vec<u32>) -> Self {
        if !pages.is_empty() || !is_page_stage(stage) {
            self.routes.push((stage, pages));
        }
        self
    }

    pub fn fail(mut self, page: u32, error: PipelineError) -> Self {
        self.failures.push((page, error));
        self
    }
}

/// Stages whose tasks carry a page batch.
pub fn is_page_stage(stage: Stage) -> bool {
    matches!(
        stage,
        Stage::ExtractImages | Stage::Ocr | Stage::TextPositions
    )
}

/// Run the stage named by `task`.
pub async fn run_stage(ctx: &PipelineContext, task: &Task) -> Result<StageReport, PipelineError> {
    match &task.work {
        Work::Convert => convert::run(ctx, task).await,
        Work::PageCache => page_cache::run(ctx, task).await,
        Work::ExtractImages { pages } => extract::run(ctx, task, pages).await,
        Work::Ocr { pages } => ocr::run(ctx, task, pages).await,
        Work::TextPositions { pages } => positions::run(ctx, task, pages).await,
        Work::AssembleText => assemble::run(ctx, task).await,
        Work::Modify { plan } => modify::run(ctx, task, plan).await,
        Work::Redact { redactions } => redact::run(ctx, task, redactions).await,
    }
}

/// Run CPU-bound engine work on the blocking pool.
pub(crate) async fn blocking<T, F>(what: &str, f: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PipelineError::Internal(format!("{} task panicked: {}", what, e)))?
}

/// Remove a run's staged rewrite once it is live. Leftovers are harmless, so
/// failures are only logged.
pub(crate) async fn discard_staging(ctx: &PipelineContext, paths: &ArtifactPaths, generation: u64) {
    let keys = match ctx.objects.list(&paths.staging_prefix(generation)).await {
        Ok(keys) => keys,
        Err(e) => {
            warn!("Failed to list staging for generation {}: {}", generation, e);
            return;
        }
    };
    for key in keys {
        if let Err(e) = ctx.objects.delete(&key).await {
            warn!("Failed to delete staged {}: {}", key, e);
        }
    }
}

/// Attach the page number to an error raised without one.
pub(crate) fn on_page(error: PipelineError, page: u32) -> PipelineError {
    match error {
        PipelineError::OcrFailed { detail, .. } => PipelineError::OcrFailed { page, detail },
        PipelineError::RenderFailed { detail, .. } => PipelineError::RenderFailed { page, detail },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_page_routes_are_dropped() {
        let report = StageReport::new()
            .route(Stage::Ocr, vec![])
            .route(Stage::TextPositions, vec![1])
            .route(Stage::PageCache, vec![])
            .mark(Counter::Images, vec![]);
        assert_eq!(
            report.routes,
            vec![(Stage::TextPositions, vec![1]), (Stage::PageCache, vec![])]
        );
        assert!(report.marks.is_empty());
    }

    #[test]
    fn page_number_is_attached() {
        let e = on_page(
            PipelineError::OcrFailed {
                page: 0,
                detail: "x".into(),
            },
            7,
        );
        assert!(matches!(e, PipelineError::OcrFailed { page: 7, .. }));
    }
}
