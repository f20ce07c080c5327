//! The orchestrator: public operations and the task handler.
//!
//! There is no scheduler. Public operations validate synchronously, start a
//! generation and publish the first task; every later step happens in
//! [`Orchestrator::handle`], which runs one task, applies its report to the
//! progress store and publishes the follow-up work. Any number of workers
//! may call `handle` concurrently, with tasks in any order and delivered
//! more than once.
//!
//! ```text
//! Task ──▶ generation check ──▶ run_stage ──┬─ Ok(report) ──▶ routes, marks,
//!                                ▲  │       │                 page failures,
//!                 transient retry└──┘       │                 settle check
//!                                           └─ Err ──▶ retry path or give up
//! ```

use crate::bus::{MessageBus, RunMode, Stage, Task, Work};
use crate::config::PipelineConfig;
use crate::engine::PdfEngine;
use crate::error::{ErrorClass, PipelineError};
use crate::input;
use crate::model::{Document, DocumentId, DocumentStatus, DocumentUpdate, Permission, UserId};
use crate::modification::{self, ModificationSpec};
use crate::ocr::{MinimumTextPolicy, OcrEngine, TesseractEngine, TextPolicy};
use crate::pagespec;
use crate::paths::ArtifactPaths;
use crate::pipeline::{
    self, convert, is_page_stage, DocumentConverter, LibreOfficeConverter, PipelineContext,
    StageReport,
};
use crate::progress::{NoopProgressCallback, PipelineProgressCallback};
use crate::redaction::{self, RedactionSpec};
use crate::status::{can_transition, StatusTracker};
use crate::store::{
    Counter, DocumentStore, MarkOutcome, MemoryDocumentStore, MemoryObjectStore,
    MemoryProgressStore, ObjectStore, ProgressStore, Remaining,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

/// Error message recorded when a run is cancelled.
pub const CANCELLED_MESSAGE: &str = "Processing was cancelled";

/// Drives documents through the pipeline.
///
/// Cheap to clone; clones share the same stores and engines.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<PipelineContext>,
}

impl Orchestrator {
    pub fn builder(config: PipelineConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.ctx.config
    }

    fn callback(&self) -> &dyn PipelineProgressCallback {
        match &self.ctx.config.progress_callback {
            Some(cb) => cb.as_ref(),
            None => &NoopProgressCallback,
        }
    }

    fn tracker(&self) -> StatusTracker<'_> {
        StatusTracker::new(self.ctx.documents.as_ref())
    }

    // ── Public operations ────────────────────────────────────────────────

    /// Store the original file of a document.
    ///
    /// The document keeps its status; processing starts with
    /// [`Self::trigger_processing`].
    pub async fn upload(
        &self,
        id: DocumentId,
        bytes: Vec<u8>,
        extension: &str,
    ) -> Result<Document, PipelineError> {
        let extension = extension.trim_start_matches('.').to_ascii_lowercase();
        if !convert::is_supported(&extension) {
            return Err(PipelineError::UnsupportedFormat { extension });
        }
        let doc = self.ctx.documents.get(id).await?;
        if doc.status.is_processing() {
            return Err(PipelineError::InvalidState {
                id,
                status: doc.status,
                action: "upload",
            });
        }

        let limit = if extension == "pdf" {
            self.ctx.config.pdf_size_limit
        } else {
            self.ctx.config.document_size_limit
        };
        let size = bytes.len() as u64;
        if size > limit {
            return Err(PipelineError::FileTooLarge { size, limit });
        }

        let paths = ArtifactPaths::for_document(&doc);
        let key = if extension == "pdf" {
            paths.pdf()
        } else {
            paths.original(&extension)
        };
        self.ctx.objects.put(&key, bytes).await?;
        info!("Document {}: stored {} bytes as {}", id, size, key);
        self.ctx
            .documents
            .update(id, DocumentUpdate::default().original_extension(extension))
            .await
    }

    /// Download `url` and store it as the document's original.
    pub async fn fetch_url(&self, id: DocumentId, url: &str) -> Result<Document, PipelineError> {
        let download = input::download(url, self.ctx.config.stage_timeout_secs).await?;
        self.upload(id, download.bytes, &download.extension).await
    }

    /// Start (or restart) processing. Returns the new generation.
    pub async fn trigger_processing(
        &self,
        id: DocumentId,
        force_ocr: bool,
    ) -> Result<u64, PipelineError> {
        let doc = self.ctx.documents.get(id).await?;
        if !can_transition(doc.status, DocumentStatus::Pending) {
            return Err(PipelineError::InvalidState {
                id,
                status: doc.status,
                action: "trigger processing",
            });
        }
        let paths = ArtifactPaths::for_document(&doc);
        let (key, work) = if doc.needs_conversion() {
            (paths.original(&doc.original_extension), Work::Convert)
        } else {
            (paths.pdf(), Work::PageCache)
        };
        if !self.ctx.objects.exists(&key).await? {
            return Err(PipelineError::ArtifactNotFound { key });
        }

        let generation = self.start_run(id, "trigger processing").await?;
        self.ctx
            .bus
            .publish(Task::new(id, generation, RunMode::Full, work).with_force_ocr(force_ocr))
            .await?;
        info!(
            "Document {} gen {}: processing triggered (force_ocr={})",
            id, generation, force_ocr
        );
        Ok(generation)
    }

    /// Cancel the run in flight. Its late tasks are dropped.
    pub async fn cancel_processing(&self, id: DocumentId) -> Result<(), PipelineError> {
        let doc = self.ctx.documents.get(id).await?;
        if !doc.status.is_processing() {
            return Err(PipelineError::InvalidState {
                id,
                status: doc.status,
                action: "cancel processing",
            });
        }
        let cancelled = self.ctx.progress.cancel(id).await?;
        self.tracker().fail(id, CANCELLED_MESSAGE).await?;
        info!("Document {}: cancelled generation {:?}", id, cancelled);
        self.callback()
            .on_document_complete(id, DocumentStatus::Error);
        Ok(())
    }

    /// Validate `spec` and recompose the document. Returns the new generation.
    ///
    /// Nothing is mutated when validation fails.
    pub async fn apply_modification(
        &self,
        id: DocumentId,
        caller: UserId,
        spec: &ModificationSpec,
    ) -> Result<u64, PipelineError> {
        let plan = modification::plan(spec, id, caller, self.ctx.documents.as_ref()).await?;
        let pages = plan.page_count();
        let generation = self.start_run(id, "modify").await?;
        self.ctx
            .bus
            .publish(Task::new(
                id,
                generation,
                RunMode::Modification,
                Work::Modify { plan },
            ))
            .await?;
        info!(
            "Document {} gen {}: modification accepted ({} pages)",
            id, generation, pages
        );
        Ok(generation)
    }

    /// Validate `redactions` and reprocess the pages they touch. Returns the
    /// new generation.
    pub async fn apply_redaction(
        &self,
        id: DocumentId,
        caller: UserId,
        redactions: Vec<RedactionSpec>,
    ) -> Result<u64, PipelineError> {
        let doc = self.ctx.documents.get(id).await?;
        if self.ctx.documents.permission(caller, id).await? < Permission::Edit {
            return Err(PipelineError::PermissionDenied {
                user: caller,
                id,
                action: "redact",
            });
        }
        if !doc.status.is_terminal() {
            return Err(PipelineError::InvalidState {
                id,
                status: doc.status,
                action: "redact",
            });
        }
        let dirty = redaction::validate(&redactions, doc.page_count)?;

        let generation = self.start_run(id, "redact").await?;
        self.ctx
            .bus
            .publish(Task::new(
                id,
                generation,
                RunMode::Redaction,
                Work::Redact { redactions },
            ))
            .await?;
        info!(
            "Document {} gen {}: redaction accepted on pages {:?}",
            id, generation, dirty
        );
        Ok(generation)
    }

    /// Pages still to do in the run in flight.
    pub async fn progress(&self, id: DocumentId) -> Result<Option<Remaining>, PipelineError> {
        self.ctx.progress.remaining(id).await
    }

    async fn start_run(&self, id: DocumentId, action: &'static str) -> Result<u64, PipelineError> {
        let generation = self.ctx.progress.begin_run(id).await?;
        self.tracker()
            .transition(id, DocumentStatus::Pending, action)
            .await?;
        self.callback().on_run_start(id, generation);
        Ok(generation)
    }

    // ── Workers ──────────────────────────────────────────────────────────

    /// Consume tasks until the channel closes, at most `concurrency` at a time.
    pub async fn run(&self, mut rx: mpsc::UnboundedReceiver<Task>) {
        let permits = Arc::new(Semaphore::new(self.ctx.config.concurrency.max(1)));
        while let Some(task) = rx.recv().await {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let this = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let (doc, stage) = (task.doc_id, task.stage());
                if let Err(e) = this.handle(task).await {
                    error!("Document {}: {} task failed: {}", doc, stage, e);
                }
            });
        }
        debug!("Task channel closed, worker loop exiting");
    }

    /// Process one task.
    ///
    /// Tasks of a retired generation are dropped. Errors returned here are
    /// infrastructure failures while applying the result; stage failures are
    /// handled internally.
    pub async fn handle(&self, task: Task) -> Result<(), PipelineError> {
        let current = self.ctx.progress.current_generation(task.doc_id).await?;
        if current != Some(task.generation) {
            debug!(
                "Document {}: dropping {} task of generation {} (current {:?})",
                task.doc_id,
                task.stage(),
                task.generation,
                current
            );
            return Ok(());
        }

        match self.run_with_retries(&task).await {
            Ok(report) => self.apply_report(&task, report).await,
            Err(e) => self.handle_failure(&task, e).await,
        }
    }

    async fn run_with_retries(&self, task: &Task) -> Result<StageReport, PipelineError> {
        let config = &self.ctx.config;
        let secs = config.stage_timeout_secs;
        let mut retry = 0;
        loop {
            let result = match tokio::time::timeout(
                Duration::from_secs(secs),
                pipeline::run_stage(&self.ctx, task),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Timeout {
                    stage: task.stage().name(),
                    secs,
                }),
            };
            match result {
                Err(e) if e.is_transient() && retry < config.transient_retries => {
                    retry += 1;
                    let backoff = config.backoff_ms(retry);
                    warn!(
                        "Document {} {}: transient error, retry {}/{} in {}ms: {}",
                        task.doc_id,
                        task.stage(),
                        retry,
                        config.transient_retries,
                        backoff,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                other => return other,
            }
        }
    }

    // ── Applying results ─────────────────────────────────────────────────

    async fn apply_report(&self, task: &Task, report: StageReport) -> Result<(), PipelineError> {
        let ctx = &self.ctx;
        let stage = task.stage();

        // Follow-up work goes out before the marks: a crash in between only
        // causes duplicate tasks, which the counters absorb.
        for (next, pages) in report.routes {
            self.dispatch(task, next, pages).await?;
        }
        if let Some(count) = report.pages_known {
            self.callback().on_pages_known(task.doc_id, count);
        }

        for (counter, pages) in &report.marks {
            let result = match ctx
                .progress
                .mark(task.doc_id, task.generation, *counter, pages)
                .await?
            {
                MarkOutcome::Stale => {
                    debug!(
                        "Document {}: generation {} retired during {}",
                        task.doc_id, task.generation, stage
                    );
                    return Ok(());
                }
                MarkOutcome::Recorded(result) => result,
            };
            if !result.completed.is_empty() {
                self.tracker().mark_readable(task.doc_id).await?;
            }
            if *counter == Counter::Images && result.remaining == 0 && !result.newly.is_empty() {
                self.store_page_spec(task).await?;
            }
        }

        let failed: Vec<u32> = report.failures.iter().map(|(page, _)| *page).collect();
        let done: Vec<u32> = task
            .work
            .pages()
            .iter()
            .copied()
            .filter(|p| !failed.contains(p))
            .collect();
        self.callback().on_stage_complete(task.doc_id, stage, &done);

        self.page_failures(task, report.failures).await?;

        if stage == Stage::AssembleText {
            return self.finish_run(task).await;
        }
        self.check_settled(task).await
    }

    /// Publish follow-up work for `next`, split into batches for page stages.
    async fn dispatch(&self, task: &Task, next: Stage, pages: Vec<u32>) -> Result<(), PipelineError> {
        if !task.stage().next().contains(&next) {
            return Err(PipelineError::Internal(format!(
                "{} may not route to {}",
                task.stage(),
                next
            )));
        }
        let config = &self.ctx.config;
        let batch = match next {
            Stage::ExtractImages => config.image_batch,
            Stage::Ocr => config.ocr_batch,
            Stage::TextPositions => config.text_position_batch,
            _ => 0,
        };

        let batches: Vec<Vec<u32>> = if is_page_stage(next) {
            pages.chunks(batch.max(1)).map(<[u32]>::to_vec).collect()
        } else {
            vec![Vec::new()]
        };
        for pages in batches {
            let work = Work::for_pages(next, pages).ok_or_else(|| {
                PipelineError::Internal(format!("{} takes no routed work", next))
            })?;
            self.ctx.bus.publish(task.follow_up(work)).await?;
        }
        debug!(
            "Document {} gen {}: {} → {}",
            task.doc_id,
            task.generation,
            task.stage(),
            next
        );
        Ok(())
    }

    /// Give up on or retry the pages a stage reported as failed.
    async fn page_failures(
        &self,
        task: &Task,
        failures: Vec<(u32, PipelineError)>,
    ) -> Result<(), PipelineError> {
        if failures.is_empty() {
            return Ok(());
        }
        let max_attempts = self.ctx.config.max_attempts;
        let mut retry = Vec::new();
        for (page, e) in failures {
            if e.class() == ErrorClass::Permanent || task.attempt + 1 >= max_attempts {
                self.give_up(task, &[page], &e).await?;
            } else {
                warn!(
                    "Document {} {}: page {} failed on attempt {}/{}: {}",
                    task.doc_id,
                    task.stage(),
                    page + 1,
                    task.attempt + 1,
                    max_attempts,
                    e
                );
                retry.push(page);
            }
        }
        if !retry.is_empty() {
            self.ctx
                .bus
                .publish(task.retry(task.work.with_pages(retry)))
                .await?;
        }
        Ok(())
    }

    /// Mark `pages` failed and record one error per page.
    async fn give_up(
        &self,
        task: &Task,
        pages: &[u32],
        e: &PipelineError,
    ) -> Result<(), PipelineError> {
        let ctx = &self.ctx;
        let Some(newly) = ctx
            .progress
            .mark_failed(task.doc_id, task.generation, pages)
            .await?
        else {
            return Ok(());
        };
        for page in &newly {
            let message = format!("Page {}: {}", page + 1, e);
            error!("Document {} {}: {}", task.doc_id, task.stage(), message);
            ctx.documents.append_error(task.doc_id, &message).await?;
            self.callback().on_page_error(task.doc_id, *page, &message);
        }

        if !newly.is_empty() {
            if let Some(remaining) = ctx.progress.remaining(task.doc_id).await? {
                if remaining.images == 0 {
                    self.store_page_spec(task).await?;
                }
            }
        }
        Ok(())
    }

    /// Whole-task failure.
    async fn handle_failure(&self, task: &Task, e: PipelineError) -> Result<(), PipelineError> {
        let stage = task.stage();
        let max_attempts = self.ctx.config.max_attempts;
        let exhausted = matches!(e.class(), ErrorClass::Permanent | ErrorClass::Validation)
            || task.attempt + 1 >= max_attempts;

        if !exhausted {
            warn!(
                "Document {} {}: attempt {}/{} failed, re-dispatching: {}",
                task.doc_id,
                stage,
                task.attempt + 1,
                max_attempts,
                e
            );
            return self.ctx.bus.publish(task.retry(task.work.clone())).await;
        }

        if stage.is_document_scoped() {
            return self.fail_document(task, &e).await;
        }
        let pages = match primary_counter(stage) {
            Some(counter) => {
                self.ctx
                    .progress
                    .unmarked(task.doc_id, task.generation, counter, task.work.pages())
                    .await?
            }
            None => task.work.pages().to_vec(),
        };
        self.give_up(task, &pages, &e).await?;
        self.check_settled(task).await
    }

    async fn fail_document(&self, task: &Task, e: &PipelineError) -> Result<(), PipelineError> {
        if !self
            .ctx
            .progress
            .end_run(task.doc_id, task.generation)
            .await?
        {
            debug!(
                "Document {}: generation {} already retired, not failing",
                task.doc_id, task.generation
            );
            return Ok(());
        }
        let message = format!("{} failed: {}", task.stage(), e);
        error!("Document {}: {}", task.doc_id, message);
        self.tracker().fail(task.doc_id, &message).await?;
        self.callback()
            .on_document_complete(task.doc_id, DocumentStatus::Error);
        Ok(())
    }

    /// Dispatch assembly once every counter has settled. Exactly one task per
    /// generation wins the claim.
    async fn check_settled(&self, task: &Task) -> Result<(), PipelineError> {
        let ctx = &self.ctx;
        if ctx.progress.current_generation(task.doc_id).await? != Some(task.generation) {
            return Ok(());
        }
        let Some(remaining) = ctx.progress.remaining(task.doc_id).await? else {
            return Ok(());
        };
        if !remaining.is_settled() {
            return Ok(());
        }
        if ctx
            .progress
            .claim_assembly(task.doc_id, task.generation)
            .await?
        {
            debug!(
                "Document {} gen {}: all pages accounted, assembling",
                task.doc_id, task.generation
            );
            ctx.bus.publish(task.follow_up(Work::AssembleText)).await?;
        }
        Ok(())
    }

    async fn finish_run(&self, task: &Task) -> Result<(), PipelineError> {
        let ctx = &self.ctx;
        let failed = ctx
            .progress
            .failed_pages(task.doc_id, task.generation)
            .await?;
        if !ctx.progress.end_run(task.doc_id, task.generation).await? {
            debug!(
                "Document {}: generation {} retired before it finished",
                task.doc_id, task.generation
            );
            return Ok(());
        }
        let status = self.tracker().finish(task.doc_id, !failed.is_empty()).await?;
        info!(
            "Document {} gen {}: finished as {} ({} failed pages)",
            task.doc_id,
            task.generation,
            status,
            failed.len()
        );
        self.callback().on_document_complete(task.doc_id, status);
        Ok(())
    }

    /// Encode the run's page dimensions into the document's page spec.
    async fn store_page_spec(&self, task: &Task) -> Result<(), PipelineError> {
        if task.mode == RunMode::Redaction {
            return Ok(());
        }
        let ctx = &self.ctx;
        let dimensions = ctx
            .progress
            .dimensions(task.doc_id, task.generation)
            .await?;
        let doc = ctx.documents.get(task.doc_id).await?;
        if dimensions.len() != doc.page_count as usize {
            debug!(
                "Document {}: {} of {} page dimensions known, page spec not stored",
                doc.id,
                dimensions.len(),
                doc.page_count
            );
            return Ok(());
        }
        let spec = pagespec::encode(&dimensions);
        debug!("Document {}: page spec {}", doc.id, spec);
        ctx.documents
            .update(doc.id, DocumentUpdate::default().page_spec(spec))
            .await?;
        Ok(())
    }
}

// ── Builder ──────────────────────────────────────────────────────────────

/// Assembles an [`Orchestrator`] from its collaborators.
///
/// Only the bus is required. Stores default to the in-memory ones, OCR to
/// tesseract, conversion to LibreOffice and, with the `pdfium` feature, the
/// PDF engine to pdfium.
pub struct OrchestratorBuilder {
    config: PipelineConfig,
    objects: Option<Arc<dyn ObjectStore>>,
    documents: Option<Arc<dyn DocumentStore>>,
    progress: Option<Arc<dyn ProgressStore>>,
    bus: Option<Arc<dyn MessageBus>>,
    engine: Option<Arc<dyn PdfEngine>>,
    ocr: Option<Arc<dyn OcrEngine>>,
    converter: Option<Arc<dyn DocumentConverter>>,
    text_policy: Option<Arc<dyn TextPolicy>>,
}

impl OrchestratorBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            objects: None,
            documents: None,
            progress: None,
            bus: None,
            engine: None,
            ocr: None,
            converter: None,
            text_policy: None,
        }
    }

    pub fn objects(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    pub fn documents(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(documents);
        self
    }

    pub fn progress(mut self, progress: Arc<dyn ProgressStore>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn PdfEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    pub fn converter(mut self, converter: Arc<dyn DocumentConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Decides whether a page's embedded text is good enough to skip OCR.
    pub fn text_policy(mut self, policy: Arc<dyn TextPolicy>) -> Self {
        self.text_policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<Orchestrator, PipelineError> {
        let bus = self
            .bus
            .ok_or_else(|| PipelineError::InvalidConfig("a message bus is required".into()))?;
        let engine = match self.engine {
            Some(engine) => engine,
            None => default_engine()?,
        };
        let ocr = self.ocr.unwrap_or_else(|| {
            Arc::new(TesseractEngine::new(
                "tesseract",
                self.config.ocr_version.clone(),
            ))
        });
        let text_policy = self
            .text_policy
            .unwrap_or_else(|| Arc::new(MinimumTextPolicy::new(self.config.min_text_chars)));

        let ctx = PipelineContext {
            objects: self
                .objects
                .unwrap_or_else(|| Arc::new(MemoryObjectStore::new())),
            documents: self
                .documents
                .unwrap_or_else(|| Arc::new(MemoryDocumentStore::new())),
            progress: self
                .progress
                .unwrap_or_else(|| Arc::new(MemoryProgressStore::new())),
            bus,
            engine,
            ocr,
            converter: self
                .converter
                .unwrap_or_else(|| Arc::new(LibreOfficeConverter::default())),
            text_policy,
            config: self.config,
        };
        Ok(Orchestrator { ctx: Arc::new(ctx) })
    }
}

/// The counter a page stage accounts its pages on.
fn primary_counter(stage: Stage) -> Option<Counter> {
    match stage {
        Stage::ExtractImages => Some(Counter::Images),
        Stage::Ocr => Some(Counter::Texts),
        Stage::TextPositions => Some(Counter::Positions),
        _ => None,
    }
}

#[cfg(feature = "pdfium")]
fn default_engine() -> Result<Arc<dyn PdfEngine>, PipelineError> {
    Ok(Arc::new(crate::engine::PdfiumEngine::from_env()))
}

#[cfg(not(feature = "pdfium"))]
fn default_engine() -> Result<Arc<dyn PdfEngine>, PipelineError> {
    Err(PipelineError::InvalidConfig(
        "no PDF engine configured; enable the `pdfium` feature or supply one".into(),
    ))
}
