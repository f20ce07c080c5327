//! Page cache: open the canonical PDF, count pages and start the counters.

use super::{blocking, convert::is_pdf, PipelineContext, StageReport};
use crate::bus::{RunMode, Stage, Task};
use crate::error::PipelineError;
use crate::model::DocumentUpdate;
use crate::paths::ArtifactPaths;
use crate::store::{Counter, PagePlan};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

pub async fn run(ctx: &PipelineContext, task: &Task) -> Result<StageReport, PipelineError> {
    let doc = ctx.documents.get(task.doc_id).await?;
    let key = ArtifactPaths::for_document(&doc).pdf();

    let size = ctx.objects.size(&key).await?;
    if size > ctx.config.pdf_size_limit {
        return Err(PipelineError::FileTooLarge {
            size,
            limit: ctx.config.pdf_size_limit,
        });
    }
    let pdf = ctx.objects.get(&key).await?;
    if !is_pdf(&pdf) {
        return Err(PipelineError::CorruptPdf("missing %PDF header".to_string()));
    }
    let file_hash = hex::encode(Sha256::digest(&pdf));

    let engine = ctx.engine.clone();
    let page_count = blocking("Page count", move || {
        let mut count = 0;
        engine.with_document(&pdf, &mut |pages| {
            count = pages.page_count();
            Ok(())
        })?;
        Ok(count)
    })
    .await?;
    if page_count == 0 {
        return Err(PipelineError::CorruptPdf("document has no pages".to_string()));
    }

    let mut report = StageReport::new();
    match task.mode {
        RunMode::Full => {
            ctx.documents
                .update(
                    doc.id,
                    DocumentUpdate::default()
                        .page_count(page_count)
                        .file_hash(file_hash),
                )
                .await?;
            if ctx
                .progress
                .init_pages(doc.id, task.generation, page_count, PagePlan::Full)
                .await?
            {
                info!(
                    "Document {} gen {}: {} pages",
                    doc.id, task.generation, page_count
                );
                report.pages_known = Some(page_count);
            } else {
                debug!("Document {}: counters already initialised", doc.id);
            }
        }
        RunMode::Modification | RunMode::Redaction => {
            if page_count != doc.page_count {
                return Err(PipelineError::CorruptPdf(format!(
                    "expected {} pages, found {}",
                    doc.page_count, page_count
                )));
            }
            ctx.documents
                .update(doc.id, DocumentUpdate::default().file_hash(file_hash))
                .await?;
        }
    }

    let all: Vec<u32> = (0..page_count).collect();
    let pending = ctx
        .progress
        .unmarked(doc.id, task.generation, Counter::Images, &all)
        .await?;
    debug!(
        "Document {}: {} pages need images",
        doc.id,
        pending.len()
    );
    Ok(report.route(Stage::ExtractImages, pending))
}
