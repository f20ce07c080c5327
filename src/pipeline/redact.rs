//! Redaction: flatten the redacted pages and send only them back through
//! the pipeline.
//!
//! The flattened PDF and the trimmed text file are staged under the run's
//! generation before any live artifact changes. The live PDF is replaced
//! last, so a retry after a partial write flattens nothing twice.

use super::{blocking, discard_staging, PipelineContext, StageReport};
use crate::bus::{Stage, Task};
use crate::error::PipelineError;
use crate::model::TextFile;
use crate::paths::ArtifactPaths;
use crate::redaction::RedactionSpec;
use crate::store::{get_json, put_json, PagePlan};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Text that survives the redaction, `None` when the document had none.
#[derive(Debug, Serialize, Deserialize)]
struct StagedRedaction {
    text: Option<TextFile>,
}

async fn stage(
    ctx: &PipelineContext,
    paths: &ArtifactPaths,
    generation: u64,
    redactions: &[RedactionSpec],
    dirty: &BTreeSet<u32>,
) -> Result<StagedRedaction, PipelineError> {
    let pdf = ctx.objects.get(&paths.pdf()).await?;
    let text = match get_json::<TextFile>(ctx.objects.as_ref(), &paths.text_json()).await {
        Ok(mut text) => {
            text.pages.retain(|p| !dirty.contains(&p.page));
            Some(text)
        }
        Err(PipelineError::ArtifactNotFound { .. }) => None,
        Err(e) => return Err(e),
    };

    let engine = ctx.engine.clone();
    let width = ctx.config.largest_size().width;
    let owned = redactions.to_vec();
    let flattened = blocking("Redaction", move || {
        engine.flatten_redactions(&pdf, &owned, width)
    })
    .await?;

    let staged = StagedRedaction { text };
    ctx.objects
        .put(&paths.staged_pdf(generation), flattened)
        .await?;
    put_json(ctx.objects.as_ref(), &paths.staged_manifest(generation), &staged).await?;
    Ok(staged)
}

pub async fn run(
    ctx: &PipelineContext,
    task: &Task,
    redactions: &[RedactionSpec],
) -> Result<StageReport, PipelineError> {
    if ctx
        .progress
        .is_initialized(task.doc_id, task.generation)
        .await?
    {
        debug!("Document {}: redaction already applied", task.doc_id);
        return Ok(StageReport::new().route(Stage::PageCache, Vec::new()));
    }

    let doc = ctx.documents.get(task.doc_id).await?;
    let paths = ArtifactPaths::for_document(&doc);
    let generation = task.generation;
    let dirty: BTreeSet<u32> = redactions.iter().map(|r| r.page_number).collect();

    let staged: StagedRedaction = if ctx.progress.is_staged(doc.id, generation).await? {
        debug!(
            "Document {}: resuming staged redaction of generation {}",
            doc.id, generation
        );
        get_json(ctx.objects.as_ref(), &paths.staged_manifest(generation)).await?
    } else {
        let staged = stage(ctx, &paths, generation, redactions, &dirty).await?;
        if !ctx.progress.mark_staged(doc.id, generation).await? {
            debug!("Document {}: generation {} retired while staging", doc.id, generation);
            return Ok(StageReport::new());
        }
        staged
    };

    for &page in &dirty {
        ctx.objects.delete(&paths.page_text(page)).await?;
        ctx.objects.delete(&paths.page_positions(page)).await?;
    }
    if let Some(text) = &staged.text {
        put_json(ctx.objects.as_ref(), &paths.text_json(), text).await?;
        ctx.objects
            .put(&paths.text(), text.concatenated().into_bytes())
            .await?;
    }
    let flattened = ctx.objects.get(&paths.staged_pdf(generation)).await?;
    ctx.objects.put(&paths.pdf(), flattened).await?;

    ctx.progress
        .init_pages(
            doc.id,
            generation,
            doc.page_count,
            PagePlan::Only(dirty.clone()),
        )
        .await?;
    discard_staging(ctx, &paths, generation).await;

    info!(
        "Document {}: redacted {} rectangle(s) on pages {:?}",
        doc.id,
        redactions.len(),
        dirty
    );
    Ok(StageReport::new().route(Stage::PageCache, Vec::new()))
}
