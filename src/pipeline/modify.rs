//! Modification: recompose a document's pages and carry its text over.
//!
//! Every read and the compose happen before the first write. The composed
//! PDF and the carried text are staged under the run's generation and a
//! checkpoint is recorded before any live artifact changes, so a retry after
//! a partial write resumes from the staged rewrite instead of recomposing the
//! half-written document. The live PDF is replaced last. Text and word
//! positions are copied from the source pages, positions rotated with the
//! page; only the images are regenerated downstream.

use super::{blocking, discard_staging, PipelineContext, StageReport};
use crate::bus::{Stage, Task};
use crate::engine::ComposePage;
use crate::error::PipelineError;
use crate::model::{now_millis, Annotation, DocumentId, DocumentUpdate, PageText, TextFile, Word};
use crate::modification::{remap_annotations, ModificationPlan};
use crate::paths::ArtifactPaths;
use crate::store::{get_json, put_json, ObjectStore, PagePlan};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Source material loaded for one document of the plan.
struct Source {
    pdf: Vec<u8>,
    text: TextFile,
    words: HashMap<u32, Vec<Word>>,
}

/// Everything the write phase needs besides the composed PDF.
#[derive(Debug, Serialize, Deserialize)]
struct StagedModification {
    previous_count: u32,
    sources: usize,
    texts: Vec<PageText>,
    positions: Vec<Vec<Word>>,
    annotations: Vec<Annotation>,
}

async fn text_file(objects: &dyn ObjectStore, key: &str) -> Result<TextFile, PipelineError> {
    match get_json(objects, key).await {
        Ok(text) => Ok(text),
        Err(PipelineError::ArtifactNotFound { .. }) => Ok(TextFile::default()),
        Err(e) => Err(e),
    }
}

async fn page_words(objects: &dyn ObjectStore, key: &str) -> Result<Vec<Word>, PipelineError> {
    match get_json(objects, key).await {
        Ok(words) => Ok(words),
        Err(PipelineError::ArtifactNotFound { .. }) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Read every source, compose, and stage the result. Touches no live
/// artifact of the target.
async fn stage(
    ctx: &PipelineContext,
    plan: &ModificationPlan,
    previous_count: u32,
    target_paths: &ArtifactPaths,
    generation: u64,
) -> Result<StagedModification, PipelineError> {
    let order: Vec<DocumentId> = plan.sources().into_iter().collect();
    let mut wanted: BTreeMap<DocumentId, Vec<u32>> = BTreeMap::new();
    for p in &plan.pages {
        wanted.entry(p.source).or_default().push(p.source_page);
    }

    let mut sources: BTreeMap<DocumentId, Source> = BTreeMap::new();
    let mut annotations: BTreeMap<DocumentId, Vec<Annotation>> = BTreeMap::new();
    for &id in &order {
        let doc = ctx.documents.get(id).await?;
        let paths = ArtifactPaths::for_document(&doc);
        let mut words = HashMap::new();
        for &page in wanted.get(&id).map(Vec::as_slice).unwrap_or_default() {
            if !words.contains_key(&page) {
                words.insert(
                    page,
                    page_words(ctx.objects.as_ref(), &paths.page_positions(page)).await?,
                );
            }
        }
        sources.insert(
            id,
            Source {
                pdf: ctx.objects.get(&paths.pdf()).await?,
                text: text_file(ctx.objects.as_ref(), &paths.text_json()).await?,
                words,
            },
        );
        annotations.insert(id, ctx.documents.annotations(id).await?);
    }
    if !annotations.contains_key(&plan.target) {
        annotations.insert(plan.target, ctx.documents.annotations(plan.target).await?);
    }

    let compose: Vec<ComposePage> = plan
        .pages
        .iter()
        .map(|p| ComposePage {
            source: order.iter().position(|&id| id == p.source).unwrap_or(0),
            page: p.source_page,
            quarter_turns: p.quarter_turns,
        })
        .collect();
    let pdfs: Vec<Vec<u8>> = order
        .iter()
        .map(|id| {
            sources
                .get_mut(id)
                .map(|s| std::mem::take(&mut s.pdf))
                .unwrap_or_default()
        })
        .collect();
    let engine = ctx.engine.clone();
    let composed = blocking("Compose", move || {
        let slices: Vec<&[u8]> = pdfs.iter().map(Vec::as_slice).collect();
        engine.compose(&slices, &compose)
    })
    .await?;

    let updated = now_millis();
    let mut texts = Vec::with_capacity(plan.pages.len());
    let mut positions = Vec::with_capacity(plan.pages.len());
    for (new_page, p) in plan.pages.iter().enumerate() {
        let new_page = new_page as u32;
        let source = sources.get(&p.source);
        let carried = source.and_then(|s| s.text.page(p.source_page));
        texts.push(PageText {
            page: new_page,
            contents: carried.map(|t| t.contents.clone()).unwrap_or_default(),
            ocr: carried.and_then(|t| t.ocr.clone()),
            updated,
        });
        let words: Vec<Word> = source
            .and_then(|s| s.words.get(&p.source_page))
            .map(|w| w.iter().map(|w| w.rotated(p.quarter_turns)).collect())
            .unwrap_or_default();
        positions.push(words);
    }

    let staged = StagedModification {
        previous_count,
        sources: order.len(),
        texts,
        positions,
        annotations: remap_annotations(plan, &annotations),
    };
    ctx.objects
        .put(&target_paths.staged_pdf(generation), composed)
        .await?;
    put_json(
        ctx.objects.as_ref(),
        &target_paths.staged_manifest(generation),
        &staged,
    )
    .await?;
    Ok(staged)
}

pub async fn run(
    ctx: &PipelineContext,
    task: &Task,
    plan: &ModificationPlan,
) -> Result<StageReport, PipelineError> {
    if ctx
        .progress
        .is_initialized(task.doc_id, task.generation)
        .await?
    {
        debug!("Document {}: modification already applied", task.doc_id);
        return Ok(StageReport::new().route(Stage::PageCache, Vec::new()));
    }

    let target = ctx.documents.get(plan.target).await?;
    let target_paths = ArtifactPaths::for_document(&target);
    let generation = task.generation;

    let staged: StagedModification = if ctx.progress.is_staged(task.doc_id, generation).await? {
        debug!(
            "Document {}: resuming staged modification of generation {}",
            plan.target, generation
        );
        get_json(ctx.objects.as_ref(), &target_paths.staged_manifest(generation)).await?
    } else {
        let staged = stage(ctx, plan, target.page_count, &target_paths, generation).await?;
        if !ctx.progress.mark_staged(task.doc_id, generation).await? {
            debug!("Document {}: generation {} retired while staging", plan.target, generation);
            return Ok(StageReport::new());
        }
        staged
    };

    // ── Write ────────────────────────────────────────────────────────────
    let new_count = staged.texts.len() as u32;
    for (text, words) in staged.texts.iter().zip(&staged.positions) {
        ctx.objects
            .put(&target_paths.page_text(text.page), text.contents.clone().into_bytes())
            .await?;
        put_json(
            ctx.objects.as_ref(),
            &target_paths.page_positions(text.page),
            words,
        )
        .await?;
    }
    for page in new_count..staged.previous_count {
        ctx.objects.delete(&target_paths.page_text(page)).await?;
        ctx.objects.delete(&target_paths.page_positions(page)).await?;
        for size in &ctx.config.size_classes {
            ctx.objects
                .delete(&target_paths.page_image(page, &size.name, ctx.config.image_format))
                .await?;
        }
    }
    ctx.documents
        .replace_annotations(plan.target, staged.annotations)
        .await?;
    ctx.documents
        .update(plan.target, DocumentUpdate::default().page_count(new_count))
        .await?;

    let composed = ctx.objects.get(&target_paths.staged_pdf(generation)).await?;
    ctx.objects.put(&target_paths.pdf(), composed).await?;

    for text in staged.texts {
        ctx.progress.put_page_text(task.doc_id, generation, text).await?;
    }
    ctx.progress
        .init_pages(task.doc_id, generation, new_count, PagePlan::ImagesOnly)
        .await?;
    discard_staging(ctx, &target_paths, generation).await;

    info!(
        "Document {}: recomposed {} → {} pages from {} source(s)",
        plan.target, staged.previous_count, new_count, staged.sources
    );
    let mut report = StageReport::new().route(Stage::PageCache, Vec::new());
    report.pages_known = Some(new_count);
    Ok(report)
}

