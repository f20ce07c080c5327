//! Text positions: per-word boxes for every page with text.
//!
//! OCR'd pages already had their words written by the OCR stage; for them
//! this stage only makes sure a position file exists. Pages with embedded
//! text get their words from the PDF engine.

use super::{blocking, on_page, PipelineContext, StageReport};
use crate::bus::Task;
use crate::error::PipelineError;
use crate::model::Word;
use crate::paths::ArtifactPaths;
use crate::store::{put_json, Counter};
use tracing::debug;

pub async fn run(
    ctx: &PipelineContext,
    task: &Task,
    pages: &[u32],
) -> Result<StageReport, PipelineError> {
    let doc = ctx.documents.get(task.doc_id).await?;
    let paths = ArtifactPaths::for_document(&doc);
    let pages = ctx
        .progress
        .unmarked(doc.id, task.generation, Counter::Positions, pages)
        .await?;
    if pages.is_empty() {
        return Ok(StageReport::new());
    }

    let mut done = Vec::new();
    let mut embedded = Vec::new();
    for &page in &pages {
        let ocr = ctx
            .progress
            .page_text(doc.id, task.generation, page)
            .await?
            .and_then(|t| t.ocr);
        if ocr.is_some() {
            let key = paths.page_positions(page);
            if !ctx.objects.exists(&key).await? {
                put_json(ctx.objects.as_ref(), &key, &Vec::<Word>::new()).await?;
            }
            done.push(page);
        } else {
            embedded.push(page);
        }
    }

    let mut report = StageReport::new();
    if !embedded.is_empty() {
        let pdf = ctx.objects.get(&paths.pdf()).await?;
        let engine = ctx.engine.clone();
        let batch = embedded.clone();
        let extracted = blocking("Word extraction", move || {
            let mut out = Vec::with_capacity(batch.len());
            engine.with_document(&pdf, &mut |doc| {
                for &page in &batch {
                    out.push((page, doc.words(page)));
                }
                Ok(())
            })?;
            Ok(out)
        })
        .await?;

        for (page, words) in extracted {
            match words {
                Ok(words) => {
                    put_json(ctx.objects.as_ref(), &paths.page_positions(page), &words).await?;
                    done.push(page);
                }
                Err(e) => report = report.fail(page, on_page(e, page)),
            }
        }
    }

    done.sort_unstable();
    debug!("Document {}: positions for pages {:?}", doc.id, done);
    Ok(report.mark(Counter::Positions, done))
}
