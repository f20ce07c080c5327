//! OCR stage: recognise a batch of pages concurrently.
//!
//! Pages of a batch are independent: one failing page is reported on its
//! own and retried as a smaller batch, the others complete normally.

use super::{on_page, PipelineContext, StageReport};
use crate::bus::{Stage, Task};
use crate::error::PipelineError;
use crate::model::{now_millis, PageText};
use crate::ocr::OcrOutput;
use crate::paths::ArtifactPaths;
use crate::store::{put_json, Counter};
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

async fn recognize_page(
    ctx: &PipelineContext,
    key: &str,
    language: &str,
) -> Result<OcrOutput, PipelineError> {
    let bytes = ctx.objects.get(key).await?;
    let image = image::load_from_memory(&bytes)?;
    ctx.ocr.recognize(&image, language).await
}

pub async fn run(
    ctx: &PipelineContext,
    task: &Task,
    pages: &[u32],
) -> Result<StageReport, PipelineError> {
    let doc = ctx.documents.get(task.doc_id).await?;
    let paths = ArtifactPaths::for_document(&doc);
    let pages = ctx
        .progress
        .unmarked(doc.id, task.generation, Counter::Texts, pages)
        .await?;
    if pages.is_empty() {
        return Ok(StageReport::new());
    }

    let language = if doc.language.is_empty() {
        ctx.config.ocr_language.clone()
    } else {
        doc.language.clone()
    };
    let size = ctx.config.ocr_size().name.clone();
    let format = ctx.config.image_format;
    let identifier = if task.force_ocr {
        format!("{}_force", ctx.ocr.identifier())
    } else {
        ctx.ocr.identifier()
    };

    let results: Vec<(u32, Result<OcrOutput, PipelineError>)> = stream::iter(pages)
        .map(|page| {
            let key = paths.page_image(page, &size, format);
            let language = language.as_str();
            async move { (page, recognize_page(ctx, &key, language).await) }
        })
        .buffer_unordered(ctx.config.ocr_batch.max(1))
        .collect()
        .await;

    let mut report = StageReport::new();
    let mut recognised = Vec::new();
    for (page, result) in results {
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                warn!("Document {}: OCR failed on page {}: {}", doc.id, page + 1, e);
                report = report.fail(page, on_page(e, page));
                continue;
            }
        };
        ctx.objects
            .put(&paths.page_text(page), output.text.clone().into_bytes())
            .await?;
        put_json(ctx.objects.as_ref(), &paths.page_positions(page), &output.words).await?;
        ctx.progress
            .put_page_text(
                doc.id,
                task.generation,
                PageText {
                    page,
                    contents: output.text,
                    ocr: Some(identifier.clone()),
                    updated: now_millis(),
                },
            )
            .await?;
        recognised.push(page);
    }
    recognised.sort_unstable();

    debug!(
        "Document {}: OCR'd pages {:?} with {}",
        doc.id, recognised, identifier
    );
    Ok(report
        .mark(Counter::Texts, recognised.clone())
        .route(Stage::TextPositions, recognised))
}
