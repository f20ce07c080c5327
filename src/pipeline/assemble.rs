//! Text assembly: merge per-page text into the document text artifacts,
//! then graft the words recognized this run back into the PDF so that
//! reprocessing finds them as embedded text.

use super::{blocking, PipelineContext, StageReport};
use crate::bus::{RunMode, Task};
use crate::error::PipelineError;
use crate::model::{now_millis, Document, PageText, TextFile, Word};
use crate::paths::ArtifactPaths;
use crate::store::{get_json, put_json};
use tracing::{debug, info, warn};

pub async fn run(ctx: &PipelineContext, task: &Task) -> Result<StageReport, PipelineError> {
    let doc = ctx.documents.get(task.doc_id).await?;
    let paths = ArtifactPaths::for_document(&doc);
    let records = ctx.progress.page_texts(doc.id, task.generation).await?;

    let mut text = match task.mode {
        RunMode::Redaction => {
            match get_json::<TextFile>(ctx.objects.as_ref(), &paths.text_json()).await {
                Ok(existing) => existing,
                Err(PipelineError::ArtifactNotFound { .. }) => TextFile::default(),
                Err(e) => return Err(e),
            }
        }
        RunMode::Full | RunMode::Modification => TextFile::default(),
    };
    let patched = records.len();
    // Forced OCR runs over pages that already carry text; modification
    // carries text without recognizing anything.
    let ocr_pages: Vec<u32> = if task.force_ocr || task.mode == RunMode::Modification {
        Vec::new()
    } else {
        records
            .iter()
            .filter(|r| r.ocr.is_some())
            .map(|r| r.page)
            .collect()
    };
    merge_pages(&mut text, records);
    text.updated = now_millis();

    put_json(ctx.objects.as_ref(), &paths.text_json(), &text).await?;
    ctx.objects
        .put(&paths.text(), text.concatenated().into_bytes())
        .await?;

    info!(
        "Document {} gen {}: assembled text ({} of {} pages written)",
        doc.id,
        task.generation,
        patched,
        text.pages.len()
    );

    if !ocr_pages.is_empty() {
        if let Err(e) = graft(ctx, &doc, &paths, &ocr_pages).await {
            warn!("Document {}: could not graft OCR text into the PDF: {}", doc.id, e);
        }
    }
    Ok(StageReport::new())
}

/// Write the recognized words of `pages` into the live PDF.
async fn graft(
    ctx: &PipelineContext,
    doc: &Document,
    paths: &ArtifactPaths,
    pages: &[u32],
) -> Result<(), PipelineError> {
    let mut grafted: Vec<(u32, Vec<Word>)> = Vec::with_capacity(pages.len());
    for &page in pages {
        match get_json::<Vec<Word>>(ctx.objects.as_ref(), &paths.page_positions(page)).await {
            Ok(words) if !words.is_empty() => grafted.push((page, words)),
            Ok(_) | Err(PipelineError::ArtifactNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    if grafted.is_empty() {
        return Ok(());
    }

    let pdf = ctx.objects.get(&paths.pdf()).await?;
    let engine = ctx.engine.clone();
    let count = grafted.len();
    let updated = blocking("Graft", move || engine.graft_text(&pdf, &grafted)).await?;
    ctx.objects.put(&paths.pdf(), updated).await?;
    debug!("Document {}: grafted OCR text onto {} page(s)", doc.id, count);
    Ok(())
}

/// Replace or insert `records` by page number, keeping pages sorted.
fn merge_pages(text: &mut TextFile, records: Vec<PageText>) {
    for record in records {
        match text.pages.iter_mut().find(|p| p.page == record.page) {
            Some(slot) => *slot = record,
            None => text.pages.push(record),
        }
    }
    text.pages.sort_by_key(|p| p.page);
}
