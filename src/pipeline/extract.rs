//! Image extraction and the text-source decision.
//!
//! Each page is rendered once at the widest size class and scaled down for
//! the others. While the document is open the embedded text is read too, so
//! the decision between embedded text and OCR costs no second pass.

use super::{blocking, on_page, PipelineContext, StageReport};
use crate::bus::{RunMode, Stage, Task};
use crate::config::{PageImageFormat, SizeClass};
use crate::engine::{PageInfo, PdfPages};
use crate::error::PipelineError;
use crate::model::{now_millis, PageText};
use crate::pagespec;
use crate::paths::ArtifactPaths;
use crate::store::Counter;
use image::imageops::FilterType;
use image::DynamicImage;
use std::io::Cursor;
use tracing::{debug, warn};

/// Rendered output of one page.
struct RenderedPage {
    dimension: String,
    images: Vec<(String, Vec<u8>)>,
    embedded_text: String,
}

/// Limits applied before and after rendering.
#[derive(Clone, Copy)]
struct Limits {
    max_page_points: f32,
    max_image_bytes: u64,
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
        .unmarked(doc.id, task.generation, Counter::Images, pages)
        .await?;
    if pages.is_empty() {
        debug!("Document {}: images already extracted", doc.id);
        return Ok(StageReport::new());
    }

    let pdf = ctx.objects.get(&paths.pdf()).await?;
    let engine = ctx.engine.clone();
    let sizes = ctx.config.size_classes.clone();
    let format = ctx.config.image_format;
    let limits = Limits {
        max_page_points: ctx.config.max_page_points,
        max_image_bytes: ctx.config.max_image_bytes,
    };
    let batch = pages.clone();
    let rendered = blocking("Render", move || {
        let mut out = Vec::with_capacity(batch.len());
        engine.with_document(&pdf, &mut |doc| {
            for &page in &batch {
                out.push((page, render_page(doc, page, &sizes, format, limits)));
            }
            Ok(())
        })?;
        Ok(out)
    })
    .await?;

    let decide = ctx
        .progress
        .unmarked(doc.id, task.generation, Counter::Positions, &pages)
        .await?;
    let force_ocr = task.force_ocr || task.mode == RunMode::Redaction;

    let mut report = StageReport::new();
    let mut done = Vec::new();
    let mut to_ocr = Vec::new();
    let mut to_positions = Vec::new();
    let mut texts = Vec::new();

    for (page, result) in rendered {
        let rendered = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Document {}: page {} not rendered: {}", doc.id, page + 1, e);
                report = report.fail(page, on_page(e, page));
                continue;
            }
        };
        for (size, bytes) in rendered.images {
            ctx.objects
                .put(&paths.page_image(page, &size, format), bytes)
                .await?;
        }
        ctx.progress
            .put_dimension(doc.id, task.generation, page, rendered.dimension)
            .await?;
        done.push(page);

        if !decide.contains(&page) {
            continue;
        }
        if !force_ocr && ctx.text_policy.is_usable(&rendered.embedded_text) {
            ctx.objects
                .put(&paths.page_text(page), rendered.embedded_text.clone().into_bytes())
                .await?;
            ctx.progress
                .put_page_text(
                    doc.id,
                    task.generation,
                    PageText {
                        page,
                        contents: rendered.embedded_text,
                        ocr: None,
                        updated: now_millis(),
                    },
                )
                .await?;
            texts.push(page);
            to_positions.push(page);
        } else {
            to_ocr.push(page);
        }
    }

    debug!(
        "Document {}: extracted {} pages ({} embedded text, {} for OCR)",
        doc.id,
        done.len(),
        texts.len(),
        to_ocr.len()
    );
    Ok(report
        .mark(Counter::Images, done)
        .mark(Counter::Texts, texts)
        .route(Stage::Ocr, to_ocr)
        .route(Stage::TextPositions, to_positions))
}

fn render_page(
    doc: &dyn PdfPages,
    page: u32,
    sizes: &[SizeClass],
    format: PageImageFormat,
    limits: Limits,
) -> Result<RenderedPage, PipelineError> {
    let info = doc.page_info(page)?;
    check_dimensions(page, info, limits.max_page_points)?;

    let widest = sizes.iter().map(|s| s.width).max().unwrap_or(1);
    let raw_bytes = widest as u64 * info.height_at(widest) as u64 * 4;
    if raw_bytes > limits.max_image_bytes {
        return Err(PipelineError::OversizedPage {
            page,
            detail: format!(
                "{} byte image exceeds the {} byte limit",
                raw_bytes, limits.max_image_bytes
            ),
        });
    }

    let full = doc.render(page, widest)?;
    let mut images = Vec::with_capacity(sizes.len());
    for size in sizes {
        let scaled = if size.width == full.width() {
            full.clone()
        } else {
            let height = (full.height() as f64 * size.width as f64 / full.width().max(1) as f64)
                .round()
                .max(1.0) as u32;
            full.resize_exact(size.width, height, FilterType::Triangle)
        };
        images.push((size.name.clone(), encode(&scaled, format)?));
    }

    Ok(RenderedPage {
        dimension: pagespec::dimension_key(info.width, info.height),
        images,
        embedded_text: doc.text(page)?,
    })
}

fn check_dimensions(page: u32, info: PageInfo, max_points: f32) -> Result<(), PipelineError> {
    if info.width > max_points || info.height > max_points {
        return Err(PipelineError::OversizedPage {
            page,
            detail: format!(
                "{}x{} points exceeds the {} point limit",
                info.width, info.height, max_points
            ),
        });
    }
    Ok(())
}

fn encode(image: &DynamicImage, format: PageImageFormat) -> Result<Vec<u8>, PipelineError> {
    let mut buf = Vec::new();
    match format {
        PageImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8())
            .write_to(&mut Cursor::new(&mut buf), format.image_format())?,
        _ => image.write_to(&mut Cursor::new(&mut buf), format.image_format())?,
    }
    Ok(buf)
}
