//! [`PdfEngine`] backed by `pdfium-render`.
//!
//! The library is bound per call, inside the caller's blocking thread.
//! `PDFIUM_LIB_PATH` may name either the library file or the directory
//! holding it; without it the system library is used.

use super::{paint_redactions, ComposePage, PageInfo, PdfEngine, PdfPages};
use crate::error::PipelineError;
use crate::model::Word;
use crate::redaction::RedactionSpec;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{debug, info};

/// Environment variable naming the pdfium library to bind.
pub const PDFIUM_LIB_PATH_ENV: &str = "PDFIUM_LIB_PATH";

#[derive(Debug, Clone, Default)]
pub struct PdfiumEngine {
    lib_path: Option<PathBuf>,
}

impl PdfiumEngine {
    /// Engine bound to the library named by `PDFIUM_LIB_PATH`, if set.
    pub fn from_env() -> Self {
        Self {
            lib_path: std::env::var_os(PDFIUM_LIB_PATH_ENV).map(PathBuf::from),
        }
    }

    pub fn with_library(path: impl Into<PathBuf>) -> Self {
        Self {
            lib_path: Some(path.into()),
        }
    }

    fn bind(&self) -> Result<Pdfium, PipelineError> {
        let bindings = match &self.lib_path {
            Some(path) if path.is_dir() => {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(path))
            }
            Some(path) => Pdfium::bind_to_library(path),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| PipelineError::Internal(format!("Failed to bind pdfium: {:?}", e)))?;
        Ok(Pdfium::new(bindings))
    }
}

fn corrupt(e: PdfiumError) -> PipelineError {
    PipelineError::CorruptPdf(format!("{:?}", e))
}

fn render_failed(page: u32, e: PdfiumError) -> PipelineError {
    PipelineError::RenderFailed {
        page,
        detail: format!("{:?}", e),
    }
}

fn quarter_turns_of(rotation: PdfPageRenderRotation) -> u8 {
    match rotation {
        PdfPageRenderRotation::None => 0,
        PdfPageRenderRotation::Degrees90 => 1,
        PdfPageRenderRotation::Degrees180 => 2,
        PdfPageRenderRotation::Degrees270 => 3,
    }
}

fn rotation_of(quarter_turns: u8) -> PdfPageRenderRotation {
    match quarter_turns % 4 {
        1 => PdfPageRenderRotation::Degrees90,
        2 => PdfPageRenderRotation::Degrees180,
        3 => PdfPageRenderRotation::Degrees270,
        _ => PdfPageRenderRotation::None,
    }
}

struct PdfiumPages<'a, 'b> {
    document: &'a PdfDocument<'b>,
}

impl PdfiumPages<'_, '_> {
    fn page(&self, page: u32) -> Result<PdfPage<'_>, PipelineError> {
        self.document
            .pages()
            .get(page as u16)
            .map_err(|e| render_failed(page, e))
    }
}

impl PdfPages for PdfiumPages<'_, '_> {
    fn page_count(&self) -> u32 {
        self.document.pages().len() as u32
    }

    fn page_info(&self, page: u32) -> Result<PageInfo, PipelineError> {
        let p = self.page(page)?;
        Ok(PageInfo {
            width: p.width().value,
            height: p.height().value,
        })
    }

    fn render(&self, page: u32, width: u32) -> Result<DynamicImage, PipelineError> {
        let p = self.page(page)?;
        let config = PdfRenderConfig::new()
            .set_target_width(width as i32)
            .render_form_data(true)
            .render_annotations(true);
        let image = p
            .render_with_config(&config)
            .map_err(|e| render_failed(page, e))?
            .as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            page + 1,
            image.width(),
            image.height()
        );
        Ok(image)
    }

    fn text(&self, page: u32) -> Result<String, PipelineError> {
        let p = self.page(page)?;
        let text = p.text().map_err(|e| render_failed(page, e))?;
        Ok(text.all())
    }

    fn words(&self, page: u32) -> Result<Vec<Word>, PipelineError> {
        let p = self.page(page)?;
        let (width, height) = (p.width().value as f64, p.height().value as f64);
        if width <= 0.0 || height <= 0.0 {
            return Ok(Vec::new());
        }
        let turns = p.rotation().map(quarter_turns_of).unwrap_or(0);
        let text = p.text().map_err(|e| render_failed(page, e))?;

        let mut words = Vec::new();
        for segment in text.segments().iter() {
            let content = segment.text();
            let bounds = segment.bounds();
            // Segment boxes are in points with a bottom-left origin.
            let left = bounds.left().value as f64 / width;
            let right = bounds.right().value as f64 / width;
            let top = 1.0 - bounds.top().value as f64 / height;
            let bottom = 1.0 - bounds.bottom().value as f64 / height;
            words.extend(
                split_segment(&content, left, right, top, bottom)
                    .into_iter()
                    .map(|w| w.rotated(turns)),
            );
        }
        Ok(words)
    }
}

/// Split a text run into words, sharing its box out by character count.
fn split_segment(content: &str, left: f64, right: f64, top: f64, bottom: f64) -> Vec<Word> {
    let total = content.chars().count();
    if total == 0 {
        return Vec::new();
    }
    let per_char = (right - left) / total as f64;
    let mut words = Vec::new();
    let mut offset = 0usize;
    for piece in content.split(' ') {
        let len = piece.chars().count();
        let trimmed = piece.trim();
        if !trimmed.is_empty() {
            let x1 = left + per_char * offset as f64;
            let x2 = left + per_char * (offset + len) as f64;
            words.push(Word::new(
                trimmed,
                x1.clamp(0.0, 1.0),
                top.clamp(0.0, 1.0),
                x2.clamp(0.0, 1.0),
                bottom.clamp(0.0, 1.0),
            ));
        }
        offset += len + 1;
    }
    words
}

impl PdfEngine for PdfiumEngine {
    fn with_document(
        &self,
        pdf: &[u8],
        f: &mut dyn FnMut(&dyn PdfPages) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        let pdfium = self.bind()?;
        let document = pdfium.load_pdf_from_byte_slice(pdf, None).map_err(corrupt)?;
        f(&PdfiumPages {
            document: &document,
        })
    }

    fn compose(&self, sources: &[&[u8]], pages: &[ComposePage]) -> Result<Vec<u8>, PipelineError> {
        let pdfium = self.bind()?;
        let documents = sources
            .iter()
            .map(|bytes| pdfium.load_pdf_from_byte_slice(bytes, None).map_err(corrupt))
            .collect::<Result<Vec<_>, _>>()?;

        let mut output = pdfium.create_new_pdf().map_err(corrupt)?;
        for (index, planned) in pages.iter().enumerate() {
            let source = documents.get(planned.source).ok_or_else(|| {
                PipelineError::Internal(format!("No source document #{}", planned.source))
            })?;
            output
                .pages_mut()
                .copy_page_from_document(source, planned.page as u16, index as u16)
                .map_err(|e| render_failed(planned.page, e))?;
            if planned.quarter_turns % 4 != 0 {
                let mut page = output
                    .pages()
                    .get(index as u16)
                    .map_err(|e| render_failed(index as u32, e))?;
                let current = page.rotation().map(quarter_turns_of).unwrap_or(0);
                page.set_rotation(rotation_of(current + planned.quarter_turns));
            }
        }
        info!("Composed {} pages from {} sources", pages.len(), sources.len());
        output.save_to_bytes().map_err(corrupt)
    }

    fn flatten_redactions(
        &self,
        pdf: &[u8],
        redactions: &[RedactionSpec],
        width: u32,
    ) -> Result<Vec<u8>, PipelineError> {
        let pdfium = self.bind()?;
        let source = pdfium.load_pdf_from_byte_slice(pdf, None).map_err(corrupt)?;
        let dirty: BTreeSet<u32> = redactions.iter().map(|r| r.page_number).collect();
        let mut output = pdfium.create_new_pdf().map_err(corrupt)?;

        let count = source.pages().len() as u32;
        for page_number in 0..count {
            if !dirty.contains(&page_number) {
                output
                    .pages_mut()
                    .copy_page_from_document(&source, page_number as u16, page_number as u16)
                    .map_err(|e| render_failed(page_number, e))?;
                continue;
            }

            let page = source
                .pages()
                .get(page_number as u16)
                .map_err(|e| render_failed(page_number, e))?;
            let mut image = page
                .render_with_config(&PdfRenderConfig::new().set_target_width(width as i32))
                .map_err(|e| render_failed(page_number, e))?
                .as_image();
            paint_redactions(&mut image, page_number, redactions);

            // The render already has the page rotation applied.
            let page_width = PdfPoints::new(
                page.width().value.max(page.height().value) * image.width() as f32
                    / image.width().max(image.height()) as f32,
            );
            let page_height = PdfPoints::new(
                page_width.value * image.height() as f32 / image.width().max(1) as f32,
            );
            let mut flat = output
                .pages_mut()
                .create_page_at_end(PdfPagePaperSize::from_points(page_width, page_height))
                .map_err(|e| render_failed(page_number, e))?;
            flat.objects_mut()
                .create_image_object(
                    PdfPoints::ZERO,
                    PdfPoints::ZERO,
                    &image,
                    Some(page_width),
                    Some(page_height),
                )
                .map_err(|e| render_failed(page_number, e))?;
            debug!("Flattened redacted page {}", page_number + 1);
        }
        output.save_to_bytes().map_err(corrupt)
    }

    fn graft_text(&self, pdf: &[u8], pages: &[(u32, Vec<Word>)]) -> Result<Vec<u8>, PipelineError> {
        let pdfium = self.bind()?;
        let mut document = pdfium.load_pdf_from_byte_slice(pdf, None).map_err(corrupt)?;
        let font = document.fonts_mut().helvetica();

        for (page_number, words) in pages {
            let page_number = *page_number;
            let mut page = document
                .pages()
                .get(page_number as u16)
                .map_err(|e| render_failed(page_number, e))?;
            let turns = page.rotation().map(quarter_turns_of).unwrap_or(0);
            // pdfium reports the rotated size; text goes in unrotated space.
            let (width, height) = if turns % 2 == 1 {
                (page.height().value, page.width().value)
            } else {
                (page.width().value, page.height().value)
            };

            for word in words {
                let b = word.bounds().rotated((4 - turns % 4) % 4);
                let size = ((b.y2 - b.y1) as f32 * height).max(1.0);
                let mut object =
                    PdfPageTextObject::new(&document, &word.text, font, PdfPoints::new(size))
                        .map_err(|e| render_failed(page_number, e))?;
                object
                    .set_render_mode(PdfPageTextRenderMode::Invisible)
                    .map_err(|e| render_failed(page_number, e))?;
                object
                    .translate(
                        PdfPoints::new(b.x1 as f32 * width),
                        PdfPoints::new((1.0 - b.y2) as f32 * height),
                    )
                    .map_err(|e| render_failed(page_number, e))?;
                page.objects_mut()
                    .add_text_object(object)
                    .map_err(|e| render_failed(page_number, e))?;
            }
            debug!("Grafted {} words onto page {}", words.len(), page_number + 1);
        }
        document.save_to_bytes().map_err(corrupt)
    }
}
