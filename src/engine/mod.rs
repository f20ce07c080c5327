//! PDF engine seam.
//!
//! Stages never talk to a PDF library directly; they go through
//! [`PdfEngine`]. Calls are synchronous and CPU-bound, so stages run them
//! under `tokio::task::spawn_blocking`.

#[cfg(feature = "pdfium")]
pub mod pdfium;

#[cfg(feature = "pdfium")]
pub use self::pdfium::PdfiumEngine;

use crate::error::PipelineError;
use crate::model::Word;
use crate::redaction::RedactionSpec;
use image::{DynamicImage, Rgba};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;

/// Size of a page in PDF points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageInfo {
    pub width: f32,
    pub height: f32,
}

impl PageInfo {
    /// Pixel height of a render at `width` pixels wide.
    pub fn height_at(&self, width: u32) -> u32 {
        if self.width <= 0.0 {
            return width;
        }
        ((self.height / self.width) * width as f32).round().max(1.0) as u32
    }
}

/// Read access to one opened PDF.
pub trait PdfPages {
    fn page_count(&self) -> u32;

    fn page_info(&self, page: u32) -> Result<PageInfo, PipelineError>;

    /// Rasterise a page `width` pixels wide, height in proportion.
    fn render(&self, page: u32, width: u32) -> Result<DynamicImage, PipelineError>;

    /// Embedded text of a page, in reading order.
    fn text(&self, page: u32) -> Result<String, PipelineError>;

    /// Embedded words with page-relative boxes.
    fn words(&self, page: u32) -> Result<Vec<Word>, PipelineError>;
}

/// One page of a composed document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComposePage {
    /// Index into the `sources` slice given to [`PdfEngine::compose`].
    pub source: usize,
    pub page: u32,
    /// Clockwise quarter turns added to the page's rotation.
    pub quarter_turns: u8,
}

/// A PDF library.
pub trait PdfEngine: Send + Sync {
    /// Open `pdf` and hand it to `f`.
    fn with_document(
        &self,
        pdf: &[u8],
        f: &mut dyn FnMut(&dyn PdfPages) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError>;

    /// Build a new PDF from pages of `sources`, in `pages` order.
    fn compose(&self, sources: &[&[u8]], pages: &[ComposePage]) -> Result<Vec<u8>, PipelineError>;

    /// Rewrite the redacted pages as flat images with the rectangles
    /// painted black; all other pages are copied unchanged.
    fn flatten_redactions(
        &self,
        pdf: &[u8],
        redactions: &[RedactionSpec],
        width: u32,
    ) -> Result<Vec<u8>, PipelineError>;

    /// Lay recognized words over their pages as invisible text, so a later
    /// run finds them as embedded text. Word boxes are page fractions in the
    /// displayed orientation, origin top-left.
    fn graft_text(&self, pdf: &[u8], pages: &[(u32, Vec<Word>)]) -> Result<Vec<u8>, PipelineError>;
}

/// Paint every redaction of `page` onto `image` in solid black.
pub fn paint_redactions(image: &mut DynamicImage, page: u32, redactions: &[RedactionSpec]) {
    let (w, h) = (image.width() as f64, image.height() as f64);
    let mut rgba = image.to_rgba8();
    for r in redactions.iter().filter(|r| r.page_number == page) {
        let x = (r.x1 * w).floor().max(0.0);
        let y = (r.y1 * h).floor().max(0.0);
        let rw = ((r.x2 * w).ceil() - x).max(1.0);
        let rh = ((r.y2 * h).ceil() - y).max(1.0);
        let rect = Rect::at(x as i32, y as i32).of_size(rw as u32, rh as u32);
        draw_filled_rect_mut(&mut rgba, rect, Rgba([0, 0, 0, 255]));
    }
    *image = DynamicImage::ImageRgba8(rgba);
}
