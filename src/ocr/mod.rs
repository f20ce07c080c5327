//! OCR engines and the text-source decision.
//!
//! An [`OcrEngine`] turns a page image into text plus, when it can, word
//! boxes. Two engines ship with the crate:
//!
//! * [`TesseractEngine`] shells out to the `tesseract` binary and parses its
//!   TSV output, so it yields word positions.
//! * [`VlmOcrEngine`] transcribes the page through a vision LLM provider and
//!   yields text only.

pub mod cleanup;
pub mod prompts;
pub mod tesseract;
pub mod vlm;

pub use tesseract::TesseractEngine;
pub use vlm::VlmOcrEngine;

use crate::error::PipelineError;
use crate::model::Word;
use image::DynamicImage;

/// Result of recognising one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OcrOutput {
    pub text: String,
    /// Page-relative word boxes. Empty when the engine cannot locate words.
    pub words: Vec<Word>,
}

#[async_trait::async_trait]
pub trait OcrEngine: Send + Sync {
    /// Short engine name recorded with each OCR'd page.
    fn identifier(&self) -> String;

    async fn recognize(
        &self,
        image: &DynamicImage,
        language: &str,
    ) -> Result<OcrOutput, PipelineError>;
}

/// Decides whether a page's embedded text is good enough to skip OCR.
pub trait TextPolicy: Send + Sync {
    fn is_usable(&self, embedded_text: &str) -> bool;
}

/// Embedded text is usable once it has `min_chars` non-whitespace characters.
#[derive(Debug, Clone, Copy)]
pub struct MinimumTextPolicy {
    pub min_chars: usize,
}

impl MinimumTextPolicy {
    pub fn new(min_chars: usize) -> Self {
        Self { min_chars }
    }
}

impl TextPolicy for MinimumTextPolicy {
    fn is_usable(&self, embedded_text: &str) -> bool {
        let count = embedded_text.chars().filter(|c| !c.is_whitespace()).count();
        count >= self.min_chars.max(1)
    }
}
