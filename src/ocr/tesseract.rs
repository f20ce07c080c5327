//! OCR through the `tesseract` command-line tool.
//!
//! The page is written to a temporary PNG and recognised with the `tsv`
//! output config, which lists every word with its pixel box:
//!
//! ```text
//! level page_num block_num par_num line_num word_num left top width height conf text
//! ```
//!
//! Level 5 rows are words. Text is rebuilt from them: words on a line are
//! joined by spaces, lines by newlines, paragraphs by a blank line.

use super::{cleanup::clean_text, OcrEngine, OcrOutput};
use crate::error::PipelineError;
use crate::model::Word;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

const WORD_LEVEL: &str = "5";

#[derive(Debug, Clone)]
pub struct TesseractEngine {
    binary: PathBuf,
    version: String,
}

impl Default for TesseractEngine {
    fn default() -> Self {
        Self::new("tesseract", "tess4")
    }
}

impl TesseractEngine {
    /// `version` is the identifier recorded against OCR'd pages.
    pub fn new(binary: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            version: version.into(),
        }
    }
}

#[async_trait::async_trait]
impl OcrEngine for TesseractEngine {
    fn identifier(&self) -> String {
        self.version.clone()
    }

    async fn recognize(
        &self,
        image: &DynamicImage,
        language: &str,
    ) -> Result<OcrOutput, PipelineError> {
        let mut png = Vec::new();
        image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;

        let input = tempfile::Builder::new()
            .prefix("docflow-ocr-")
            .suffix(".png")
            .tempfile()?;
        tokio::fs::write(input.path(), &png).await?;

        let output = Command::new(&self.binary)
            .arg(input.path())
            .arg("stdout")
            .arg("-l")
            .arg(language)
            .arg("tsv")
            .output()
            .await
            .map_err(|e| PipelineError::OcrFailed {
                page: 0,
                detail: format!("cannot run {}: {}", self.binary.display(), e),
            })?;

        if !output.status.success() {
            return Err(PipelineError::OcrFailed {
                page: 0,
                detail: format!(
                    "tesseract exited with {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let tsv = String::from_utf8_lossy(&output.stdout);
        let result = parse_tsv(&tsv, image.width(), image.height());
        debug!(
            "tesseract recognised {} words ({} chars)",
            result.words.len(),
            result.text.len()
        );
        Ok(result)
    }
}

/// Parse tesseract TSV into text and page-relative word boxes.
pub fn parse_tsv(tsv: &str, width: u32, height: u32) -> OcrOutput {
    let (w, h) = (width.max(1) as f64, height.max(1) as f64);
    let mut words = Vec::new();
    let mut text = String::new();
    let mut last_line: Option<(&str, &str, &str)> = None;

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 || cols[0] != WORD_LEVEL {
            continue;
        }
        let word = cols[11].trim();
        if word.is_empty() {
            continue;
        }
        let nums: Option<Vec<f64>> = cols[6..10].iter().map(|c| c.parse().ok()).collect();
        let Some(nums) = nums else { continue };
        let (left, top, bw, bh) = (nums[0], nums[1], nums[2], nums[3]);

        let line = (cols[2], cols[3], cols[4]);
        match last_line {
            Some(prev) if prev == line => text.push(' '),
            Some(prev) if (prev.0, prev.1) == (line.0, line.1) => text.push('\n'),
            Some(_) => text.push_str("\n\n"),
            None => {}
        }
        last_line = Some(line);
        text.push_str(word);

        words.push(Word::new(
            word,
            (left / w).clamp(0.0, 1.0),
            (top / h).clamp(0.0, 1.0),
            ((left + bw) / w).clamp(0.0, 1.0),
            ((top + bh) / h).clamp(0.0, 1.0),
        ));
    }

    OcrOutput {
        text: clean_text(&text),
        words,
    }
}
