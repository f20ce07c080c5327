//! Format conversion: any supported upload → canonical PDF.

use super::{PipelineContext, StageReport};
use crate::bus::{Stage, Task};
use crate::error::PipelineError;
use crate::paths::ArtifactPaths;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Upload types the pipeline accepts. `pdf` needs no conversion.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "doc", "docx", "odt", "rtf", "txt", "xls", "xlsx", "ods", "csv", "ppt", "pptx", "odp", "html",
    "htm", "wpd", "pdf",
];

pub fn is_supported(extension: &str) -> bool {
    SUPPORTED_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str())
}

pub(crate) fn is_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(b"%PDF")
}

/// Turns a non-PDF document into PDF bytes.
#[async_trait::async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn convert(&self, input: &[u8], extension: &str) -> Result<Vec<u8>, PipelineError>;
}

/// Converts through a headless LibreOffice (`soffice --convert-to pdf`).
#[derive(Debug, Clone)]
pub struct LibreOfficeConverter {
    binary: PathBuf,
    attempts: u32,
}

impl Default for LibreOfficeConverter {
    fn default() -> Self {
        Self::new("soffice")
    }
}

impl LibreOfficeConverter {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            attempts: 2,
        }
    }

    async fn convert_once(&self, input: &[u8], extension: &str) -> Result<Vec<u8>, PipelineError> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join(format!("document.{extension}"));
        tokio::fs::write(&source, input).await?;

        let output = Command::new(&self.binary)
            .arg("--headless")
            .arg("--convert-to")
            .arg("pdf")
            .arg("--outdir")
            .arg(dir.path())
            .arg(&source)
            .output()
            .await
            .map_err(|e| {
                PipelineError::ConversionFailed(format!(
                    "cannot run {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(PipelineError::ConversionFailed(format!(
                "LibreOffice exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let pdf_path = dir.path().join("document.pdf");
        tokio::fs::read(&pdf_path).await.map_err(|_| {
            PipelineError::ConversionFailed("LibreOffice produced no PDF".to_string())
        })
    }
}

#[async_trait::async_trait]
impl DocumentConverter for LibreOfficeConverter {
    async fn convert(&self, input: &[u8], extension: &str) -> Result<Vec<u8>, PipelineError> {
        let mut last_err = None;
        for attempt in 1..=self.attempts {
            match self.convert_once(input, extension).await {
                Ok(pdf) => return Ok(pdf),
                Err(e) => {
                    warn!(
                        "Conversion attempt {}/{} failed: {}",
                        attempt, self.attempts, e
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| PipelineError::ConversionFailed("no attempt was made".into())))
    }
}

/// Convert the original upload and store the canonical PDF.
pub async fn run(ctx: &PipelineContext, task: &Task) -> Result<StageReport, PipelineError> {
    let doc = ctx.documents.get(task.doc_id).await?;
    let paths = ArtifactPaths::for_document(&doc);
    let extension = doc.original_extension.to_ascii_lowercase();

    if !is_supported(&extension) {
        return Err(PipelineError::UnsupportedFormat { extension });
    }
    if !doc.needs_conversion() {
        debug!("Document {}: already a PDF, skipping conversion", doc.id);
        return Ok(StageReport::new().route(Stage::PageCache, Vec::new()));
    }

    let key = paths.original(&extension);
    let size = ctx.objects.size(&key).await?;
    if size > ctx.config.document_size_limit {
        return Err(PipelineError::FileTooLarge {
            size,
            limit: ctx.config.document_size_limit,
        });
    }

    let input = ctx.objects.get(&key).await?;
    let pdf = ctx.converter.convert(&input, &extension).await?;
    if !is_pdf(&pdf) {
        return Err(PipelineError::ConversionFailed(
            "converter output is not a PDF".to_string(),
        ));
    }

    info!(
        "Document {}: converted .{} ({} bytes) to PDF ({} bytes)",
        doc.id,
        extension,
        input.len(),
        pdf.len()
    );
    ctx.objects.put(&paths.pdf(), pdf).await?;
    Ok(StageReport::new().route(Stage::PageCache, Vec::new()))
}
