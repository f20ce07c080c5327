//! Pipeline configuration.
//!
//! Every tunable of the pipeline lives in [`PipelineConfig`], built via
//! [`PipelineConfigBuilder`]. Batch sizes, size classes, retry ceilings and
//! limits are all configuration so deployments can tune them without code
//! changes.

use crate::error::PipelineError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;

const MIB: u64 = 1024 * 1024;

/// Configuration for the document pipeline.
///
/// # Example
/// ```rust
/// use docflow::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .image_batch(20)
///     .ocr_batch(2)
///     .max_attempts(5)
///     .build()
///     .unwrap();
/// assert_eq!(config.ocr_size().name, "large");
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Pages per image-extraction task. Default: 55.
    pub image_batch: usize,

    /// Pages per OCR task. Default: 4.
    ///
    /// OCR is the slowest stage; small batches spread a document across
    /// more workers.
    pub ocr_batch: usize,

    /// Pages per text-position task. Default: 3.
    pub text_position_batch: usize,

    /// Rendered image sizes, largest first. Default:
    /// `xlarge:2000, large:1000, normal:700, small:180, thumbnail:60`.
    pub size_classes: Vec<SizeClass>,

    /// Name of the size class fed to the OCR engine. Default: `large`.
    pub ocr_size_class: String,

    /// Encoding of page images. Default: GIF.
    pub image_format: PageImageFormat,

    /// Minimum non-whitespace characters of embedded text for a page to
    /// skip OCR. Default: 1.
    pub min_text_chars: usize,

    /// Total attempts per task, including the first. Default: 3.
    pub max_attempts: u32,

    /// In-stage retries for transient errors before the retry path. Default: 2.
    pub transient_retries: u32,

    /// Initial backoff for in-stage retries, doubled each time. Default: 500.
    pub retry_backoff_ms: u64,

    /// Time budget for one stage invocation. Default: 300.
    pub stage_timeout_secs: u64,

    /// Maximum size of the canonical PDF. Default: 501 MiB.
    pub pdf_size_limit: u64,

    /// Maximum size of a non-PDF upload. Default: 26 MiB.
    pub document_size_limit: u64,

    /// Maximum page width or height in PDF points. Default: 14400.
    pub max_page_points: f32,

    /// Maximum raw RGBA size of the largest rendered image. Default: 64 MiB.
    pub max_image_bytes: u64,

    /// Language used when a document does not carry one. Default: `eng`.
    pub ocr_language: String,

    /// OCR engine version tag written into page metadata. Default: `tess4`.
    pub ocr_version: String,

    /// Concurrent tasks per worker. Default: 10.
    pub concurrency: usize,

    /// Optional observer for pipeline events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            image_batch: 55,
            ocr_batch: 4,
            text_position_batch: 3,
            size_classes: SizeClass::defaults(),
            ocr_size_class: "large".to_string(),
            image_format: PageImageFormat::default(),
            min_text_chars: 1,
            max_attempts: 3,
            transient_retries: 2,
            retry_backoff_ms: 500,
            stage_timeout_secs: 300,
            pdf_size_limit: 501 * MIB,
            document_size_limit: 26 * MIB,
            max_page_points: 14_400.0,
            max_image_bytes: 64 * MIB,
            ocr_language: "eng".to_string(),
            ocr_version: "tess4".to_string(),
            concurrency: 10,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("image_batch", &self.image_batch)
            .field("ocr_batch", &self.ocr_batch)
            .field("text_position_batch", &self.text_position_batch)
            .field("size_classes", &self.size_classes)
            .field("ocr_size_class", &self.ocr_size_class)
            .field("image_format", &self.image_format)
            .field("min_text_chars", &self.min_text_chars)
            .field("max_attempts", &self.max_attempts)
            .field("transient_retries", &self.transient_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("stage_timeout_secs", &self.stage_timeout_secs)
            .field("ocr_version", &self.ocr_version)
            .field("concurrency", &self.concurrency)
            .field(
                "progress_callback",
                &self
                    .progress_callback
                    .as_ref()
                    .map(|_| "<dyn PipelineProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// The size class rendered for OCR.
    pub fn ocr_size(&self) -> &SizeClass {
        self.size_classes
            .iter()
            .find(|s| s.name == self.ocr_size_class)
            .unwrap_or(&self.size_classes[0])
    }

    /// The widest configured size class; pages are rendered once at this width.
    pub fn largest_size(&self) -> &SizeClass {
        self.size_classes
            .iter()
            .max_by_key(|s| s.width)
            .unwrap_or(&self.size_classes[0])
    }

    /// Backoff before in-stage retry number `retry` (1-based).
    pub fn backoff_ms(&self, retry: u32) -> u64 {
        self.retry_backoff_ms
            .saturating_mul(2u64.saturating_pow(retry.saturating_sub(1)))
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn image_batch(mut self, n: usize) -> Self {
        self.config.image_batch = n;
        self
    }

    pub fn ocr_batch(mut self, n: usize) -> Self {
        self.config.ocr_batch = n;
        self
    }

    pub fn text_position_batch(mut self, n: usize) -> Self {
        self.config.text_position_batch = n;
        self
    }

    pub fn size_classes(mut self, classes: Vec<SizeClass>) -> Self {
        self.config.size_classes = classes;
        self
    }

    pub fn ocr_size_class(mut self, name: impl Into<String>) -> Self {
        self.config.ocr_size_class = name.into();
        self
    }

    pub fn image_format(mut self, format: PageImageFormat) -> Self {
        self.config.image_format = format;
        self
    }

    pub fn min_text_chars(mut self, n: usize) -> Self {
        self.config.min_text_chars = n;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    pub fn transient_retries(mut self, n: u32) -> Self {
        self.config.transient_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn stage_timeout_secs(mut self, secs: u64) -> Self {
        self.config.stage_timeout_secs = secs;
        self
    }

    pub fn pdf_size_limit(mut self, bytes: u64) -> Self {
        self.config.pdf_size_limit = bytes;
        self
    }

    pub fn document_size_limit(mut self, bytes: u64) -> Self {
        self.config.document_size_limit = bytes;
        self
    }

    pub fn max_page_points(mut self, points: f32) -> Self {
        self.config.max_page_points = points;
        self
    }

    pub fn max_image_bytes(mut self, bytes: u64) -> Self {
        self.config.max_image_bytes = bytes;
        self
    }

    pub fn ocr_language(mut self, lang: impl Into<String>) -> Self {
        self.config.ocr_language = lang.into();
        self
    }

    pub fn ocr_version(mut self, version: impl Into<String>) -> Self {
        self.config.ocr_version = version.into();
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.image_batch == 0 || c.ocr_batch == 0 || c.text_position_batch == 0 {
            return Err(PipelineError::InvalidConfig(
                "Batch sizes must be ≥ 1".into(),
            ));
        }
        if c.size_classes.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "At least one image size class is required".into(),
            ));
        }
        if let Some(bad) = c.size_classes.iter().find(|s| s.width == 0) {
            return Err(PipelineError::InvalidConfig(format!(
                "Size class '{}' has zero width",
                bad.name
            )));
        }
        if !c.size_classes.iter().any(|s| s.name == c.ocr_size_class) {
            return Err(PipelineError::InvalidConfig(format!(
                "OCR size class '{}' is not one of the configured size classes",
                c.ocr_size_class
            )));
        }
        if c.max_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_attempts must be ≥ 1".into(),
            ));
        }
        if c.stage_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "stage_timeout_secs must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Size classes ─────────────────────────────────────────────────────────

/// A named rendering width for page images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeClass {
    pub name: String,
    pub width: u32,
}

impl SizeClass {
    pub fn new(name: impl Into<String>, width: u32) -> Self {
        Self {
            name: name.into(),
            width,
        }
    }

    pub fn defaults() -> Vec<SizeClass> {
        vec![
            SizeClass::new("xlarge", 2000),
            SizeClass::new("large", 1000),
            SizeClass::new("normal", 700),
            SizeClass::new("small", 180),
            SizeClass::new("thumbnail", 60),
        ]
    }

    /// Parse `name:width,name:width` into size classes, widest first.
    pub fn parse_list(input: &str) -> Result<Vec<SizeClass>, PipelineError> {
        let mut classes = Vec::new();
        for item in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (name, width) = item.split_once(':').ok_or_else(|| {
                PipelineError::InvalidConfig(format!("Size class '{item}' must be name:width"))
            })?;
            let width: u32 = width.trim().parse().map_err(|_| {
                PipelineError::InvalidConfig(format!("Size class '{item}' has a bad width"))
            })?;
            classes.push(SizeClass::new(name.trim(), width));
        }
        if classes.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "No size classes given".into(),
            ));
        }
        classes.sort_by(|a, b| b.width.cmp(&a.width));
        Ok(classes)
    }
}

/// Encoding used for rendered page images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageImageFormat {
    #[default]
    Gif,
    Png,
    Jpeg,
}

impl PageImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            PageImageFormat::Gif => "gif",
            PageImageFormat::Png => "png",
            PageImageFormat::Jpeg => "jpg",
        }
    }

    pub fn image_format(self) -> image::ImageFormat {
        match self {
            PageImageFormat::Gif => image::ImageFormat::Gif,
            PageImageFormat::Png => image::ImageFormat::Png,
            PageImageFormat::Jpeg => image::ImageFormat::Jpeg,
        }
    }
}

impl std::str::FromStr for PageImageFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gif" => Ok(PageImageFormat::Gif),
            "png" => Ok(PageImageFormat::Png),
            "jpg" | "jpeg" => Ok(PageImageFormat::Jpeg),
            other => Err(PipelineError::InvalidConfig(format!(
                "Unknown image format '{other}'"
            ))),
        }
    }
}
