//! Error types for the docflow pipeline.
//!
//! Every failure is a [`PipelineError`]. What the orchestrator does with it
//! depends on its [`ErrorClass`]:
//!
//! * [`ErrorClass::Validation`]: rejected synchronously by a public operation,
//!   nothing has been mutated.
//! * [`ErrorClass::Transient`]: timeout, throttling, storage outage. Retried
//!   inside the stage with exponential backoff, then through the retry path.
//! * [`ErrorClass::Content`]: the task failed on its input. Re-dispatched
//!   through the retry path until the attempt ceiling.
//! * [`ErrorClass::Permanent`]: retrying cannot help (unsupported type,
//!   oversized file or page, corrupt PDF).
//!
//! Whether a terminal failure takes down the whole document or just a page
//! batch is decided by the stage, see [`crate::bus::Stage::is_document_scoped`].

use crate::model::{DocumentId, DocumentStatus, UserId};
use thiserror::Error;

/// All errors returned by the docflow library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Validation errors ─────────────────────────────────────────────────
    /// No document with this id exists.
    #[error("Document {id} not found")]
    DocumentNotFound { id: DocumentId },

    /// The caller lacks the access level the operation needs.
    #[error("Permission denied: user {user} cannot {action} document {id}")]
    PermissionDenied {
        user: UserId,
        id: DocumentId,
        action: &'static str,
    },

    /// A page range string could not be parsed.
    #[error("Malformed page range '{input}': {reason}")]
    MalformedRange { input: String, reason: String },

    /// A page number does not exist in the referenced document.
    #[error("Page {page} is out of range for document {id} ({total} pages)")]
    PageOutOfRange {
        id: DocumentId,
        page: u32,
        total: u32,
    },

    /// A redaction rectangle is malformed.
    #[error("Invalid redaction on page {page}: {reason}")]
    InvalidRedaction { page: u32, reason: String },

    /// A redaction call carried no rectangles.
    #[error("At least one redaction is required")]
    EmptyRedaction,

    /// A modification spec is structurally invalid.
    #[error("Invalid modification: {0}")]
    InvalidModification(String),

    /// The document is in a status that does not allow the operation.
    #[error("Document {id} is {status}; cannot {action}")]
    InvalidState {
        id: DocumentId,
        status: DocumentStatus,
        action: &'static str,
    },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Transient infrastructure errors ───────────────────────────────────
    /// The object store or a metadata store could not be reached.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A stage invocation exceeded its time budget.
    #[error("Stage {stage} timed out after {secs}s")]
    Timeout { stage: &'static str, secs: u64 },

    /// An external service asked us to back off.
    #[error("Rate limited by {service}")]
    Throttled { service: String },

    /// The message bus refused a task.
    #[error("Message bus unavailable: {0}")]
    BusUnavailable(String),

    // ── Content errors ────────────────────────────────────────────────────
    /// A required artifact is missing from the object store.
    #[error("Artifact not found: {key}")]
    ArtifactNotFound { key: String },

    /// The uploaded file type cannot be converted.
    #[error("Unsupported file type '.{extension}'")]
    UnsupportedFormat { extension: String },

    /// The conversion engine failed or produced something that is not a PDF.
    #[error("Conversion failed: {0}")]
    ConversionFailed(String),

    /// The file exceeds the configured size ceiling.
    #[error("File is too large: {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { size: u64, limit: u64 },

    /// The PDF cannot be opened or has no pages.
    #[error("PDF is corrupt: {0}")]
    CorruptPdf(String),

    /// A page exceeds the dimension or image-size ceiling.
    #[error("Page {page} is oversized: {detail}")]
    OversizedPage { page: u32, detail: String },

    /// The PDF engine could not rasterise or read a page.
    #[error("Rendering failed for page {page}: {detail}")]
    RenderFailed { page: u32, detail: String },

    /// The OCR engine failed on a page.
    #[error("OCR failed for page {page}: {detail}")]
    OcrFailed { page: u32, detail: String },

    /// An image could not be encoded or decoded.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// A persisted JSON artifact could not be (de)serialised.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// How the orchestrator treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Transient,
    Content,
    Permanent,
}

impl PipelineError {
    /// Classify this error for the retry policy.
    pub fn class(&self) -> ErrorClass {
        use PipelineError::*;
        match self {
            DocumentNotFound { .. }
            | PermissionDenied { .. }
            | MalformedRange { .. }
            | PageOutOfRange { .. }
            | InvalidRedaction { .. }
            | EmptyRedaction
            | InvalidModification(_)
            | InvalidState { .. }
            | InvalidConfig(_) => ErrorClass::Validation,

            StorageUnavailable(_) | Timeout { .. } | Throttled { .. } | BusUnavailable(_) => {
                ErrorClass::Transient
            }

            UnsupportedFormat { .. }
            | ConversionFailed(_)
            | FileTooLarge { .. }
            | CorruptPdf(_)
            | OversizedPage { .. } => ErrorClass::Permanent,

            ArtifactNotFound { .. }
            | RenderFailed { .. }
            | OcrFailed { .. }
            | Image(_)
            | Serialization(_)
            | Internal(_) => ErrorClass::Content,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => PipelineError::ArtifactNotFound {
                key: e.to_string(),
            },
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted => {
                PipelineError::StorageUnavailable(e.to_string())
            }
            _ => PipelineError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_classified() {
        let e = PipelineError::MalformedRange {
            input: "1-".into(),
            reason: "missing end".into(),
        };
        assert_eq!(e.class(), ErrorClass::Validation);
        assert!(e.to_string().contains("'1-'"));
    }

    #[test]
    fn throttling_is_transient() {
        let e = PipelineError::Throttled {
            service: "ocr".into(),
        };
        assert!(e.is_transient());
    }

    #[test]
    fn oversized_page_is_permanent() {
        let e = PipelineError::OversizedPage {
            page: 4,
            detail: "20000pt wide".into(),
        };
        assert_eq!(e.class(), ErrorClass::Permanent);
        assert!(e.to_string().contains("Page 4"));
    }

    #[test]
    fn ocr_failure_is_content() {
        let e = PipelineError::OcrFailed {
            page: 2,
            detail: "engine crashed".into(),
        };
        assert_eq!(e.class(), ErrorClass::Content);
    }

    #[test]
    fn invalid_state_display() {
        let e = PipelineError::InvalidState {
            id: 7,
            status: DocumentStatus::Pending,
            action: "trigger processing",
        };
        assert_eq!(
            e.to_string(),
            "Document 7 is pending; cannot trigger processing"
        );
    }

    #[test]
    fn io_not_found_maps_to_missing_artifact() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e: PipelineError = io.into();
        assert!(matches!(e, PipelineError::ArtifactNotFound { .. }));
    }
}
