//! Document, page and annotation records shared by every stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type DocumentId = u64;
pub type UserId = u64;
pub type AnnotationId = u64;

/// Coarse processing status of a document.
///
/// The numeric codes match the persisted representation used by the
/// metadata layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Success,
    Readable,
    Pending,
    Error,
    Nofile,
}

impl DocumentStatus {
    pub fn code(self) -> u8 {
        match self {
            DocumentStatus::Success => 0,
            DocumentStatus::Readable => 1,
            DocumentStatus::Pending => 2,
            DocumentStatus::Error => 3,
            DocumentStatus::Nofile => 4,
        }
    }

    /// `pending` and `readable` both mean a run is in flight.
    pub fn is_processing(self) -> bool {
        matches!(self, DocumentStatus::Pending | DocumentStatus::Readable)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentStatus::Success | DocumentStatus::Error)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DocumentStatus::Success => "success",
            DocumentStatus::Readable => "readable",
            DocumentStatus::Pending => "pending",
            DocumentStatus::Error => "error",
            DocumentStatus::Nofile => "nofile",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Public,
    Organization,
    #[default]
    Private,
    Invisible,
}

/// What a user may do with a document. Ordered: `None < View < Edit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    None,
    View,
    Edit,
}

/// Document metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub slug: String,
    pub owner: UserId,
    pub access: Access,
    pub status: DocumentStatus,
    pub page_count: u32,
    /// Run-length encoded page dimensions, see [`crate::pagespec`].
    pub page_spec: String,
    /// Tesseract language code used for OCR.
    pub language: String,
    /// Extension of the uploaded original; `pdf` skips conversion.
    pub original_extension: String,
    /// sha256 of the canonical PDF, hex encoded.
    pub file_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(id: DocumentId, slug: impl Into<String>, owner: UserId) -> Self {
        let now = Utc::now();
        Self {
            id,
            slug: slug.into(),
            owner,
            access: Access::default(),
            status: DocumentStatus::Nofile,
            page_count: 0,
            page_spec: String::new(),
            language: "eng".to_string(),
            original_extension: "pdf".to_string(),
            file_hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.original_extension = extension.into().to_ascii_lowercase();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn needs_conversion(&self) -> bool {
        self.original_extension != "pdf"
    }
}

/// Partial update applied by [`crate::store::DocumentStore::update`].
#[derive(Debug, Clone, Default)]
pub struct DocumentUpdate {
    pub status: Option<DocumentStatus>,
    pub page_count: Option<u32>,
    pub page_spec: Option<String>,
    pub file_hash: Option<String>,
    pub original_extension: Option<String>,
}

impl DocumentUpdate {
    pub fn status(status: DocumentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn page_count(mut self, n: u32) -> Self {
        self.page_count = Some(n);
        self
    }

    pub fn page_spec(mut self, spec: impl Into<String>) -> Self {
        self.page_spec = Some(spec.into());
        self
    }

    pub fn file_hash(mut self, hash: impl Into<String>) -> Self {
        self.file_hash = Some(hash.into());
        self
    }

    pub fn original_extension(mut self, extension: impl Into<String>) -> Self {
        self.original_extension = Some(extension.into().to_ascii_lowercase());
        self
    }

    pub fn apply(self, doc: &mut Document) {
        if let Some(s) = self.status {
            doc.status = s;
        }
        if let Some(n) = self.page_count {
            doc.page_count = n;
        }
        if let Some(spec) = self.page_spec {
            doc.page_spec = spec;
        }
        if let Some(hash) = self.file_hash {
            doc.file_hash = Some(hash);
        }
        if let Some(ext) = self.original_extension {
            doc.original_extension = ext;
        }
        doc.updated_at = Utc::now();
    }
}

/// Append-only error log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub created_at: DateTime<Utc>,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            created_at: Utc::now(),
            message: message.into(),
        }
    }
}

// ── Geometry ─────────────────────────────────────────────────────────────

/// Grid onto which word coordinates are snapped (2^20 steps per page edge).
///
/// Every grid value `v` has an exact complement `1.0 - v`, so quarter-turn
/// rotations applied in inverse pairs reproduce the original bits.
const COORD_GRID: f64 = 1_048_576.0;

/// Clamp to `[0, 1]` and snap to the coordinate grid.
pub fn quantize(v: f64) -> f64 {
    if !v.is_finite() {
        return 0.0;
    }
    (v.clamp(0.0, 1.0) * COORD_GRID).round() / COORD_GRID
}

/// Page-relative rectangle, all coordinates fractions of the page size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl Bounds {
    /// Rotate the rectangle clockwise by `quarter_turns` quarter turns.
    pub fn rotated(self, quarter_turns: u8) -> Bounds {
        let Bounds { x1, y1, x2, y2 } = self;
        match quarter_turns % 4 {
            1 => Bounds {
                x1: 1.0 - y2,
                x2: 1.0 - y1,
                y1: x1,
                y2: x2,
            },
            2 => Bounds {
                x1: 1.0 - x2,
                x2: 1.0 - x1,
                y1: 1.0 - y2,
                y2: 1.0 - y1,
            },
            3 => Bounds {
                x1: y1,
                x2: y2,
                y1: 1.0 - x2,
                y2: 1.0 - x1,
            },
            _ => self,
        }
    }
}

/// One word on a page with its bounding box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub text: String,
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl Word {
    /// Build a word, snapping its box onto the coordinate grid.
    pub fn new(text: impl Into<String>, x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            text: text.into(),
            x1: quantize(x1),
            y1: quantize(y1),
            x2: quantize(x2),
            y2: quantize(y2),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn bounds(&self) -> Bounds {
        Bounds {
            x1: self.x1,
            y1: self.y1,
            x2: self.x2,
            y2: self.y2,
        }
    }

    pub fn rotated(&self, quarter_turns: u8) -> Word {
        let b = self.bounds().rotated(quarter_turns);
        Word {
            text: self.text.clone(),
            x1: b.x1,
            y1: b.y1,
            x2: b.x2,
            y2: b.y2,
            metadata: self.metadata.clone(),
        }
    }
}

// ── Text artifacts ───────────────────────────────────────────────────────

/// Per-page entry of the document-level text JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageText {
    pub page: u32,
    pub contents: String,
    /// OCR engine identifier, `None` when the text was embedded.
    pub ocr: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub updated: i64,
}

/// Document-level text JSON (`{slug}.txt.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextFile {
    pub updated: i64,
    pub pages: Vec<PageText>,
}

impl TextFile {
    /// Full document text: page contents in page order joined by a blank line.
    pub fn concatenated(&self) -> String {
        let mut pages: Vec<&PageText> = self.pages.iter().collect();
        pages.sort_by_key(|p| p.page);
        pages
            .iter()
            .map(|p| p.contents.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn page(&self, page: u32) -> Option<&PageText> {
        self.pages.iter().find(|p| p.page == page)
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ── Annotations ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationKind {
    Note,
    Section,
}

/// A note or section bound to a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// `None` for annotations not yet persisted; the store assigns one.
    pub id: Option<AnnotationId>,
    pub kind: AnnotationKind,
    pub page_number: u32,
    pub title: String,
    /// Notes only. A note without bounds is a page note.
    pub bounds: Option<Bounds>,
}

impl Annotation {
    pub fn note(page_number: u32, title: impl Into<String>, bounds: Option<Bounds>) -> Self {
        Self {
            id: None,
            kind: AnnotationKind::Note,
            page_number,
            title: title.into(),
            bounds,
        }
    }

    pub fn section(page_number: u32, title: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: AnnotationKind::Section,
            page_number,
            title: title.into(),
            bounds: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_persisted_values() {
        assert_eq!(DocumentStatus::Success.code(), 0);
        assert_eq!(DocumentStatus::Nofile.code(), 4);
        assert!(DocumentStatus::Readable.is_processing());
        assert!(!DocumentStatus::Error.is_processing());
    }

    #[test]
    fn permissions_are_ordered() {
        assert!(Permission::Edit > Permission::View);
        assert!(Permission::View > Permission::None);
    }

    #[test]
    fn quarter_turn_pairs_are_exact_inverses() {
        let w = Word::new("hello", 0.1234567, 0.2, 0.33333, 0.41);
        assert_eq!(w.rotated(1).rotated(3), w);
        assert_eq!(w.rotated(3).rotated(1), w);
        assert_eq!(w.rotated(2).rotated(2), w);
    }

    #[test]
    fn clockwise_rotation_moves_top_left_to_top_right() {
        let b = Bounds {
            x1: 0.0,
            y1: 0.0,
            x2: 0.2,
            y2: 0.1,
        };
        let r = b.rotated(1);
        assert_eq!(r.x1, 0.9);
        assert_eq!(r.x2, 1.0);
        assert_eq!(r.y1, 0.0);
        assert_eq!(r.y2, 0.2);
    }

    #[test]
    fn quantize_clamps() {
        assert_eq!(quantize(-0.5), 0.0);
        assert_eq!(quantize(1.5), 1.0);
        assert_eq!(quantize(f64::NAN), 0.0);
    }

    #[test]
    fn concatenated_text_is_in_page_order() {
        let file = TextFile {
            updated: 0,
            pages: vec![
                PageText {
                    page: 1,
                    contents: "second".into(),
                    ocr: None,
                    updated: 0,
                },
                PageText {
                    page: 0,
                    contents: "first".into(),
                    ocr: Some("tess4".into()),
                    updated: 0,
                },
            ],
        };
        assert_eq!(file.concatenated(), "first\n\nsecond");
    }

    #[test]
    fn word_json_has_expected_fields() {
        let w = Word::new("a", 0.0, 0.0, 0.5, 0.5);
        let json = serde_json::to_value(&w).unwrap();
        for key in ["text", "x1", "y1", "x2", "y2", "metadata"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }
}
