//! Object store keys for every persisted artifact of a document.

use crate::config::PageImageFormat;
use crate::model::{Document, DocumentId};

/// Key builder for one document's artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    id: DocumentId,
    slug: String,
}

impl ArtifactPaths {
    pub fn new(id: DocumentId, slug: impl Into<String>) -> Self {
        Self {
            id,
            slug: slug.into(),
        }
    }

    pub fn for_document(doc: &Document) -> Self {
        Self::new(doc.id, doc.slug.clone())
    }

    pub fn root(&self) -> String {
        format!("documents/{}/", self.id)
    }

    /// The uploaded file before conversion.
    pub fn original(&self, extension: &str) -> String {
        format!("{}{}.{}", self.root(), self.slug, extension)
    }

    /// The canonical PDF.
    pub fn pdf(&self) -> String {
        self.original("pdf")
    }

    pub fn text(&self) -> String {
        format!("{}{}.txt", self.root(), self.slug)
    }

    pub fn text_json(&self) -> String {
        format!("{}{}.txt.json", self.root(), self.slug)
    }

    pub fn pages_prefix(&self) -> String {
        format!("{}pages/", self.root())
    }

    pub fn page_text(&self, page: u32) -> String {
        format!("{}{}-p{}.txt", self.pages_prefix(), self.slug, page + 1)
    }

    pub fn page_positions(&self, page: u32) -> String {
        format!("{}{}-p{}.position.json", self.pages_prefix(), self.slug, page + 1)
    }

    pub fn page_image(&self, page: u32, size: &str, format: PageImageFormat) -> String {
        format!(
            "{}{}-p{}-{}.{}",
            self.pages_prefix(),
            self.slug,
            page + 1,
            size,
            format.extension()
        )
    }

    /// Scratch space for one run's rewrite of the document, written before
    /// any live artifact is touched.
    pub fn staging_prefix(&self, generation: u64) -> String {
        format!("{}staging/g{}/", self.root(), generation)
    }

    pub fn staged_pdf(&self, generation: u64) -> String {
        format!("{}{}.pdf", self.staging_prefix(generation), self.slug)
    }

    pub fn staged_manifest(&self, generation: u64) -> String {
        format!("{}manifest.json", self.staging_prefix(generation))
    }
}
