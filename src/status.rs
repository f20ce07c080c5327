//! Document status state machine.
//!
//! ```text
//! nofile ──▶ pending ──▶ readable ──▶ success
//!               │           │
//!               └───────────┴───────▶ error
//! success / error ──(reprocess)──▶ pending
//! ```

use crate::error::PipelineError;
use crate::model::{Document, DocumentId, DocumentStatus, DocumentUpdate};
use crate::store::DocumentStore;
use tracing::{debug, info};

/// Whether the state machine allows `from → to`.
pub fn can_transition(from: DocumentStatus, to: DocumentStatus) -> bool {
    use DocumentStatus::*;
    matches!(
        (from, to),
        (Nofile, Pending)
            | (Pending, Readable)
            | (Pending, Success)
            | (Pending, Error)
            | (Readable, Success)
            | (Readable, Error)
            | (Success, Pending)
            | (Error, Pending)
    )
}

/// Applies status changes through a [`DocumentStore`].
pub struct StatusTracker<'a> {
    documents: &'a dyn DocumentStore,
}

impl<'a> StatusTracker<'a> {
    pub fn new(documents: &'a dyn DocumentStore) -> Self {
        Self { documents }
    }

    /// Move `id` to `to`, rejecting transitions the state machine forbids.
    pub async fn transition(
        &self,
        id: DocumentId,
        to: DocumentStatus,
        action: &'static str,
    ) -> Result<Document, PipelineError> {
        let doc = self.documents.get(id).await?;
        if !can_transition(doc.status, to) {
            return Err(PipelineError::InvalidState {
                id,
                status: doc.status,
                action,
            });
        }
        info!("Document {}: {} → {}", id, doc.status, to);
        self.documents
            .update(id, DocumentUpdate::status(to))
            .await
    }

    /// `pending → readable` once the first page is complete. No-op otherwise.
    pub async fn mark_readable(&self, id: DocumentId) -> Result<bool, PipelineError> {
        let doc = self.documents.get(id).await?;
        if doc.status != DocumentStatus::Pending {
            return Ok(false);
        }
        debug!("Document {}: first page complete, now readable", id);
        self.documents
            .update(id, DocumentUpdate::status(DocumentStatus::Readable))
            .await?;
        Ok(true)
    }

    /// End a run: `success`, or `error` when `failed` is set.
    pub async fn finish(&self, id: DocumentId, failed: bool) -> Result<DocumentStatus, PipelineError> {
        let to = if failed {
            DocumentStatus::Error
        } else {
            DocumentStatus::Success
        };
        self.transition(id, to, "finish processing").await?;
        Ok(to)
    }

    /// Append `message` to the error log and move to `error` when allowed.
    pub async fn fail(&self, id: DocumentId, message: &str) -> Result<(), PipelineError> {
        self.documents.append_error(id, message).await?;
        let doc = self.documents.get(id).await?;
        if can_transition(doc.status, DocumentStatus::Error) {
            info!("Document {}: {} → error ({})", id, doc.status, message);
            self.documents
                .update(id, DocumentUpdate::status(DocumentStatus::Error))
                .await?;
        }
        Ok(())
    }

    /// Most recent error message, the one surfaced to users.
    pub async fn current_error(&self, id: DocumentId) -> Result<Option<String>, PipelineError> {
        Ok(self
            .documents
            .errors(id)
            .await?
            .pop()
            .map(|e| e.message))
    }
}
