//! Document metadata, permissions, error log and annotations.

use crate::error::PipelineError;
use crate::model::{
    Access, Annotation, AnnotationId, Document, DocumentId, DocumentUpdate, ErrorRecord,
    Permission, UserId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Relational side of the system as seen by the pipeline.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, id: DocumentId) -> Result<Document, PipelineError>;

    /// Apply a partial update and return the new record.
    async fn update(
        &self,
        id: DocumentId,
        update: DocumentUpdate,
    ) -> Result<Document, PipelineError>;

    /// Append to the document's error log.
    async fn append_error(
        &self,
        id: DocumentId,
        message: &str,
    ) -> Result<ErrorRecord, PipelineError>;

    /// Full error history, oldest first.
    async fn errors(&self, id: DocumentId) -> Result<Vec<ErrorRecord>, PipelineError>;

    async fn permission(
        &self,
        user: UserId,
        id: DocumentId,
    ) -> Result<Permission, PipelineError>;

    async fn annotations(&self, id: DocumentId) -> Result<Vec<Annotation>, PipelineError>;

    /// Replace every annotation of a document. Entries without an id get one.
    async fn replace_annotations(
        &self,
        id: DocumentId,
        annotations: Vec<Annotation>,
    ) -> Result<Vec<Annotation>, PipelineError>;
}

#[derive(Default)]
struct Records {
    documents: HashMap<DocumentId, Document>,
    errors: HashMap<DocumentId, Vec<ErrorRecord>>,
    annotations: HashMap<DocumentId, Vec<Annotation>>,
    grants: HashMap<(UserId, DocumentId), Permission>,
}

/// In-memory [`DocumentStore`].
///
/// Owners may edit their documents, public documents are viewable by anyone,
/// anything else needs an explicit [`grant`](Self::grant).
#[derive(Default)]
pub struct MemoryDocumentStore {
    records: Mutex<Records>,
    next_annotation_id: AtomicU64,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, doc: Document) -> Result<(), PipelineError> {
        self.records()?.documents.insert(doc.id, doc);
        Ok(())
    }

    pub fn grant(
        &self,
        user: UserId,
        id: DocumentId,
        permission: Permission,
    ) -> Result<(), PipelineError> {
        self.records()?.grants.insert((user, id), permission);
        Ok(())
    }

    /// Attach one annotation and return its id.
    pub fn add_annotation(
        &self,
        id: DocumentId,
        mut annotation: Annotation,
    ) -> Result<AnnotationId, PipelineError> {
        let ann_id = self.next_annotation_id.fetch_add(1, Ordering::SeqCst) + 1;
        annotation.id = Some(ann_id);
        self.records()?
            .annotations
            .entry(id)
            .or_default()
            .push(annotation);
        Ok(ann_id)
    }

    fn records(&self) -> Result<MutexGuard<'_, Records>, PipelineError> {
        self.records
            .lock()
            .map_err(|_| PipelineError::Internal("document store lock poisoned".into()))
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, id: DocumentId) -> Result<Document, PipelineError> {
        self.records()?
            .documents
            .get(&id)
            .cloned()
            .ok_or(PipelineError::DocumentNotFound { id })
    }

    async fn update(
        &self,
        id: DocumentId,
        update: DocumentUpdate,
    ) -> Result<Document, PipelineError> {
        let mut records = self.records()?;
        let doc = records
            .documents
            .get_mut(&id)
            .ok_or(PipelineError::DocumentNotFound { id })?;
        update.apply(doc);
        Ok(doc.clone())
    }

    async fn append_error(
        &self,
        id: DocumentId,
        message: &str,
    ) -> Result<ErrorRecord, PipelineError> {
        let mut records = self.records()?;
        if !records.documents.contains_key(&id) {
            return Err(PipelineError::DocumentNotFound { id });
        }
        let record = ErrorRecord::new(message);
        records.errors.entry(id).or_default().push(record.clone());
        Ok(record)
    }

    async fn errors(&self, id: DocumentId) -> Result<Vec<ErrorRecord>, PipelineError> {
        Ok(self
            .records()?
            .errors
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn permission(
        &self,
        user: UserId,
        id: DocumentId,
    ) -> Result<Permission, PipelineError> {
        let records = self.records()?;
        let doc = records
            .documents
            .get(&id)
            .ok_or(PipelineError::DocumentNotFound { id })?;
        if doc.owner == user {
            return Ok(Permission::Edit);
        }
        let implicit = match doc.access {
            Access::Public => Permission::View,
            _ => Permission::None,
        };
        let granted = records
            .grants
            .get(&(user, id))
            .copied()
            .unwrap_or(Permission::None);
        Ok(implicit.max(granted))
    }

    async fn annotations(&self, id: DocumentId) -> Result<Vec<Annotation>, PipelineError> {
        Ok(self
            .records()?
            .annotations
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_annotations(
        &self,
        id: DocumentId,
        annotations: Vec<Annotation>,
    ) -> Result<Vec<Annotation>, PipelineError> {
        let stored: Vec<Annotation> = annotations
            .into_iter()
            .map(|mut a| {
                if a.id.is_none() {
                    a.id = Some(self.next_annotation_id.fetch_add(1, Ordering::SeqCst) + 1);
                }
                a
            })
            .collect();
        self.records()?.annotations.insert(id, stored.clone());
        Ok(stored)
    }
}
