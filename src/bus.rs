//! Tasks, the static stage routing table, and the message bus.

use crate::error::PipelineError;
use crate::model::DocumentId;
use crate::modification::ModificationPlan;
use crate::redaction::RedactionSpec;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// A pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Convert,
    PageCache,
    ExtractImages,
    Ocr,
    TextPositions,
    AssembleText,
    Modify,
    Redact,
}

impl Stage {
    /// Stages that may receive follow-up work from this one.
    pub fn next(self) -> &'static [Stage] {
        match self {
            Stage::Convert | Stage::Modify | Stage::Redact => &[Stage::PageCache],
            Stage::PageCache => &[Stage::ExtractImages],
            Stage::ExtractImages => &[Stage::Ocr, Stage::TextPositions],
            Stage::Ocr => &[Stage::TextPositions],
            Stage::TextPositions => &[Stage::AssembleText],
            Stage::AssembleText => &[],
        }
    }

    /// A terminal failure in these stages fails the whole document; in the
    /// others it only fails the task's pages.
    pub fn is_document_scoped(self) -> bool {
        !matches!(
            self,
            Stage::ExtractImages | Stage::Ocr | Stage::TextPositions
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Convert => "convert",
            Stage::PageCache => "page_cache",
            Stage::ExtractImages => "extract_images",
            Stage::Ocr => "ocr",
            Stage::TextPositions => "text_positions",
            Stage::AssembleText => "assemble_text",
            Stage::Modify => "modify",
            Stage::Redact => "redact",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What kind of run a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Fresh upload or reprocessing: every page, every stage.
    #[default]
    Full,
    /// After a modification: images are regenerated, text is carried over.
    Modification,
    /// After a redaction: only the redacted pages are reprocessed.
    Redaction,
}

/// Stage-specific payload of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Work {
    Convert,
    PageCache,
    ExtractImages { pages: Vec<u32> },
    Ocr { pages: Vec<u32> },
    TextPositions { pages: Vec<u32> },
    AssembleText,
    Modify { plan: ModificationPlan },
    Redact { redactions: Vec<RedactionSpec> },
}

impl Work {
    pub fn stage(&self) -> Stage {
        match self {
            Work::Convert => Stage::Convert,
            Work::PageCache => Stage::PageCache,
            Work::ExtractImages { .. } => Stage::ExtractImages,
            Work::Ocr { .. } => Stage::Ocr,
            Work::TextPositions { .. } => Stage::TextPositions,
            Work::AssembleText => Stage::AssembleText,
            Work::Modify { .. } => Stage::Modify,
            Work::Redact { .. } => Stage::Redact,
        }
    }

    /// Pages a page-scoped task covers; empty for document-wide work.
    pub fn pages(&self) -> &[u32] {
        match self {
            Work::ExtractImages { pages } | Work::Ocr { pages } | Work::TextPositions { pages } => {
                pages
            }
            _ => &[],
        }
    }

    /// Build a page-scoped payload for `stage`.
    pub fn for_pages(stage: Stage, pages: Vec<u32>) -> Option<Work> {
        match stage {
            Stage::ExtractImages => Some(Work::ExtractImages { pages }),
            Stage::Ocr => Some(Work::Ocr { pages }),
            Stage::TextPositions => Some(Work::TextPositions { pages }),
            Stage::PageCache => Some(Work::PageCache),
            Stage::AssembleText => Some(Work::AssembleText),
            Stage::Convert | Stage::Modify | Stage::Redact => None,
        }
    }

    /// Same payload restricted to `pages`.
    pub fn with_pages(&self, pages: Vec<u32>) -> Work {
        match self {
            Work::ExtractImages { .. } => Work::ExtractImages { pages },
            Work::Ocr { .. } => Work::Ocr { pages },
            Work::TextPositions { .. } => Work::TextPositions { pages },
            other => other.clone(),
        }
    }
}

/// One unit of work on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub doc_id: DocumentId,
    pub generation: u64,
    /// Zero for the first dispatch, incremented by the retry path.
    pub attempt: u32,
    pub force_ocr: bool,
    pub mode: RunMode,
    pub work: Work,
}

impl Task {
    pub fn new(doc_id: DocumentId, generation: u64, mode: RunMode, work: Work) -> Self {
        Self {
            doc_id,
            generation,
            attempt: 0,
            force_ocr: false,
            mode,
            work,
        }
    }

    pub fn with_force_ocr(mut self, force_ocr: bool) -> Self {
        self.force_ocr = force_ocr;
        self
    }

    pub fn stage(&self) -> Stage {
        self.work.stage()
    }

    /// A sibling task in the same run carrying different work.
    pub fn follow_up(&self, work: Work) -> Task {
        Task {
            doc_id: self.doc_id,
            generation: self.generation,
            attempt: 0,
            force_ocr: self.force_ocr,
            mode: self.mode,
            work,
        }
    }

    /// This task again, one attempt later.
    pub fn retry(&self, work: Work) -> Task {
        Task {
            attempt: self.attempt + 1,
            work,
            ..self.clone()
        }
    }
}

/// Transport for tasks. Delivery is at-least-once and unordered.
#[async_trait::async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, task: Task) -> Result<(), PipelineError>;
}

/// Bus backed by a tokio channel, consumed by [`crate::Orchestrator::run`].
#[derive(Debug, Clone)]
pub struct ChannelBus {
    tx: mpsc::UnboundedSender<Task>,
}

impl ChannelBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Task>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl MessageBus for ChannelBus {
    async fn publish(&self, task: Task) -> Result<(), PipelineError> {
        self.tx
            .send(task)
            .map_err(|e| PipelineError::BusUnavailable(format!("channel closed: {e}")))
    }
}

/// Bus that just queues tasks; the caller decides when and in which order to
/// hand them to [`crate::Orchestrator::handle`].
#[derive(Debug, Default)]
pub struct QueueBus {
    queue: Mutex<VecDeque<Task>>,
}

impl QueueBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<Task> {
        self.queue.lock().ok()?.pop_front()
    }

    /// Remove and return everything queued.
    pub fn drain(&self) -> Vec<Task> {
        self.queue
            .lock()
            .map(|mut q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl MessageBus for QueueBus {
    async fn publish(&self, task: Task) -> Result<(), PipelineError> {
        self.queue
            .lock()
            .map_err(|_| PipelineError::BusUnavailable("queue lock poisoned".into()))?
            .push_back(task);
        Ok(())
    }
}
