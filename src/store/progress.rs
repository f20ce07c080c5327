//! Per-run progress: generations, page counters and per-page scratch state.
//!
//! Counters are keyed by (document, generation). Every mutating call names
//! the generation it belongs to and is ignored once that generation has been
//! retired, which is how late events from a cancelled run are dropped.
//! Each counter keeps a bitset beside its remaining count so a page is only
//! ever accounted once, whatever order or how often completions arrive.

use crate::error::PipelineError;
use crate::model::{DocumentId, PageText};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

/// The three per-page counters of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    Images,
    Texts,
    Positions,
}

impl Counter {
    pub const ALL: [Counter; 3] = [Counter::Images, Counter::Texts, Counter::Positions];

    fn index(self) -> usize {
        match self {
            Counter::Images => 0,
            Counter::Texts => 1,
            Counter::Positions => 2,
        }
    }
}

/// Which pages a run has to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagePlan {
    /// Every page in every counter.
    Full,
    /// Images only; text and positions are carried over.
    ImagesOnly,
    /// Only these pages; every other page is already accounted.
    Only(BTreeSet<u32>),
}

/// Result of marking pages on a counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The generation is no longer current; nothing was recorded.
    Stale,
    Recorded(MarkResult),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkResult {
    /// Pages accounted by this call; duplicates are left out.
    pub newly: Vec<u32>,
    /// Pages still unaccounted on this counter.
    pub remaining: u32,
    /// Newly accounted pages that are now complete on every counter.
    pub completed: Vec<u32>,
}

/// Pages still to do, per counter, for the progress query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remaining {
    pub images: u32,
    pub texts: u32,
    pub text_positions: u32,
    pub pages: u32,
}

impl Remaining {
    pub fn is_settled(&self) -> bool {
        self.images == 0 && self.texts == 0 && self.text_positions == 0
    }
}

/// Externally persisted run state.
///
/// Implementations must make each call atomic; callers never hold state
/// between calls.
#[async_trait::async_trait]
pub trait ProgressStore: Send + Sync {
    /// Retire any active run and start a new generation.
    async fn begin_run(&self, doc: DocumentId) -> Result<u64, PipelineError>;

    /// Active generation, `None` when no run is in flight.
    async fn current_generation(&self, doc: DocumentId) -> Result<Option<u64>, PipelineError>;

    /// Retire `generation` if it is the active one. Returns whether it was.
    async fn end_run(&self, doc: DocumentId, generation: u64) -> Result<bool, PipelineError>;

    /// Retire whatever run is active and return its generation.
    async fn cancel(&self, doc: DocumentId) -> Result<Option<u64>, PipelineError>;

    /// Start the page counters. Returns `false` when the generation is stale
    /// or its counters already exist.
    async fn init_pages(
        &self,
        doc: DocumentId,
        generation: u64,
        page_count: u32,
        plan: PagePlan,
    ) -> Result<bool, PipelineError>;

    async fn is_initialized(&self, doc: DocumentId, generation: u64)
        -> Result<bool, PipelineError>;

    /// Record that the run's rewrite is fully staged and live artifacts may
    /// now be overwritten. Returns `false` for a stale generation.
    async fn mark_staged(&self, doc: DocumentId, generation: u64)
        -> Result<bool, PipelineError>;

    async fn is_staged(&self, doc: DocumentId, generation: u64) -> Result<bool, PipelineError>;

    /// Account `pages` on `counter`.
    async fn mark(
        &self,
        doc: DocumentId,
        generation: u64,
        counter: Counter,
        pages: &[u32],
    ) -> Result<MarkOutcome, PipelineError>;

    /// Give up on `pages`: account them on every counter and remember them
    /// as failed. Returns the pages that were not already failed, or `None`
    /// for a stale generation.
    async fn mark_failed(
        &self,
        doc: DocumentId,
        generation: u64,
        pages: &[u32],
    ) -> Result<Option<Vec<u32>>, PipelineError>;

    /// The subset of `pages` not yet accounted on `counter`. Empty when stale.
    async fn unmarked(
        &self,
        doc: DocumentId,
        generation: u64,
        counter: Counter,
        pages: &[u32],
    ) -> Result<Vec<u32>, PipelineError>;

    async fn failed_pages(
        &self,
        doc: DocumentId,
        generation: u64,
    ) -> Result<BTreeSet<u32>, PipelineError>;

    /// Remaining counts of the active run.
    async fn remaining(&self, doc: DocumentId) -> Result<Option<Remaining>, PipelineError>;

    async fn put_page_text(
        &self,
        doc: DocumentId,
        generation: u64,
        text: PageText,
    ) -> Result<(), PipelineError>;

    async fn page_text(
        &self,
        doc: DocumentId,
        generation: u64,
        page: u32,
    ) -> Result<Option<PageText>, PipelineError>;

    /// All page text records of the run, in page order.
    async fn page_texts(
        &self,
        doc: DocumentId,
        generation: u64,
    ) -> Result<Vec<PageText>, PipelineError>;

    async fn put_dimension(
        &self,
        doc: DocumentId,
        generation: u64,
        page: u32,
        key: String,
    ) -> Result<(), PipelineError>;

    async fn dimensions(
        &self,
        doc: DocumentId,
        generation: u64,
    ) -> Result<BTreeMap<u32, String>, PipelineError>;

    /// One-shot test-and-set; only the first caller of a generation gets `true`.
    async fn claim_assembly(&self, doc: DocumentId, generation: u64)
        -> Result<bool, PipelineError>;
}

// ── In-memory implementation ─────────────────────────────────────────────

struct Counters {
    page_count: u32,
    bits: [Vec<bool>; 3],
    remaining: [u32; 3],
    failed: BTreeSet<u32>,
}

impl Counters {
    fn new(page_count: u32, plan: &PagePlan) -> Self {
        let n = page_count as usize;
        let bits = match plan {
            PagePlan::Full => [vec![false; n], vec![false; n], vec![false; n]],
            PagePlan::ImagesOnly => [vec![false; n], vec![true; n], vec![true; n]],
            PagePlan::Only(pages) => {
                let b: Vec<bool> = (0..page_count).map(|p| !pages.contains(&p)).collect();
                [b.clone(), b.clone(), b]
            }
        };
        let remaining = [0, 1, 2].map(|i| bits[i].iter().filter(|b| !**b).count() as u32);
        Self {
            page_count,
            bits,
            remaining,
            failed: BTreeSet::new(),
        }
    }

    fn is_set(&self, counter: usize, page: u32) -> bool {
        self.bits[counter]
            .get(page as usize)
            .copied()
            .unwrap_or(true)
    }

    /// Set a bit; true when it was newly set.
    fn set(&mut self, counter: usize, page: u32) -> bool {
        match self.bits[counter].get_mut(page as usize) {
            Some(bit) if !*bit => {
                *bit = true;
                self.remaining[counter] -= 1;
                true
            }
            _ => false,
        }
    }

    fn is_complete(&self, page: u32) -> bool {
        !self.failed.contains(&page) && (0..3).all(|c| self.is_set(c, page))
    }
}

#[derive(Default)]
struct Run {
    generation: u64,
    counters: Option<Counters>,
    texts: BTreeMap<u32, PageText>,
    dimensions: BTreeMap<u32, String>,
    staged: bool,
    assembly_claimed: bool,
}

#[derive(Default)]
struct DocRuns {
    last_generation: u64,
    active: Option<Run>,
}

/// [`ProgressStore`] kept in process memory behind a mutex.
#[derive(Default)]
pub struct MemoryProgressStore {
    docs: Mutex<HashMap<DocumentId, DocRuns>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn docs(&self) -> Result<MutexGuard<'_, HashMap<DocumentId, DocRuns>>, PipelineError> {
        self.docs
            .lock()
            .map_err(|_| PipelineError::Internal("progress store lock poisoned".into()))
    }

    /// Run `f` on the active run of `generation`, or return `stale`.
    fn with_run<T>(
        &self,
        doc: DocumentId,
        generation: u64,
        stale: T,
        f: impl FnOnce(&mut Run) -> T,
    ) -> Result<T, PipelineError> {
        let mut docs = self.docs()?;
        match docs.get_mut(&doc).and_then(|d| d.active.as_mut()) {
            Some(run) if run.generation == generation => Ok(f(run)),
            _ => Ok(stale),
        }
    }
}

#[async_trait::async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn begin_run(&self, doc: DocumentId) -> Result<u64, PipelineError> {
        let mut docs = self.docs()?;
        let runs = docs.entry(doc).or_default();
        runs.last_generation += 1;
        runs.active = Some(Run {
            generation: runs.last_generation,
            ..Default::default()
        });
        Ok(runs.last_generation)
    }

    async fn current_generation(&self, doc: DocumentId) -> Result<Option<u64>, PipelineError> {
        Ok(self
            .docs()?
            .get(&doc)
            .and_then(|d| d.active.as_ref())
            .map(|r| r.generation))
    }

    async fn end_run(&self, doc: DocumentId, generation: u64) -> Result<bool, PipelineError> {
        let mut docs = self.docs()?;
        match docs.get_mut(&doc) {
            Some(runs) if runs.active.as_ref().map(|r| r.generation) == Some(generation) => {
                runs.active = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel(&self, doc: DocumentId) -> Result<Option<u64>, PipelineError> {
        Ok(self
            .docs()?
            .get_mut(&doc)
            .and_then(|d| d.active.take())
            .map(|r| r.generation))
    }

    async fn init_pages(
        &self,
        doc: DocumentId,
        generation: u64,
        page_count: u32,
        plan: PagePlan,
    ) -> Result<bool, PipelineError> {
        self.with_run(doc, generation, false, |run| {
            if run.counters.is_some() {
                return false;
            }
            run.counters = Some(Counters::new(page_count, &plan));
            true
        })
    }

    async fn is_initialized(
        &self,
        doc: DocumentId,
        generation: u64,
    ) -> Result<bool, PipelineError> {
        self.with_run(doc, generation, false, |run| run.counters.is_some())
    }

    async fn mark_staged(&self, doc: DocumentId, generation: u64) -> Result<bool, PipelineError> {
        self.with_run(doc, generation, false, |run| {
            run.staged = true;
            true
        })
    }

    async fn is_staged(&self, doc: DocumentId, generation: u64) -> Result<bool, PipelineError> {
        self.with_run(doc, generation, false, |run| run.staged)
    }

    async fn mark(
        &self,
        doc: DocumentId,
        generation: u64,
        counter: Counter,
        pages: &[u32],
    ) -> Result<MarkOutcome, PipelineError> {
        self.with_run(doc, generation, MarkOutcome::Stale, |run| {
            let Some(counters) = run.counters.as_mut() else {
                return MarkOutcome::Stale;
            };
            let idx = counter.index();
            let mut result = MarkResult::default();
            for &page in pages {
                if counters.set(idx, page) {
                    result.newly.push(page);
                    if counters.is_complete(page) {
                        result.completed.push(page);
                    }
                }
            }
            result.remaining = counters.remaining[idx];
            MarkOutcome::Recorded(result)
        })
    }

    async fn mark_failed(
        &self,
        doc: DocumentId,
        generation: u64,
        pages: &[u32],
    ) -> Result<Option<Vec<u32>>, PipelineError> {
        self.with_run(doc, generation, None, |run| {
            let counters = run.counters.as_mut()?;
            let mut newly = Vec::new();
            for &page in pages {
                if page >= counters.page_count || !counters.failed.insert(page) {
                    continue;
                }
                for c in 0..3 {
                    counters.set(c, page);
                }
                newly.push(page);
            }
            Some(newly)
        })
    }

    async fn unmarked(
        &self,
        doc: DocumentId,
        generation: u64,
        counter: Counter,
        pages: &[u32],
    ) -> Result<Vec<u32>, PipelineError> {
        self.with_run(doc, generation, Vec::new(), |run| match &run.counters {
            Some(c) => pages
                .iter()
                .copied()
                .filter(|&p| !c.is_set(counter.index(), p))
                .collect(),
            None => Vec::new(),
        })
    }

    async fn failed_pages(
        &self,
        doc: DocumentId,
        generation: u64,
    ) -> Result<BTreeSet<u32>, PipelineError> {
        self.with_run(doc, generation, BTreeSet::new(), |run| {
            run.counters
                .as_ref()
                .map(|c| c.failed.clone())
                .unwrap_or_default()
        })
    }

    async fn remaining(&self, doc: DocumentId) -> Result<Option<Remaining>, PipelineError> {
        let docs = self.docs()?;
        let Some(run) = docs.get(&doc).and_then(|d| d.active.as_ref()) else {
            return Ok(None);
        };
        Ok(run.counters.as_ref().map(|c| Remaining {
            images: c.remaining[0],
            texts: c.remaining[1],
            text_positions: c.remaining[2],
            pages: c.page_count,
        }))
    }

    async fn put_page_text(
        &self,
        doc: DocumentId,
        generation: u64,
        text: PageText,
    ) -> Result<(), PipelineError> {
        self.with_run(doc, generation, (), |run| {
            run.texts.insert(text.page, text);
        })
    }

    async fn page_text(
        &self,
        doc: DocumentId,
        generation: u64,
        page: u32,
    ) -> Result<Option<PageText>, PipelineError> {
        self.with_run(doc, generation, None, |run| run.texts.get(&page).cloned())
    }

    async fn page_texts(
        &self,
        doc: DocumentId,
        generation: u64,
    ) -> Result<Vec<PageText>, PipelineError> {
        self.with_run(doc, generation, Vec::new(), |run| {
            run.texts.values().cloned().collect()
        })
    }

    async fn put_dimension(
        &self,
        doc: DocumentId,
        generation: u64,
        page: u32,
        key: String,
    ) -> Result<(), PipelineError> {
        self.with_run(doc, generation, (), |run| {
            run.dimensions.insert(page, key);
        })
    }

    async fn dimensions(
        &self,
        doc: DocumentId,
        generation: u64,
    ) -> Result<BTreeMap<u32, String>, PipelineError> {
        self.with_run(doc, generation, BTreeMap::new(), |run| {
            run.dimensions.clone()
        })
    }

    async fn claim_assembly(
        &self,
        doc: DocumentId,
        generation: u64,
    ) -> Result<bool, PipelineError> {
        self.with_run(doc, generation, false, |run| {
            !std::mem::replace(&mut run.assembly_claimed, true)
        })
    }
}
