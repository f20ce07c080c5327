//! In-memory fakes shared by the integration tests.
//!
//! A fake "PDF" is `%PDF-FAKE\n` followed by JSON describing its pages.
//! Every page renders as a solid colour that encodes its id, so the fake OCR
//! engine can tell which page it was shown even after recomposition.

#![allow(dead_code)]

use docflow::engine::{ComposePage, PageInfo, PdfEngine, PdfPages};
use docflow::ocr::{OcrEngine, OcrOutput};
use docflow::paths::ArtifactPaths;
use docflow::pipeline::DocumentConverter;
use docflow::store::{
    get_json, DocumentStore, MemoryDocumentStore, MemoryObjectStore, ObjectStore,
};
use docflow::{
    Document, DocumentId, PageImageFormat, PipelineConfig, PipelineConfigBuilder,
    PipelineError, QueueBus, RedactionSpec, SizeClass, Task, TextFile, Word,
};
use docflow::Orchestrator;
use image::{DynamicImage, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const OWNER: u64 = 10;
const HEADER: &[u8] = b"%PDF-FAKE\n";

// ── Fake PDFs ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FakePage {
    pub id: u32,
    pub width: f32,
    pub height: f32,
    /// Embedded text; empty for a scanned page.
    pub text: String,
    #[serde(default)]
    pub quarter_turns: u8,
    #[serde(default)]
    pub flattened: bool,
}

impl FakePage {
    pub fn text(id: u32, text: impl Into<String>) -> Self {
        Self {
            id,
            width: 612.0,
            height: 792.0,
            text: text.into(),
            quarter_turns: 0,
            flattened: false,
        }
    }

    pub fn scanned(id: u32) -> Self {
        Self::text(id, "")
    }

    pub fn sized(mut self, width: f32, height: f32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

/// `n` pages with embedded text `text of page {i}`.
pub fn text_pages(n: u32) -> Vec<FakePage> {
    (0..n).map(|i| FakePage::text(i, format!("text of page {i}"))).collect()
}

pub fn scanned_pages(n: u32) -> Vec<FakePage> {
    (0..n).map(FakePage::scanned).collect()
}

pub fn fake_pdf(pages: &[FakePage]) -> Vec<u8> {
    let mut out = HEADER.to_vec();
    out.extend(serde_json::to_vec(pages).unwrap());
    out
}

pub fn parse_fake_pdf(bytes: &[u8]) -> Result<Vec<FakePage>, PipelineError> {
    let body = bytes
        .strip_prefix(HEADER)
        .ok_or_else(|| PipelineError::CorruptPdf("not a fake pdf".into()))?;
    serde_json::from_slice(body).map_err(|e| PipelineError::CorruptPdf(e.to_string()))
}

fn colour_of(id: u32) -> Rgb<u8> {
    Rgb([(id % 256) as u8, (id / 256) as u8, 200])
}

/// Page id encoded in a rendered page image.
pub fn id_of(image: &DynamicImage) -> u32 {
    let rgb = image.to_rgb8();
    let px = rgb.get_pixel(rgb.width() / 2, rgb.height() / 2);
    px[0] as u32 + px[1] as u32 * 256
}

/// Words of an embedded text, spread evenly over a band of the page.
pub fn words_of(text: &str) -> Vec<Word> {
    let parts: Vec<&str> = text.split_whitespace().collect();
    let n = parts.len() as f64;
    parts
        .iter()
        .enumerate()
        .map(|(i, w)| Word::new(*w, i as f64 / n, 0.25, (i + 1) as f64 / n, 0.5))
        .collect()
}

struct FakeDocument {
    pages: Vec<FakePage>,
}

impl FakeDocument {
    fn page(&self, page: u32) -> Result<&FakePage, PipelineError> {
        self.pages
            .get(page as usize)
            .ok_or_else(|| PipelineError::RenderFailed {
                page,
                detail: "no such page".into(),
            })
    }
}

impl PdfPages for FakeDocument {
    fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    fn page_info(&self, page: u32) -> Result<PageInfo, PipelineError> {
        let p = self.page(page)?;
        Ok(if p.quarter_turns % 2 == 1 {
            PageInfo {
                width: p.height,
                height: p.width,
            }
        } else {
            PageInfo {
                width: p.width,
                height: p.height,
            }
        })
    }

    fn render(&self, page: u32, width: u32) -> Result<DynamicImage, PipelineError> {
        let height = self.page_info(page)?.height_at(width);
        let colour = colour_of(self.page(page)?.id);
        Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            width, height, colour,
        )))
    }

    fn text(&self, page: u32) -> Result<String, PipelineError> {
        Ok(self.page(page)?.text.clone())
    }

    fn words(&self, page: u32) -> Result<Vec<Word>, PipelineError> {
        Ok(words_of(&self.page(page)?.text))
    }
}

/// [`PdfEngine`] over fake PDFs, counting the rewrites it performs.
#[derive(Default)]
pub struct FakeEngine {
    composes: AtomicUsize,
    flattens: AtomicUsize,
}

impl FakeEngine {
    pub fn composes(&self) -> usize {
        self.composes.load(Ordering::SeqCst)
    }

    pub fn flattens(&self) -> usize {
        self.flattens.load(Ordering::SeqCst)
    }
}

impl PdfEngine for FakeEngine {
    fn with_document(
        &self,
        pdf: &[u8],
        f: &mut dyn FnMut(&dyn PdfPages) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        let doc = FakeDocument {
            pages: parse_fake_pdf(pdf)?,
        };
        f(&doc)
    }

    fn compose(&self, sources: &[&[u8]], pages: &[ComposePage]) -> Result<Vec<u8>, PipelineError> {
        self.composes.fetch_add(1, Ordering::SeqCst);
        let parsed: Vec<Vec<FakePage>> = sources
            .iter()
            .map(|s| parse_fake_pdf(s))
            .collect::<Result<_, _>>()?;
        let mut out = Vec::with_capacity(pages.len());
        for p in pages {
            let mut page = parsed
                .get(p.source)
                .and_then(|s| s.get(p.page as usize))
                .cloned()
                .ok_or_else(|| PipelineError::Internal("compose: missing page".into()))?;
            page.quarter_turns = (page.quarter_turns + p.quarter_turns) % 4;
            out.push(page);
        }
        Ok(fake_pdf(&out))
    }

    fn flatten_redactions(
        &self,
        pdf: &[u8],
        redactions: &[RedactionSpec],
        _width: u32,
    ) -> Result<Vec<u8>, PipelineError> {
        self.flattens.fetch_add(1, Ordering::SeqCst);
        let mut pages = parse_fake_pdf(pdf)?;
        for r in redactions {
            if let Some(page) = pages.get_mut(r.page_number as usize) {
                page.text.clear();
                page.flattened = true;
            }
        }
        Ok(fake_pdf(&pages))
    }

    fn graft_text(&self, pdf: &[u8], pages: &[(u32, Vec<Word>)]) -> Result<Vec<u8>, PipelineError> {
        let mut parsed = parse_fake_pdf(pdf)?;
        for (page, words) in pages {
            if let Some(p) = parsed.get_mut(*page as usize) {
                let text: Vec<&str> = words.iter().map(|w| w.text.as_str()).collect();
                p.text = text.join(" ");
            }
        }
        Ok(fake_pdf(&parsed))
    }
}

// ── Fake OCR ─────────────────────────────────────────────────────────────

/// OCR engine reading the page id off the rendered colour.
#[derive(Default)]
pub struct FakeOcr {
    calls: AtomicUsize,
    failing: Mutex<HashSet<u32>>,
    throttled: Mutex<HashMap<u32, u32>>,
}

impl FakeOcr {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every recognition of page `id` fails.
    pub fn fail_page(&self, id: u32) {
        self.failing.lock().unwrap().insert(id);
    }

    /// The next `times` recognitions of page `id` are throttled.
    pub fn throttle_page(&self, id: u32, times: u32) {
        self.throttled.lock().unwrap().insert(id, times);
    }
}

pub fn ocr_text(id: u32) -> String {
    format!("scanned page {id}")
}

#[async_trait::async_trait]
impl OcrEngine for FakeOcr {
    fn identifier(&self) -> String {
        "tess4".to_string()
    }

    async fn recognize(
        &self,
        image: &DynamicImage,
        _language: &str,
    ) -> Result<OcrOutput, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = id_of(image);
        if self.failing.lock().unwrap().contains(&id) {
            return Err(PipelineError::OcrFailed {
                page: 0,
                detail: format!("unreadable scan {id}"),
            });
        }
        if let Some(left) = self.throttled.lock().unwrap().get_mut(&id) {
            if *left > 0 {
                *left -= 1;
                return Err(PipelineError::Throttled {
                    service: "fake-ocr".into(),
                });
            }
        }
        Ok(OcrOutput {
            text: ocr_text(id),
            words: vec![
                Word::new("scanned", 0.125, 0.25, 0.5, 0.375),
                Word::new("page", 0.5, 0.25, 0.75, 0.375),
            ],
        })
    }
}

// ── Fake converter ───────────────────────────────────────────────────────

/// Turns each line of a text file into a page; inputs starting with
/// `corrupt` fail.
pub struct FakeConverter;

#[async_trait::async_trait]
impl DocumentConverter for FakeConverter {
    async fn convert(&self, input: &[u8], extension: &str) -> Result<Vec<u8>, PipelineError> {
        let text = String::from_utf8_lossy(input);
        if text.starts_with("corrupt") {
            return Err(PipelineError::ConversionFailed(format!(
                "cannot read .{extension} input"
            )));
        }
        let pages: Vec<FakePage> = text
            .lines()
            .enumerate()
            .map(|(i, line)| FakePage::text(i as u32, line))
            .collect();
        Ok(fake_pdf(&pages))
    }
}

// ── Harness ──────────────────────────────────────────────────────────────

/// Small images and batches so every test spans several tasks.
pub fn test_config() -> PipelineConfigBuilder {
    PipelineConfig::builder()
        .size_classes(vec![SizeClass::new("large", 48), SizeClass::new("small", 12)])
        .ocr_size_class("large")
        .image_format(PageImageFormat::Png)
        .image_batch(3)
        .ocr_batch(2)
        .text_position_batch(2)
        .retry_backoff_ms(1)
}

/// An orchestrator over fakes, driven one task at a time from a queue.
pub struct Harness {
    pub orch: Orchestrator,
    pub bus: Arc<QueueBus>,
    pub documents: Arc<MemoryDocumentStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub engine: Arc<FakeEngine>,
    pub ocr: Arc<FakeOcr>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config().build().unwrap())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        let bus = Arc::new(QueueBus::new());
        let documents = Arc::new(MemoryDocumentStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let engine = Arc::new(FakeEngine::default());
        let ocr = Arc::new(FakeOcr::default());
        let orch = Orchestrator::builder(config)
            .bus(bus.clone())
            .documents(documents.clone())
            .objects(objects.clone())
            .engine(engine.clone())
            .ocr(ocr.clone())
            .converter(Arc::new(FakeConverter))
            .build()
            .unwrap();
        Self {
            orch,
            bus,
            documents,
            objects,
            engine,
            ocr,
        }
    }

    pub fn add_document(&self, id: DocumentId) {
        self.documents
            .insert(Document::new(id, format!("doc-{id}"), OWNER))
            .unwrap();
    }

    /// Create document `id` and upload a fake PDF of `pages`.
    pub async fn upload_pages(&self, id: DocumentId, pages: &[FakePage]) {
        self.add_document(id);
        self.orch.upload(id, fake_pdf(pages), "pdf").await.unwrap();
    }

    /// Handle the next queued task.
    pub async fn step(&self) -> Option<Task> {
        let task = self.bus.pop()?;
        self.orch.handle(task.clone()).await.unwrap();
        Some(task)
    }

    /// Handle tasks until the queue is empty. Returns how many ran.
    pub async fn drain(&self) -> usize {
        let mut handled = 0;
        while self.step().await.is_some() {
            handled += 1;
            assert!(handled < 100_000, "pipeline did not settle");
        }
        handled
    }

    /// Upload, trigger and run a document to completion.
    pub async fn process(&self, id: DocumentId, pages: &[FakePage]) -> Document {
        self.upload_pages(id, pages).await;
        self.orch.trigger_processing(id, false).await.unwrap();
        self.drain().await;
        self.doc(id).await
    }

    pub async fn doc(&self, id: DocumentId) -> Document {
        self.documents.get(id).await.unwrap()
    }

    pub async fn paths(&self, id: DocumentId) -> ArtifactPaths {
        ArtifactPaths::for_document(&self.doc(id).await)
    }

    pub async fn text_file(&self, id: DocumentId) -> TextFile {
        let key = self.paths(id).await.text_json();
        get_json(self.objects.as_ref(), &key).await.unwrap()
    }

    pub async fn full_text(&self, id: DocumentId) -> String {
        let key = self.paths(id).await.text();
        String::from_utf8(self.objects.get(&key).await.unwrap()).unwrap()
    }

    pub async fn page_text(&self, id: DocumentId, page: u32) -> Option<String> {
        let key = self.paths(id).await.page_text(page);
        self.objects
            .get(&key)
            .await
            .ok()
            .map(|b| String::from_utf8(b).unwrap())
    }

    pub async fn positions(&self, id: DocumentId, page: u32) -> Option<Vec<Word>> {
        let key = self.paths(id).await.page_positions(page);
        get_json(self.objects.as_ref(), &key).await.ok()
    }

    /// Raw bytes of a page's text and position artifacts.
    pub async fn page_artifacts(&self, id: DocumentId, page: u32) -> (Vec<u8>, Vec<u8>) {
        let paths = self.paths(id).await;
        (
            self.objects.get(&paths.page_text(page)).await.unwrap(),
            self.objects.get(&paths.page_positions(page)).await.unwrap(),
        )
    }

    /// Pages of the live PDF.
    pub async fn pdf_pages(&self, id: DocumentId) -> Vec<FakePage> {
        let key = self.paths(id).await.pdf();
        parse_fake_pdf(&self.objects.get(&key).await.unwrap()).unwrap()
    }

    /// Keys left under any document's staging area.
    pub fn staged_keys(&self) -> Vec<String> {
        self.objects
            .keys()
            .into_iter()
            .filter(|k| k.contains("/staging/"))
            .collect()
    }

    /// Page id shown by a stored page image.
    pub async fn image_id(&self, id: DocumentId, page: u32) -> u32 {
        let key = self
            .paths(id)
            .await
            .page_image(page, "large", PageImageFormat::Png);
        let bytes = self.objects.get(&key).await.unwrap();
        id_of(&image::load_from_memory(&bytes).unwrap())
    }

    pub async fn errors(&self, id: DocumentId) -> Vec<String> {
        self.documents
            .errors(id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect()
    }
}
