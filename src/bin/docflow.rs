//! CLI binary for docflow.
//!
//! Runs one document through the pipeline on the local machine: a
//! filesystem object store, in-memory metadata and progress, and a channel
//! bus drained by an in-process worker loop.

use anyhow::{Context, Result};
use clap::Parser;
use docflow::engine::{PdfEngine, PdfiumEngine};
use docflow::input::{self, FALLBACK_EXTENSION};
use docflow::ocr::{OcrEngine, TesseractEngine, VlmOcrEngine};
use docflow::paths::ArtifactPaths;
use docflow::pipeline::LibreOfficeConverter;
use docflow::store::{get_json, DocumentStore, LocalObjectStore, MemoryDocumentStore, ObjectStore};
use docflow::{
    pagespec, ChannelBus, Document, DocumentId, DocumentStatus, ErrorRecord, ModificationSpec,
    Orchestrator, PageImageFormat, PipelineConfig, PipelineProgressCallback, ProgressCallback,
    RedactionSpec, SizeClass, Stage, TextFile,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// The CLI works on a single document owned by a single user.
const DOC_ID: DocumentId = 1;
const USER_ID: u64 = 1;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: one bar counting rendered pages, a log line per stage
/// batch and per page error. Batches complete out of order.
struct CliProgressCallback {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("waiting for the page cache…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_run_start(&self, _doc_id: DocumentId, generation: u64) {
        self.bar.set_position(0);
        self.bar
            .println(format!("{} {}", cyan("◆"), bold(&format!("Run {generation} started"))));
    }

    fn on_pages_known(&self, _doc_id: DocumentId, page_count: u32) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        self.bar.set_length(page_count as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Processing");
        self.bar.set_message("");
    }

    fn on_stage_complete(&self, _doc_id: DocumentId, stage: Stage, pages: &[u32]) {
        if stage == Stage::ExtractImages {
            self.bar.inc(pages.len() as u64);
        }
        if pages.is_empty() {
            self.bar.set_message(stage.to_string());
            return;
        }
        let first = pages.iter().min().copied().unwrap_or(0) + 1;
        let last = pages.iter().max().copied().unwrap_or(0) + 1;
        self.bar.println(format!(
            "  {} {:<15} {}",
            green("✓"),
            stage.to_string(),
            dim(&format!("pages {first}-{last}")),
        ));
    }

    fn on_page_error(&self, _doc_id: DocumentId, page: u32, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg = if error.len() > 80 {
            let cut = error
                .char_indices()
                .map(|(i, _)| i)
                .take_while(|&i| i <= 79)
                .last()
                .unwrap_or(0);
            format!("{}\u{2026}", &error[..cut])
        } else {
            error.to_string()
        };
        self.bar
            .println(format!("  {} Page {:>3}  {}", red("✗"), page + 1, red(&msg)));
    }

    fn on_document_complete(&self, _doc_id: DocumentId, status: DocumentStatus) {
        self.bar.finish_and_clear();
        let errors = self.errors.load(Ordering::SeqCst);
        match status {
            DocumentStatus::Success => eprintln!("{} {}", green("✔"), bold("Processing complete")),
            _ => eprintln!(
                "{} Processing ended in {}  ({} page errors)",
                red("✘"),
                bold(&status.to_string()),
                red(&errors.to_string()),
            ),
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Process a PDF, print its text
  docflow report.pdf

  # Office documents are converted with LibreOffice first
  docflow --soffice /usr/bin/soffice minutes.docx

  # OCR every page, even those with embedded text
  docflow --force-ocr scan.pdf

  # Vision-LLM OCR instead of tesseract
  docflow --ocr vlm --provider openai --model gpt-4.1-nano scan.pdf

  # Keep pages 1-24 and 424-448, rotating nothing
  docflow --modify '[{"page":"0-23,423-447"}]' book.pdf

  # Black out a region of the first page
  docflow --redact '[{"page_number":0,"x1":0.1,"y1":0.1,"x2":0.5,"y2":0.2}]' form.pdf

  # Page count and page spec only
  docflow --inspect report.pdf

  # Document record, error log and page texts as JSON
  docflow --json report.pdf > report.json

ENVIRONMENT VARIABLES:
  PDFIUM_LIB_PATH         Path to libpdfium (file or directory)
  OPENAI_API_KEY          OpenAI API key, for --ocr vlm
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  RUST_LOG                Log filter, overrides -v / -q
"#;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OcrArg {
    Tesseract,
    Vlm,
}

/// Process documents into page images, text and word positions.
#[derive(Parser, Debug)]
#[command(
    name = "docflow",
    version,
    about = "Process documents into page images, text and word positions",
    long_about = "Run a document through the docflow pipeline: convert office formats to PDF, \
render page images at every size class, read embedded text or OCR the page, extract word \
positions and assemble the document text. Optionally recompose or redact the pages afterwards.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local file path or HTTP/HTTPS URL.
    input: String,

    /// Directory holding the object store.
    #[arg(long, env = "DOCFLOW_STORE", default_value = "docflow-store")]
    store: PathBuf,

    /// OCR every page, ignoring embedded text.
    #[arg(long, env = "DOCFLOW_FORCE_OCR")]
    force_ocr: bool,

    /// OCR backend.
    #[arg(long, env = "DOCFLOW_OCR", value_enum, default_value = "tesseract")]
    ocr: OcrArg,

    /// LLM provider for --ocr vlm.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// LLM model ID for --ocr vlm.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Tesseract executable.
    #[arg(long, env = "DOCFLOW_TESSERACT", default_value = "tesseract")]
    tesseract: PathBuf,

    /// OCR language code.
    #[arg(long, env = "DOCFLOW_LANGUAGE", default_value = "eng")]
    language: String,

    /// Modification spec (JSON) applied after processing.
    #[arg(long, env = "DOCFLOW_MODIFY")]
    modify: Option<String>,

    /// Redactions (JSON array) applied after processing.
    #[arg(long, env = "DOCFLOW_REDACT")]
    redact: Option<String>,

    /// Pages per image extraction task.
    #[arg(long, env = "DOCFLOW_IMAGE_BATCH", default_value_t = 55)]
    image_batch: usize,

    /// Pages per OCR task.
    #[arg(long, env = "DOCFLOW_OCR_BATCH", default_value_t = 4)]
    ocr_batch: usize,

    /// Pages per text position task.
    #[arg(long, env = "DOCFLOW_TEXT_POSITION_BATCH", default_value_t = 3)]
    text_position_batch: usize,

    /// Image size classes, `name:width,...`.
    #[arg(
        long,
        env = "DOCFLOW_SIZE_CLASSES",
        default_value = "xlarge:2000,large:1000,normal:700,small:180,thumbnail:60"
    )]
    size_classes: String,

    /// Size class fed to OCR.
    #[arg(long, env = "DOCFLOW_OCR_SIZE_CLASS", default_value = "large")]
    ocr_size_class: String,

    /// Page image format: gif, png, jpeg.
    #[arg(long, env = "DOCFLOW_IMAGE_FORMAT", default_value = "gif")]
    image_format: PageImageFormat,

    /// Non-whitespace characters of embedded text needed to skip OCR.
    #[arg(long, env = "DOCFLOW_MIN_TEXT_CHARS", default_value_t = 1)]
    min_text_chars: usize,

    /// Attempts per task before giving up.
    #[arg(long, env = "DOCFLOW_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Per-stage timeout in seconds (also the download timeout).
    #[arg(long, env = "DOCFLOW_STAGE_TIMEOUT", default_value_t = 300)]
    stage_timeout: u64,

    /// Tasks processed concurrently.
    #[arg(short, long, env = "DOCFLOW_CONCURRENCY", default_value_t = 10)]
    concurrency: usize,

    /// Path to libpdfium (file or directory).
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib: Option<PathBuf>,

    /// LibreOffice executable used for conversion.
    #[arg(long, env = "DOCFLOW_SOFFICE", default_value = "soffice")]
    soffice: PathBuf,

    /// Print page count and page spec only, no processing.
    #[arg(long)]
    inspect: bool,

    /// Print the document record, error log and text as JSON.
    #[arg(long, env = "DOCFLOW_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "DOCFLOW_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOCFLOW_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DOCFLOW_QUIET")]
    quiet: bool,
}

#[derive(Serialize)]
struct Summary {
    document: Document,
    errors: Vec<ErrorRecord>,
    text: Option<TextFile>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.inspect;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let engine: Arc<dyn PdfEngine> = match &cli.pdfium_lib {
        Some(path) => Arc::new(PdfiumEngine::with_library(path)),
        None => Arc::new(PdfiumEngine::from_env()),
    };

    // ── Read input ───────────────────────────────────────────────────────
    let (bytes, extension) = read_input(&cli).await?;

    if cli.inspect {
        return inspect(&cli, engine, bytes, &extension).await;
    }

    // ── Wire the pipeline ────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    let ocr: Arc<dyn OcrEngine> = match cli.ocr {
        OcrArg::Tesseract => Arc::new(TesseractEngine::new(
            &cli.tesseract,
            config.ocr_version.clone(),
        )),
        OcrArg::Vlm => Arc::new(
            VlmOcrEngine::resolve(cli.provider.as_deref(), cli.model.as_deref())
                .context("Failed to set up the vision OCR provider")?,
        ),
    };

    let documents = Arc::new(MemoryDocumentStore::new());
    documents.insert(
        Document::new(DOC_ID, slug_of(&cli.input), USER_ID).with_language(&cli.language),
    )?;
    let objects = Arc::new(LocalObjectStore::new(&cli.store));

    let (bus, rx) = ChannelBus::new();
    let orchestrator = Orchestrator::builder(config)
        .bus(Arc::new(bus))
        .documents(documents.clone())
        .objects(objects.clone())
        .engine(engine)
        .ocr(ocr)
        .converter(Arc::new(LibreOfficeConverter::new(&cli.soffice)))
        .build()
        .context("Invalid configuration")?;

    let worker = orchestrator.clone();
    tokio::spawn(async move { worker.run(rx).await });

    // ── Process ──────────────────────────────────────────────────────────
    orchestrator
        .upload(DOC_ID, bytes, &extension)
        .await
        .context("Upload failed")?;
    orchestrator
        .trigger_processing(DOC_ID, cli.force_ocr)
        .await
        .context("Failed to start processing")?;
    let mut status = wait_for_run(documents.as_ref()).await?;

    if let Some(json) = &cli.modify {
        if status == DocumentStatus::Success || status == DocumentStatus::Error {
            let spec = ModificationSpec::from_json(json).context("Invalid --modify spec")?;
            orchestrator
                .apply_modification(DOC_ID, USER_ID, &spec)
                .await
                .context("Modification rejected")?;
            status = wait_for_run(documents.as_ref()).await?;
        }
    }
    if let Some(json) = &cli.redact {
        let redactions: Vec<RedactionSpec> =
            serde_json::from_str(json).context("Invalid --redact list")?;
        orchestrator
            .apply_redaction(DOC_ID, USER_ID, redactions)
            .await
            .context("Redaction rejected")?;
        status = wait_for_run(documents.as_ref()).await?;
    }

    // ── Report ───────────────────────────────────────────────────────────
    let document = documents.get(DOC_ID).await?;
    let errors = documents.errors(DOC_ID).await?;
    let paths = ArtifactPaths::for_document(&document);

    if cli.json {
        let text = get_json::<TextFile>(objects.as_ref(), &paths.text_json())
            .await
            .ok();
        let summary = Summary {
            document,
            errors,
            text,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?
        );
    } else {
        if let Ok(text) = objects.get(&paths.text()).await {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(&text)
                .context("Failed to write to stdout")?;
            if !text.ends_with(b"\n") {
                handle.write_all(b"\n").ok();
            }
        }
        if !cli.quiet {
            eprintln!(
                "{}  {} pages  {}  →  {}",
                if status == DocumentStatus::Success {
                    green("✔")
                } else {
                    red("✘")
                },
                document.page_count,
                dim(&format!("status {status}")),
                bold(&cli.store.join(paths.root()).display().to_string()),
            );
            for e in &errors {
                eprintln!("   {} {}", red("•"), e.message);
            }
        }
    }

    if status != DocumentStatus::Success {
        anyhow::bail!("document ended in {status}");
    }
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let size_classes =
        SizeClass::parse_list(&cli.size_classes).context("Invalid --size-classes")?;

    let mut builder = PipelineConfig::builder()
        .image_batch(cli.image_batch)
        .ocr_batch(cli.ocr_batch)
        .text_position_batch(cli.text_position_batch)
        .size_classes(size_classes)
        .ocr_size_class(&cli.ocr_size_class)
        .image_format(cli.image_format)
        .min_text_chars(cli.min_text_chars)
        .max_attempts(cli.max_attempts)
        .stage_timeout_secs(cli.stage_timeout)
        .ocr_language(&cli.language)
        .concurrency(cli.concurrency);

    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

/// Local file or URL → bytes and lower-case extension.
async fn read_input(cli: &Cli) -> Result<(Vec<u8>, String)> {
    if input::is_url(&cli.input) {
        let download = input::download(&cli.input, cli.stage_timeout)
            .await
            .with_context(|| format!("Failed to download {}", cli.input))?;
        return Ok((download.bytes, download.extension));
    }
    let bytes = tokio::fs::read(&cli.input)
        .await
        .with_context(|| format!("Failed to read {}", cli.input))?;
    let extension = input::extension_of(&cli.input).unwrap_or_else(|| FALLBACK_EXTENSION.into());
    Ok((bytes, extension))
}

/// Print page count and page spec of a PDF without running the pipeline.
async fn inspect(
    cli: &Cli,
    engine: Arc<dyn PdfEngine>,
    bytes: Vec<u8>,
    extension: &str,
) -> Result<()> {
    if extension != "pdf" {
        anyhow::bail!("--inspect needs a PDF, got .{extension}");
    }
    let dimensions = tokio::task::spawn_blocking(move || {
        let mut dimensions = BTreeMap::new();
        engine.with_document(&bytes, &mut |doc| {
            for page in 0..doc.page_count() {
                let info = doc.page_info(page)?;
                dimensions.insert(page, pagespec::dimension_key(info.width, info.height));
            }
            Ok(())
        })?;
        Ok::<_, docflow::PipelineError>(dimensions)
    })
    .await
    .context("Inspect task panicked")?
    .context("Failed to inspect PDF")?;

    let spec = pagespec::encode(&dimensions);
    if cli.json {
        let meta = serde_json::json!({
            "file": cli.input,
            "page_count": dimensions.len(),
            "page_spec": spec,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&meta).context("Failed to serialize metadata")?
        );
    } else {
        println!("File:         {}", cli.input);
        println!("Pages:        {}", dimensions.len());
        println!("Page spec:    {}", spec);
    }
    Ok(())
}

/// Wait until the current run leaves `pending`/`readable`.
async fn wait_for_run(documents: &dyn DocumentStore) -> Result<DocumentStatus> {
    loop {
        let status = documents.get(DOC_ID).await?.status;
        if !status.is_processing() {
            return Ok(status);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// A storage slug from the input's file stem.
fn slug_of(input: &str) -> String {
    let name = input
        .rsplit('/')
        .next()
        .map(|n| n.split(['?', '#']).next().unwrap_or(n))
        .unwrap_or(input);
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document");
    let slug: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "document".to_string()
    } else {
        slug.to_string()
    }
}
