//! CLI binary for docmost-convert.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ConversionConfig`, runs a batch and writes one archive per input.

use anyhow::{Context, Result};
use clap::Parser;
use docmost_convert::{
    download_name, load_request, process_batch, save_archive, ArchiveCompression,
    ConversionConfig, ConversionProgressCallback, ConversionRequest, MarkupPolicy,
    ProgressCallback, Stage,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

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

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar for the whole batch; one log line per finished document.
/// Documents finish out of order when `--concurrency` > 1.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<String, Instant>>,
}

impl CliProgressCallback {
    fn new(total: usize) -> Arc<Self> {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:32.green/238}] {pos}/{len}  {wide_msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        let bar = ProgressBar::new(total as u64);
        bar.set_style(style);
        bar.set_prefix("Converting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn elapsed(&self, filename: &str) -> String {
        let secs = self
            .start_times
            .lock()
            .ok()
            .and_then(|mut t| t.remove(filename))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        dim(&format!("{secs:.1}s"))
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_request_start(&self, filename: &str, _size_bytes: usize) {
        if let Ok(mut t) = self.start_times.lock() {
            t.insert(filename.to_string(), Instant::now());
        }
    }

    fn on_stage_start(&self, filename: &str, stage: Stage) {
        self.bar.set_message(format!("{filename}: {stage}"));
    }

    fn on_request_failed(&self, filename: &str, stage: Stage, error: &str) {
        let first_line = error.lines().next().unwrap_or(error);
        self.bar.println(format!(
            "  {} {}  {} failed: {}  {}",
            red("✗"),
            bold(filename),
            stage,
            red(first_line),
            self.elapsed(filename),
        ));
        self.bar.inc(1);
    }

    fn on_request_complete(&self, filename: &str, archive_len: usize, image_count: usize) {
        self.bar.println(format!(
            "  {} {}  {}  {}",
            green("✓"),
            bold(filename),
            dim(&format!("{image_count} image(s), {archive_len} bytes")),
            self.elapsed(filename),
        ));
        self.bar.inc(1);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert one document into ./report_docmost.zip
  doc2docmost report.docx

  # Several documents into an output directory, 4 at a time
  doc2docmost -o out/ --concurrency 4 a.pdf b.docx c.xlsx

  # Convert from URL against a local backend
  doc2docmost --backend-url http://localhost:5001 https://example.com/brief.pdf

  # Keep superscripts and subscripts as HTML
  doc2docmost --keep-tag sup --keep-tag sub paper.pdf

  # Machine-readable summary
  doc2docmost --json *.pdf > results.jsonl

ENVIRONMENT VARIABLES:
  DOCLING_SERVER_URL      Backend base URL (default http://docling-server:5001)
  DOC2DOCMOST_OUTPUT_DIR  Output directory
  RUST_LOG                Log filter, overrides --verbose / --quiet

IMPORT:
  In Docmost, open a space and choose Import → Markdown/ZIP, then pick the
  generated <name>_docmost.zip.
"#;

/// Convert PDF, DOCX and XLSX documents into Docmost import archives.
#[derive(Parser, Debug)]
#[command(
    name = "doc2docmost",
    version,
    about = "Convert PDF, DOCX and XLSX documents into Docmost import archives",
    long_about = "Send documents (local files or URLs) to a docling conversion backend and \
package the result as a ZIP holding document.md and an images/ directory, ready for \
Docmost's Markdown import.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local document paths or HTTP/HTTPS URLs.
    #[arg(required = true, num_args = 1..)]
    inputs: Vec<String>,

    /// Directory for the `<name>_docmost.zip` archives.
    #[arg(short, long, env = "DOC2DOCMOST_OUTPUT_DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Base URL of the conversion backend.
    #[arg(long, env = "DOCLING_SERVER_URL", default_value = docmost_convert::config::DEFAULT_BACKEND_URL)]
    backend_url: String,

    /// Deadline for one backend conversion in seconds.
    #[arg(long, env = "DOC2DOCMOST_TIMEOUT", default_value_t = 300)]
    timeout: u64,

    /// Retries while the backend is unreachable (0-10).
    #[arg(long, env = "DOC2DOCMOST_MAX_RETRIES", default_value_t = 3,
          value_parser = clap::value_parser!(u32).range(0..=10))]
    max_retries: u32,

    /// Number of documents converted at once.
    #[arg(short, long, env = "DOC2DOCMOST_CONCURRENCY", default_value_t = 2)]
    concurrency: usize,

    /// HTML tag to keep verbatim in the Markdown (repeatable).
    #[arg(long = "keep-tag", value_name = "TAG")]
    keep_tags: Vec<String>,

    /// HTML tag to drop together with its content (repeatable; script and style always are).
    #[arg(long = "drop-tag", value_name = "TAG")]
    drop_tags: Vec<String>,

    /// Leave out images the backend returned but the document never references.
    #[arg(long)]
    no_orphan_images: bool,

    /// Store archive entries uncompressed.
    #[arg(long)]
    store: bool,

    /// HTTP download timeout in seconds for URL inputs.
    #[arg(long, env = "DOC2DOCMOST_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Print one JSON object per document to stdout.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "DOC2DOCMOST_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Per-document line of `--json` output.
#[derive(Serialize)]
struct Outcome {
    input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    archive: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<OutcomeError>,
}

#[derive(Serialize)]
struct OutcomeError {
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<Stage>,
    http_status: u16,
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs; --verbose brings them all back.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
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

    // ── Load inputs ──────────────────────────────────────────────────────
    let mut outcomes: Vec<Outcome> = Vec::new();
    let mut requests: Vec<ConversionRequest> = Vec::new();
    for input in &cli.inputs {
        match load_request(input, cli.download_timeout).await {
            Ok(request) => requests.push(request),
            Err(e) => {
                if !cli.json {
                    eprintln!("{} {}  {}", red("✗"), bold(input), red(&e.to_string()));
                }
                outcomes.push(Outcome {
                    input: input.clone(),
                    archive: None,
                    images: None,
                    error: Some(OutcomeError {
                        kind: e.kind(),
                        stage: None,
                        http_status: e.http_status(),
                        message: e.to_string(),
                    }),
                });
            }
        }
    }

    // ── Build config ─────────────────────────────────────────────────────
    let progress: Option<Arc<CliProgressCallback>> = if show_progress && !requests.is_empty() {
        Some(CliProgressCallback::new(requests.len()))
    } else {
        None
    };
    let config = build_config(&cli, progress.clone().map(|p| p as ProgressCallback))?;

    tokio::fs::create_dir_all(&cli.output_dir)
        .await
        .with_context(|| format!("Failed to create output directory {:?}", cli.output_dir))?;

    // ── Run batch ────────────────────────────────────────────────────────
    let total = requests.len();
    let start = Instant::now();
    let mut results = process_batch(requests, &config, cli.concurrency)
        .context("Failed to set up the conversion backend")?;

    while let Some((filename, result)) = results.next().await {
        let outcome = match result {
            Ok(archive) => {
                let path = cli.output_dir.join(download_name(&filename));
                match save_archive(&archive, &path).await {
                    Ok(()) => Outcome {
                        input: filename,
                        archive: Some(path),
                        images: Some(archive.image_count),
                        error: None,
                    },
                    Err(e) => Outcome {
                        input: filename,
                        archive: None,
                        images: None,
                        error: Some(OutcomeError {
                            kind: e.kind(),
                            stage: Some(Stage::Packaging),
                            http_status: e.http_status(),
                            message: e.to_string(),
                        }),
                    },
                }
            }
            Err(report) => Outcome {
                input: filename,
                archive: None,
                images: None,
                error: Some(OutcomeError {
                    kind: report.error.kind(),
                    stage: Some(report.stage),
                    http_status: report.http_status(),
                    message: report.error.to_string(),
                }),
            },
        };

        if cli.json {
            println!(
                "{}",
                serde_json::to_string(&outcome).context("Failed to serialise outcome")?
            );
        } else if progress.is_none() && !cli.quiet {
            match (&outcome.archive, &outcome.error) {
                (Some(path), _) => eprintln!("{} {}", green("✓"), path.display()),
                (None, Some(e)) => eprintln!("{} {}  {}", red("✗"), bold(&outcome.input), red(&e.message)),
                (None, None) => {}
            }
        }
        outcomes.push(outcome);
    }

    if let Some(ref p) = progress {
        p.bar.finish_and_clear();
    }

    // ── Summary ──────────────────────────────────────────────────────────
    let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
    let converted = outcomes.len() - failed;
    if !cli.quiet && !cli.json {
        eprintln!(
            "{} {}/{} document(s) converted in {:.1}s  →  {}",
            if failed == 0 { green("✔") } else { red("✘") },
            bold(&converted.to_string()),
            outcomes.len(),
            start.elapsed().as_secs_f64(),
            bold(&cli.output_dir.display().to_string()),
        );
    }
    tracing::debug!("batch of {} finished, {} failed", total, failed);

    if failed > 0 {
        anyhow::bail!("{failed} of {} document(s) failed", outcomes.len());
    }
    Ok(())
}

/// Map CLI args to `ConversionConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ConversionConfig> {
    let mut policy = MarkupPolicy::default();
    for tag in &cli.keep_tags {
        policy = policy.keep_tag(tag);
    }
    for tag in &cli.drop_tags {
        policy = policy.drop_tag_with_content(tag);
    }

    let mut builder = ConversionConfig::builder()
        .backend_url(cli.backend_url.clone())
        .request_timeout_secs(cli.timeout)
        .max_retries(cli.max_retries)
        .markup_policy(policy)
        .include_orphan_images(!cli.no_orphan_images)
        .compression(if cli.store {
            ArchiveCompression::Stored
        } else {
            ArchiveCompression::Deflated
        });

    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
