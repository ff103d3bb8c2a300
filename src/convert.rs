//! Per-request orchestration: backend → images → Markdown → archive.
//!
//! A request moves through a fixed sequence of states:
//!
//! ```text
//! Received ─▶ Converting ─▶ Extracting ─▶ Normalizing ─▶ Packaging ─▶ Done
//!                 │              │              │              │
//!                 └──────────────┴──────┬───────┴──────────────┘
//!                                       ▼
//!                                 Failed(stage)
//! ```
//!
//! A transition happens only when the previous stage succeeded. The first
//! error ends the request with a [`FailureReport`] carrying the stage's own
//! error kind unchanged, and no partial archive is produced. The orchestrator
//! never retries; retrying unreachable backends is the client's job.

use crate::config::ConversionConfig;
use crate::error::{ConvertError, FailureReport, Stage};
use crate::output::{ConversionRequest, OutputArchive};
use crate::pipeline::archive::build_archive;
use crate::pipeline::client::ConversionClient;
use crate::pipeline::images::extract_images;
use crate::pipeline::normalize::normalize;
use crate::progress::ProgressCallback;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where a request currently is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Converting,
    Extracting,
    Normalizing,
    Packaging,
    Done,
    Failed(Stage),
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Done | RequestState::Failed(_))
    }
}

impl From<Stage> for RequestState {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Converting => RequestState::Converting,
            Stage::Extracting => RequestState::Extracting,
            Stage::Normalizing => RequestState::Normalizing,
            Stage::Packaging => RequestState::Packaging,
        }
    }
}

/// State, logging and progress events for one request.
struct Run<'a> {
    filename: &'a str,
    callback: Option<&'a ProgressCallback>,
    state: RequestState,
}

impl<'a> Run<'a> {
    fn new(filename: &'a str, callback: Option<&'a ProgressCallback>) -> Self {
        Self {
            filename,
            callback,
            state: RequestState::Received,
        }
    }

    fn enter(&mut self, stage: Stage) {
        debug!("{}: {:?} → {:?}", self.filename, self.state, RequestState::from(stage));
        self.state = stage.into();
        if let Some(cb) = self.callback {
            cb.on_stage_start(self.filename, stage);
        }
    }

    /// Close the current stage with its result.
    fn finish<T>(&mut self, stage: Stage, result: Result<T, ConvertError>) -> Result<T, FailureReport> {
        match result {
            Ok(value) => {
                if let Some(cb) = self.callback {
                    cb.on_stage_complete(self.filename, stage);
                }
                Ok(value)
            }
            Err(error) => {
                self.state = RequestState::Failed(stage);
                warn!("{}: {} failed: {}", self.filename, stage, error);
                if let Some(cb) = self.callback {
                    cb.on_request_failed(self.filename, stage, &error.to_string());
                }
                Err(FailureReport::new(self.filename, stage, error))
            }
        }
    }

    fn done(&mut self, archive: &OutputArchive) {
        self.state = RequestState::Done;
        if let Some(cb) = self.callback {
            cb.on_request_complete(self.filename, archive.len(), archive.image_count);
        }
    }
}

/// Drives single requests through the pipeline.
///
/// Holds the [`ConversionClient`] (and with it the pooled HTTP connection), so
/// one orchestrator should serve many requests. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    client: ConversionClient,
    config: ConversionConfig,
}

impl Orchestrator {
    pub fn new(config: &ConversionConfig) -> Result<Self, ConvertError> {
        Ok(Self {
            client: ConversionClient::from_config(config)?,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    /// Convert one document into a Docmost archive.
    pub async fn process(&self, request: &ConversionRequest) -> Result<OutputArchive, FailureReport> {
        let start = Instant::now();
        let filename = request.filename.as_str();
        let mut run = Run::new(filename, self.config.progress_callback.as_ref());
        info!(
            "Processing '{}' ({} bytes, {})",
            filename,
            request.bytes.len(),
            request.mime_type
        );
        if let Some(cb) = run.callback {
            cb.on_request_start(filename, request.bytes.len());
        }

        // ── Converting ───────────────────────────────────────────────────
        run.enter(Stage::Converting);
        let raw = run.finish(Stage::Converting, self.client.convert(request).await)?;
        if raw.metadata.status == "partial_success" {
            warn!(
                "{}: backend reported partial success ({} error(s))",
                filename,
                raw.metadata.errors.len()
            );
        }
        for err in &raw.metadata.errors {
            debug!("{}: backend error: {}", filename, err);
        }

        // ── Extracting ───────────────────────────────────────────────────
        run.enter(Stage::Extracting);
        let extraction = run.finish(
            Stage::Extracting,
            extract_images(&raw, self.config.include_orphan_images),
        )?;
        drop(raw);
        debug!(
            "{}: {} distinct image reference(s), {} image(s) total",
            filename,
            extraction.references.len(),
            extraction.images.len()
        );

        // ── Normalizing ──────────────────────────────────────────────────
        run.enter(Stage::Normalizing);
        let document = run.finish(
            Stage::Normalizing,
            normalize(&extraction.markup, &self.config.markup_policy),
        )?;

        // ── Packaging ────────────────────────────────────────────────────
        run.enter(Stage::Packaging);
        let images = extraction.images;
        let compression = self.config.compression;
        let packaged = tokio::task::spawn_blocking(move || build_archive(&document, &images, compression))
            .await
            .unwrap_or_else(|e| {
                Err(ConvertError::ArchiveWriteError {
                    detail: format!("packaging task failed: {e}"),
                })
            });
        let archive = run.finish(Stage::Packaging, packaged)?;

        run.done(&archive);
        info!(
            "Finished '{}': {} bytes, {} image(s) in {:?}",
            filename,
            archive.len(),
            archive.image_count,
            start.elapsed()
        );
        Ok(archive)
    }

    /// Convert one document and write `<stem>_docmost.zip` into `output_dir`.
    pub async fn process_to_file(
        &self,
        request: &ConversionRequest,
        output_dir: impl AsRef<Path>,
    ) -> Result<PathBuf, FailureReport> {
        let archive = self.process(request).await?;
        let path = output_dir.as_ref().join(request.download_name());
        save_archive(&archive, &path)
            .await
            .map_err(|e| FailureReport::new(request.filename.as_str(), Stage::Packaging, e))?;
        Ok(path)
    }
}

/// Write an archive to `path`.
///
/// Uses atomic write (temp file + rename) so a reader never sees a partial
/// archive.
pub async fn save_archive(archive: &OutputArchive, path: impl AsRef<Path>) -> Result<(), ConvertError> {
    let path = path.as_ref();
    let failed = |source: std::io::Error| ConvertError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(failed)?;
    }

    let tmp_path = path.with_extension("zip.tmp");
    tokio::fs::write(&tmp_path, &archive.bytes)
        .await
        .map_err(failed)?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(failed(e));
    }

    info!("Wrote {} ({} bytes)", path.display(), archive.len());
    Ok(())
}

/// Convert one document with a fresh [`Orchestrator`].
///
/// This is the primary entry point for one-off conversions. Build an
/// [`Orchestrator`] instead when converting many documents against the same
/// backend.
///
/// # Example
/// ```rust,no_run
/// use docmost_convert::{process, ConversionConfig, ConversionRequest};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let bytes = std::fs::read("report.docx")?;
/// let request = ConversionRequest::new(
///     bytes,
///     "report.docx",
///     "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
/// );
/// let archive = process(&request, &ConversionConfig::from_env()).await?;
/// std::fs::write(request.download_name(), &archive.bytes)?;
/// # Ok(())
/// # }
/// ```
pub async fn process(
    request: &ConversionRequest,
    config: &ConversionConfig,
) -> Result<OutputArchive, FailureReport> {
    orchestrator_for(request, config)?.process(request).await
}

/// [`process`] followed by an atomic write of the archive into `output_dir`.
pub async fn process_to_file(
    request: &ConversionRequest,
    output_dir: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<PathBuf, FailureReport> {
    orchestrator_for(request, config)?
        .process_to_file(request, output_dir)
        .await
}

fn orchestrator_for(
    request: &ConversionRequest,
    config: &ConversionConfig,
) -> Result<Orchestrator, FailureReport> {
    Orchestrator::new(config)
        .map_err(|e| FailureReport::new(request.filename.as_str(), Stage::Converting, e))
}
