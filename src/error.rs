//! Error types for the docmost-convert library.
//!
//! Two layers reflect two distinct audiences:
//!
//! * [`ConvertError`]: the error *kind*. Each pipeline stage returns exactly
//!   one of its own kinds; nothing downstream re-wraps or reinterprets it,
//!   so a backend outage can always be told apart from a content problem.
//!
//! * [`FailureReport`]: what the orchestrator hands back to the caller:
//!   the untouched [`ConvertError`] plus the [`Stage`] it came from.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the docmost-convert library.
#[derive(Debug, Error)]
pub enum ConvertError {
    // ── Backend errors (ConversionClient) ────────────────────────────────
    /// The conversion backend could not be reached (refused, DNS, reset, 502/503).
    #[error("Conversion backend unavailable at '{url}': {reason}\nCheck DOCLING_SERVER_URL and that the service is running.")]
    BackendUnavailable { url: String, reason: String },

    /// No response arrived within the configured deadline.
    #[error("Conversion backend did not respond within {secs}s\nLarge documents may need a longer --timeout.")]
    BackendTimeout { secs: u64 },

    /// The backend answered but refused the document.
    #[error("Conversion backend rejected the document (status {status}): {detail}")]
    BackendRejected { status: u16, detail: String },

    // ── Content errors (ImageExtractor / MarkdownNormalizer) ─────────────
    /// An image reference in the raw markup points at no payload, or its data is corrupt.
    #[error("Malformed image reference '{reference}': {detail}")]
    MalformedImageReference { reference: String, detail: String },

    /// The raw markup contains a construct that cannot be mapped safely.
    #[error("Unsupported markup construct at line {line}: {construct}")]
    UnsupportedMarkupConstruct { construct: String, line: usize },

    // ── Packaging errors (ArchiveBuilder) ────────────────────────────────
    /// Writing the ZIP archive failed.
    #[error("Failed to write archive: {detail}")]
    ArchiveWriteError { detail: String },

    // ── Input errors ─────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// The input string is not a usable file path or URL.
    #[error("Invalid input '{input}': {reason}")]
    InvalidInput { input: String, reason: String },

    /// The document is not a PDF, DOCX or XLSX file.
    #[error("Unsupported document type for '{filename}': {detail}\nSupported: .pdf, .docx, .xlsx")]
    UnsupportedDocumentType { filename: String, detail: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Could not create or write the output archive file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConvertError {
    /// Whether the ConversionClient may retry this error.
    ///
    /// Only connectivity failures qualify: a timeout may just mean a slow
    /// backend on a large document, and a rejection is deterministic.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConvertError::BackendUnavailable { .. })
    }

    /// Whether the failure is caused by the uploaded document rather than the server side.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ConvertError::BackendRejected { .. }
                | ConvertError::MalformedImageReference { .. }
                | ConvertError::UnsupportedMarkupConstruct { .. }
                | ConvertError::InvalidInput { .. }
                | ConvertError::UnsupportedDocumentType { .. }
                | ConvertError::FileNotFound { .. }
        )
    }

    /// HTTP status an upload front-end should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            ConvertError::BackendUnavailable { .. } => 503,
            ConvertError::BackendTimeout { .. } => 504,
            ConvertError::BackendRejected { .. }
            | ConvertError::MalformedImageReference { .. }
            | ConvertError::UnsupportedMarkupConstruct { .. }
            | ConvertError::UnsupportedDocumentType { .. } => 422,
            ConvertError::InvalidInput { .. } => 400,
            ConvertError::FileNotFound { .. } => 404,
            ConvertError::DownloadFailed { .. } => 502,
            ConvertError::ArchiveWriteError { .. }
            | ConvertError::OutputWriteFailed { .. }
            | ConvertError::InvalidConfig(_) => 500,
        }
    }

    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ConvertError::BackendUnavailable { .. } => "BackendUnavailable",
            ConvertError::BackendTimeout { .. } => "BackendTimeout",
            ConvertError::BackendRejected { .. } => "BackendRejected",
            ConvertError::MalformedImageReference { .. } => "MalformedImageReference",
            ConvertError::UnsupportedMarkupConstruct { .. } => "UnsupportedMarkupConstruct",
            ConvertError::ArchiveWriteError { .. } => "ArchiveWriteError",
            ConvertError::FileNotFound { .. } => "FileNotFound",
            ConvertError::InvalidInput { .. } => "InvalidInput",
            ConvertError::UnsupportedDocumentType { .. } => "UnsupportedDocumentType",
            ConvertError::DownloadFailed { .. } => "DownloadFailed",
            ConvertError::OutputWriteFailed { .. } => "OutputWriteFailed",
            ConvertError::InvalidConfig(_) => "InvalidConfig",
        }
    }
}

impl From<zip::result::ZipError> for ConvertError {
    fn from(e: zip::result::ZipError) -> Self {
        ConvertError::ArchiveWriteError {
            detail: e.to_string(),
        }
    }
}

/// Pipeline stage of a single conversion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Converting,
    Extracting,
    Normalizing,
    Packaging,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Converting => "converting",
            Stage::Extracting => "extracting images",
            Stage::Normalizing => "normalizing markdown",
            Stage::Packaging => "packaging archive",
        };
        f.write_str(name)
    }
}

/// User-facing report for a failed request: which stage failed and why.
///
/// The inner [`ConvertError`] is the one the stage returned, unchanged.
#[derive(Debug, Error)]
#[error("{filename}: {stage} failed: {error}")]
pub struct FailureReport {
    pub filename: String,
    pub stage: Stage,
    #[source]
    pub error: ConvertError,
}

impl FailureReport {
    pub fn new(filename: impl Into<String>, stage: Stage, error: ConvertError) -> Self {
        Self {
            filename: filename.into(),
            stage,
            error,
        }
    }

    /// HTTP status for the front-end, delegated to the error kind.
    pub fn http_status(&self) -> u16 {
        self.error.http_status()
    }
}
