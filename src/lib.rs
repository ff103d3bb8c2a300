//! # docmost-convert
//!
//! Convert office documents (PDF, DOCX, XLSX) into ZIP archives that Docmost
//! imports as a page with its images.
//!
//! Parsing, layout analysis and OCR are delegated to a docling-serve
//! compatible backend. This crate owns everything between the upload and the
//! download: submitting the document, pulling images out of the returned
//! markup, cleaning the Markdown, and packaging a reproducible archive.
//!
//! ## Pipeline Overview
//!
//! ```text
//! document
//!  │
//!  ├─ 1. Convert    POST /v1/convert/file, deadline + retry on unreachable backend
//!  ├─ 2. Extract    data URIs, payload links, <img>, <!-- image --> → images/image_NNN.ext
//!  ├─ 3. Normalize  block-model Markdown cleanup (idempotent)
//!  └─ 4. Package    document.md + images/ in a byte-stable ZIP (spawn_blocking)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docmost_convert::{load_request, process, ConversionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Backend URL from DOCLING_SERVER_URL, default http://docling-server:5001
//!     let config = ConversionConfig::from_env();
//!     let request = load_request("report.docx", 120).await?;
//!     let archive = process(&request, &config).await?;
//!     std::fs::write(request.download_name(), &archive.bytes)?;
//!     eprintln!("{} image(s) packaged", archive.image_count);
//!     Ok(())
//! }
//! ```
//!
//! ## Archive Layout
//!
//! ```text
//! report_docmost.zip
//! ├── document.md
//! └── images/
//!     ├── image_001.png
//!     └── image_002.jpg
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `doc2docmost` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! docmost-convert = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ArchiveCompression, ConversionConfig, ConversionConfigBuilder, MarkupPolicy};
pub use convert::{process, process_to_file, save_archive, Orchestrator, RequestState};
pub use error::{ConvertError, FailureReport, Stage};
pub use output::{
    download_name, ConversionRequest, DocumentMetadata, ExtractedImage, ImagePayload,
    NormalizedDocument, OutputArchive, RawConversionResult, ReferenceMap,
};
pub use pipeline::client::{ConversionBackend, ConversionClient, HttpBackend};
pub use pipeline::input::load_request;
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use stream::{process_batch, BatchItem, BatchStream};
