//! Archive packaging: write the Docmost import ZIP.
//!
//! Layout:
//!
//! ```text
//! document.md
//! images/
//! images/image_001.png
//! images/image_002.jpg
//! ```
//!
//! The output is byte-for-byte reproducible: entries are written in a fixed
//! order with a fixed timestamp (1980-01-01, the ZIP epoch) and fixed unix
//! permissions, so the same document and images always give the same bytes.
//! The `images/` directory entry is written even when there are no images.
//!
//! Building is synchronous and CPU-bound; the orchestrator runs it under
//! `tokio::task::spawn_blocking`.

use crate::config::ArchiveCompression;
use crate::error::ConvertError;
use crate::output::{ExtractedImage, NormalizedDocument, OutputArchive, DOCUMENT_ENTRY, IMAGES_DIR};
use std::io::{Cursor, Write};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

const FILE_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o755;

fn entry_options(compression: ArchiveCompression, mode: u32) -> SimpleFileOptions {
    let method = match compression {
        ArchiveCompression::Stored => CompressionMethod::Stored,
        ArchiveCompression::Deflated => CompressionMethod::Deflated,
    };
    SimpleFileOptions::default()
        .compression_method(method)
        .last_modified_time(DateTime::default())
        .unix_permissions(mode)
}

fn write_failed(entry: &str, err: impl std::fmt::Display) -> ConvertError {
    ConvertError::ArchiveWriteError {
        detail: format!("{entry}: {err}"),
    }
}

/// Package the normalized document and its images into one ZIP.
///
/// `images` must be in ascending index order, as produced by extraction.
pub fn build_archive(
    document: &NormalizedDocument,
    images: &[ExtractedImage],
    compression: ArchiveCompression,
) -> Result<OutputArchive, ConvertError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let file_options = entry_options(compression, FILE_MODE);

    zip.start_file(DOCUMENT_ENTRY, file_options)?;
    zip.write_all(document.markdown.as_bytes())
        .map_err(|e| write_failed(DOCUMENT_ENTRY, e))?;

    zip.add_directory(format!("{IMAGES_DIR}/"), entry_options(compression, DIR_MODE))?;

    for image in images {
        let path = image.archive_path();
        zip.start_file(path.as_str(), file_options)?;
        zip.write_all(&image.data).map_err(|e| write_failed(&path, e))?;
    }

    let bytes = zip.finish()?.into_inner();
    debug!(
        archive_bytes = bytes.len(),
        images = images.len(),
        "Built archive"
    );
    Ok(OutputArchive {
        bytes,
        image_count: images.len(),
    })
}
