//! Input loading: turn a user-supplied path or URL into a [`ConversionRequest`].
//!
//! The backend accepts PDF, DOCX and XLSX. The MIME type is taken from the
//! file extension and cross-checked against the leading magic bytes, so a
//! renamed file fails here with a clear error instead of as an opaque backend
//! rejection several minutes later.

use crate::error::ConvertError;
use crate::output::ConversionRequest;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

const PDF_MAGIC: &[u8] = b"%PDF";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Load a document from a local path or an `http(s)` URL.
pub async fn load_request(input: &str, timeout_secs: u64) -> Result<ConversionRequest, ConvertError> {
    if input.trim().is_empty() {
        return Err(ConvertError::InvalidInput {
            input: input.to_string(),
            reason: "empty path".to_string(),
        });
    }
    let (filename, bytes) = if is_url(input) {
        download_url(input, timeout_secs).await?
    } else {
        read_local(input).await?
    };
    request_from_bytes(bytes, &filename)
}

/// Build a request from bytes already in memory, validating the document type.
pub fn request_from_bytes(bytes: Vec<u8>, filename: &str) -> Result<ConversionRequest, ConvertError> {
    let mime = mime_for_filename(filename).ok_or_else(|| ConvertError::UnsupportedDocumentType {
        filename: filename.to_string(),
        detail: "unrecognised file extension".to_string(),
    })?;

    let expected = if mime == MIME_PDF { PDF_MAGIC } else { ZIP_MAGIC };
    if !bytes.starts_with(expected) {
        let found = &bytes[..bytes.len().min(4)];
        return Err(ConvertError::UnsupportedDocumentType {
            filename: filename.to_string(),
            detail: format!("content does not match extension (leading bytes {found:02x?})"),
        });
    }

    debug!(filename, mime, size = bytes.len(), "Loaded document");
    Ok(ConversionRequest::new(bytes, filename, mime))
}

/// MIME type for a supported extension, case-insensitive.
pub fn mime_for_filename(filename: &str) -> Option<&'static str> {
    let ext = Path::new(filename).extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => Some(MIME_PDF),
        "docx" => Some(MIME_DOCX),
        "xlsx" => Some(MIME_XLSX),
        _ => None,
    }
}

async fn read_local(path_str: &str) -> Result<(String, Vec<u8>), ConvertError> {
    let path = PathBuf::from(path_str);
    if !path.is_file() {
        return Err(ConvertError::FileNotFound { path });
    }
    let bytes = tokio::fs::read(&path).await.map_err(|e| ConvertError::InvalidInput {
        input: path_str.to_string(),
        reason: e.to_string(),
    })?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path_str)
        .to_string();
    Ok((filename, bytes))
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<(String, Vec<u8>), ConvertError> {
    info!("Downloading document from: {}", url);

    let failed = |reason: String| ConvertError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            failed(format!("timed out after {timeout_secs}s"))
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let filename = filename_from_url(url);
    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;

    info!("Downloaded {} bytes as '{}'", bytes.len(), filename);
    Ok((filename, bytes.to_vec()))
}

/// Last path segment of the URL when it has an extension, else `download.pdf`.
fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }
    "download.pdf".to_string()
}
