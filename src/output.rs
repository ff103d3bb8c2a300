//! Data carried between pipeline stages.
//!
//! Every value here is request-local: created by one stage, handed to the
//! next by value, and dropped when the request finishes. Nothing is shared
//! between concurrent requests.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Archive path of the Markdown entry.
pub const DOCUMENT_ENTRY: &str = "document.md";

/// Archive directory holding the extracted images (no trailing slash).
pub const IMAGES_DIR: &str = "images";

/// One uploaded document, immutable for the lifetime of a request.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub mime_type: String,
}

impl ConversionRequest {
    pub fn new(bytes: Vec<u8>, filename: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            filename: filename.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Name of the download offered for this request: `<stem>_docmost.zip`.
    pub fn download_name(&self) -> String {
        download_name(&self.filename)
    }
}

/// `report.final.docx` → `report.final_docmost.zip`.
pub fn download_name(original_filename: &str) -> String {
    let stem = Path::new(original_filename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "document".to_string());
    format!("{stem}_docmost.zip")
}

/// An image returned by the backend as a separate part of its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    /// The token the raw markup uses to point at this payload (e.g. `image_0.png`).
    pub reference: String,
    /// Media type declared by the backend, if any.
    pub media_type: Option<String>,
    pub data: Vec<u8>,
}

/// Document-level facts reported by the backend alongside the markup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Backend status string, e.g. `success` or `partial_success`.
    pub status: String,
    /// Backend-side processing time in seconds, when reported.
    pub processing_time: Option<f64>,
    /// Non-fatal errors the backend attached to a successful response.
    pub errors: Vec<String>,
}

/// The backend's unprocessed output for one document.
#[derive(Debug, Clone, Default)]
pub struct RawConversionResult {
    pub markup: String,
    /// Image payloads in the order the backend returned them.
    pub images: Vec<ImagePayload>,
    pub metadata: DocumentMetadata,
}

/// A standalone image with its final archive position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedImage {
    /// 1-based, contiguous.
    pub index: usize,
    pub data: Vec<u8>,
    pub extension: String,
}

impl ExtractedImage {
    /// `image_001.png`
    pub fn file_name(&self) -> String {
        image_file_name(self.index, &self.extension)
    }

    /// `images/image_001.png`, the path used both in Markdown and in the archive.
    pub fn archive_path(&self) -> String {
        format!("{IMAGES_DIR}/{}", self.file_name())
    }
}

pub(crate) fn image_file_name(index: usize, extension: &str) -> String {
    format!("image_{index:03}.{extension}")
}

/// Insertion-ordered mapping from origin reference to assigned image index.
///
/// Iteration follows the order in which references were first seen, never
/// hash order, so two runs over the same markup agree.
#[derive(Debug, Clone, Default)]
pub struct ReferenceMap {
    order: Vec<(String, usize)>,
    lookup: HashMap<String, usize>,
}

impl ReferenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, reference: &str) -> Option<usize> {
        self.lookup.get(reference).copied()
    }

    /// Record `reference → index`. Returns the existing index when the reference is already known.
    pub fn insert(&mut self, reference: &str, index: usize) -> usize {
        if let Some(existing) = self.get(reference) {
            return existing;
        }
        self.order.push((reference.to_string(), index));
        self.lookup.insert(reference.to_string(), index);
        index
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.order.iter().map(|(r, i)| (r.as_str(), *i))
    }
}

/// Cleaned, import-ready Markdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedDocument {
    pub markdown: String,
}

/// The packaged deliverable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputArchive {
    /// ZIP bytes.
    pub bytes: Vec<u8>,
    pub image_count: usize,
}

impl OutputArchive {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_name_uses_stem() {
        assert_eq!(download_name("report.docx"), "report_docmost.zip");
        assert_eq!(download_name("a.b.pdf"), "a.b_docmost.zip");
        assert_eq!(download_name("noext"), "noext_docmost.zip");
        assert_eq!(download_name(""), "document_docmost.zip");
    }

    #[test]
    fn image_names_are_zero_padded() {
        let img = ExtractedImage {
            index: 7,
            data: vec![],
            extension: "jpg".into(),
        };
        assert_eq!(img.file_name(), "image_007.jpg");
        assert_eq!(img.archive_path(), "images/image_007.jpg");
        assert_eq!(image_file_name(1234, "png"), "image_1234.png");
    }

    #[test]
    fn reference_map_keeps_first_index_and_order() {
        let mut map = ReferenceMap::new();
        assert_eq!(map.insert("r2", 1), 1);
        assert_eq!(map.insert("r1", 2), 2);
        assert_eq!(map.insert("r2", 3), 1);
        let order: Vec<_> = map.iter().collect();
        assert_eq!(order, vec![("r2", 1), ("r1", 2)]);
        assert_eq!(map.len(), 2);
    }
}
