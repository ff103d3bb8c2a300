//! Configuration types for document-to-Docmost conversion.
//!
//! All conversion behaviour is controlled through [`ConversionConfig`], built
//! via its [`ConversionConfigBuilder`]. One struct holds every knob so a
//! config can be shared across concurrent requests and logged as a whole.

use crate::error::ConvertError;
use crate::pipeline::client::ConversionBackend;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Backend base URL used when neither the builder nor the environment sets one.
pub const DEFAULT_BACKEND_URL: &str = "http://docling-server:5001";

/// Environment variable holding the backend base URL.
pub const BACKEND_URL_ENV: &str = "DOCLING_SERVER_URL";

/// Configuration for converting documents into Docmost archives.
///
/// # Example
/// ```rust
/// use docmost_convert::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .backend_url("http://localhost:5001")
///     .request_timeout_secs(120)
///     .max_retries(2)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Base URL of the docling-compatible backend, without the `/v1/...` path.
    pub backend_url: String,

    /// Deadline for one backend call in seconds. Default: 300.
    ///
    /// OCR on a long scanned PDF routinely takes minutes, so the deadline is
    /// generous. Exceeding it yields `BackendTimeout`, which is never retried.
    pub request_timeout_secs: u64,

    /// TCP connect timeout in seconds. Default: 10.
    pub connect_timeout_secs: u64,

    /// Maximum retry attempts when the backend is unreachable. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled after each attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Pre-constructed transport. Takes precedence over `backend_url`.
    pub backend: Option<Arc<dyn ConversionBackend>>,

    /// Which residual markup tags survive normalisation.
    pub markup_policy: MarkupPolicy,

    /// Package images the backend returned but the markup never referenced. Default: true.
    ///
    /// They are appended after the referenced images under continued indices.
    pub include_orphan_images: bool,

    /// Compression used for archive entries. Default: deflated.
    pub compression: ArchiveCompression,

    /// Optional per-stage progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            request_timeout_secs: 300,
            connect_timeout_secs: 10,
            max_retries: 3,
            retry_backoff_ms: 500,
            backend: None,
            markup_policy: MarkupPolicy::default(),
            include_orphan_images: true,
            compression: ArchiveCompression::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("backend_url", &self.backend_url)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("backend", &self.backend.as_ref().map(|_| "<dyn ConversionBackend>"))
            .field("markup_policy", &self.markup_policy)
            .field("include_orphan_images", &self.include_orphan_images)
            .field("compression", &self.compression)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ConversionProgressCallback>"),
            )
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Defaults, with the backend URL taken from `DOCLING_SERVER_URL` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var(BACKEND_URL_ENV) {
            if !url.trim().is_empty() {
                config.backend_url = url.trim().to_string();
            }
        }
        config
    }
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn backend_url(mut self, url: impl Into<String>) -> Self {
        self.config.backend_url = url.into();
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connect_timeout_secs = secs;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn ConversionBackend>) -> Self {
        self.config.backend = Some(backend);
        self
    }

    pub fn markup_policy(mut self, policy: MarkupPolicy) -> Self {
        self.config.markup_policy = policy;
        self
    }

    pub fn include_orphan_images(mut self, v: bool) -> Self {
        self.config.include_orphan_images = v;
        self
    }

    pub fn compression(mut self, compression: ArchiveCompression) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, ConvertError> {
        let c = &self.config;
        if c.backend.is_none() {
            let url = c.backend_url.trim();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConvertError::InvalidConfig(format!(
                    "backend URL must start with http:// or https://, got '{}'",
                    c.backend_url
                )));
            }
        }
        if c.request_timeout_secs == 0 {
            return Err(ConvertError::InvalidConfig(
                "request timeout must be ≥ 1 second".into(),
            ));
        }
        if c.max_retries > 10 {
            return Err(ConvertError::InvalidConfig(format!(
                "max retries must be ≤ 10, got {}",
                c.max_retries
            )));
        }
        Ok(self.config)
    }
}

// ── Enums / policies ─────────────────────────────────────────────────────

/// Compression method for archive entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ArchiveCompression {
    /// No compression; fastest, largest.
    Stored,
    /// DEFLATE (default), as Docmost exports use.
    #[default]
    Deflated,
}

/// Allow/deny list for residual HTML tags left in the backend's markup.
///
/// Tags not named in either set are stripped and their text content kept.
/// Tag names are matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkupPolicy {
    /// Tags left in the output verbatim (e.g. `sup`, `sub`).
    pub keep: BTreeSet<String>,
    /// Tags removed together with everything between their open and close tags.
    pub drop_with_content: BTreeSet<String>,
}

impl Default for MarkupPolicy {
    fn default() -> Self {
        Self {
            keep: BTreeSet::new(),
            drop_with_content: ["script", "style"].iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl MarkupPolicy {
    /// Strip every tag, keep all text content.
    pub fn strip_all() -> Self {
        Self {
            keep: BTreeSet::new(),
            drop_with_content: BTreeSet::new(),
        }
    }

    pub fn keep_tag(mut self, tag: impl AsRef<str>) -> Self {
        self.keep.insert(tag.as_ref().to_ascii_lowercase());
        self
    }

    pub fn drop_tag_with_content(mut self, tag: impl AsRef<str>) -> Self {
        self.drop_with_content.insert(tag.as_ref().to_ascii_lowercase());
        self
    }

    pub fn keeps(&self, tag: &str) -> bool {
        self.keep.contains(&tag.to_ascii_lowercase())
    }

    pub fn drops_content_of(&self, tag: &str) -> bool {
        self.drop_with_content.contains(&tag.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_client() {
        let c = ConversionConfig::default();
        assert_eq!(c.backend_url, DEFAULT_BACKEND_URL);
        assert_eq!(c.request_timeout_secs, 300);
        assert_eq!(c.max_retries, 3);
        assert!(c.include_orphan_images);
        assert_eq!(c.compression, ArchiveCompression::Deflated);
    }

    #[test]
    fn builder_rejects_bad_url() {
        let err = ConversionConfig::builder()
            .backend_url("docling:5001")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConvertError::InvalidConfig(_)));
    }

    #[test]
    fn builder_rejects_zero_timeout() {
        assert!(ConversionConfig::builder()
            .request_timeout_secs(0)
            .build()
            .is_err());
    }

    #[test]
    fn policy_is_case_insensitive() {
        let p = MarkupPolicy::strip_all().keep_tag("SUP");
        assert!(p.keeps("sup"));
        assert!(p.keeps("Sup"));
        assert!(!p.drops_content_of("script"));
        assert!(MarkupPolicy::default().drops_content_of("STYLE"));
    }

    #[test]
    fn debug_hides_trait_objects() {
        let s = format!("{:?}", ConversionConfig::default());
        assert!(s.contains("backend_url"));
        assert!(s.contains("markup_policy"));
    }
}
