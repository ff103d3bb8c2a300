//! Backend interaction: submit a document and fetch the raw conversion.
//!
//! The transport is a [`ConversionBackend`] trait object so the pooled HTTP
//! implementation can be replaced by an in-process double in tests. The
//! [`ConversionClient`] wraps any backend with the deadline and the retry
//! policy, so both apply no matter which transport is plugged in.
//!
//! ## Retry Strategy
//!
//! Only [`ConvertError::BackendUnavailable`] is retried, with exponential
//! backoff (`retry_backoff_ms * 2^(attempt-1)`): 500 ms → 1 s → 2 s with the
//! defaults. A timeout is returned at once; the backend may simply be slow on
//! a large document and hammering it again helps nobody. A rejection is
//! deterministic and retrying unchanged input yields the same answer.

use crate::config::ConversionConfig;
use crate::error::ConvertError;
use crate::output::{ConversionRequest, DocumentMetadata, ImagePayload, RawConversionResult};
use crate::pipeline::images::{decode_data_uri, media_type_from_name};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

/// Path of the conversion endpoint, relative to the backend base URL.
pub const CONVERT_PATH: &str = "/v1/convert/file";

/// A transport able to turn one document into a [`RawConversionResult`].
///
/// Implementations must be safe to share between concurrent requests.
#[async_trait]
pub trait ConversionBackend: Send + Sync {
    async fn convert_file(
        &self,
        request: &ConversionRequest,
    ) -> Result<RawConversionResult, ConvertError>;
}

// ── HTTP transport ───────────────────────────────────────────────────────

/// docling-serve compatible HTTP backend (`POST /v1/convert/file`, multipart).
///
/// Holds one pooled `reqwest::Client`; cloning the backend shares the pool.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: String,
    timeout_secs: u64,
}

impl HttpBackend {
    pub fn new(config: &ConversionConfig) -> Result<Self, ConvertError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| ConvertError::InvalidConfig(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint_url(&config.backend_url),
            timeout_secs: config.request_timeout_secs,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn transport_error(&self, e: reqwest::Error) -> ConvertError {
        if e.is_timeout() {
            ConvertError::BackendTimeout {
                secs: self.timeout_secs,
            }
        } else {
            ConvertError::BackendUnavailable {
                url: self.endpoint.clone(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl ConversionBackend for HttpBackend {
    async fn convert_file(
        &self,
        request: &ConversionRequest,
    ) -> Result<RawConversionResult, ConvertError> {
        let part = reqwest::multipart::Part::bytes(request.bytes.clone())
            .file_name(request.filename.clone())
            .mime_str(&request.mime_type)
            .map_err(|e| ConvertError::InvalidInput {
                input: request.mime_type.clone(),
                reason: format!("not a valid MIME type: {e}"),
            })?;
        let form = reqwest::multipart::Form::new().part("files", part);

        debug!("POST {} ({} bytes)", self.endpoint, request.bytes.len());
        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                502 | 503 => ConvertError::BackendUnavailable {
                    url: self.endpoint.clone(),
                    reason: format!("HTTP {status}"),
                },
                504 => ConvertError::BackendTimeout {
                    secs: self.timeout_secs,
                },
                code => ConvertError::BackendRejected {
                    status: code,
                    detail: truncate(&body, 500),
                },
            });
        }

        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;
        parse_response(&body, status.as_u16())
    }
}

/// `http://host:5001/` → `http://host:5001/v1/convert/file`
pub fn endpoint_url(base_url: &str) -> String {
    format!("{}{}", base_url.trim().trim_end_matches('/'), CONVERT_PATH)
}

// ── Response decoding ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ConvertResponse {
    #[serde(default)]
    document: Option<ExportDocument>,
    #[serde(default)]
    markdown: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
    #[serde(default)]
    processing_time: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct ExportDocument {
    #[serde(default)]
    md_content: Option<String>,
    #[serde(default)]
    markdown: Option<String>,
    #[serde(default)]
    main_text: Option<String>,
    #[serde(default)]
    images: Vec<ImagePart>,
}

#[derive(Debug, Deserialize)]
struct ImagePart {
    #[serde(default, alias = "ref", alias = "id")]
    reference: Option<String>,
    #[serde(default, alias = "name")]
    filename: Option<String>,
    #[serde(default, alias = "data")]
    content_base64: Option<String>,
    #[serde(default, alias = "mimetype", alias = "media_type")]
    mime_type: Option<String>,
}

/// Decode a backend response body into a [`RawConversionResult`].
///
/// Markdown is looked up in `document.md_content`, `document.markdown`, the
/// top-level `markdown`, then `document.main_text`; a response with none of
/// them yields empty markup rather than an error.
pub fn parse_response(body: &[u8], http_status: u16) -> Result<RawConversionResult, ConvertError> {
    let parsed: ConvertResponse =
        serde_json::from_slice(body).map_err(|e| ConvertError::BackendRejected {
            status: http_status,
            detail: format!("unreadable response body: {e}"),
        })?;

    let status = parsed.status.clone().unwrap_or_else(|| "success".to_string());
    let errors: Vec<String> = parsed.errors.iter().map(error_message).collect();

    if matches!(status.as_str(), "failure" | "skipped") {
        let detail = if errors.is_empty() {
            format!("backend status '{status}'")
        } else {
            errors.join("; ")
        };
        return Err(ConvertError::BackendRejected {
            status: http_status,
            detail,
        });
    }
    if status == "partial_success" {
        warn!("Backend reported partial success: {}", errors.join("; "));
    }

    let document = parsed.document.unwrap_or_default();
    let markup = document
        .md_content
        .or(document.markdown)
        .or(parsed.markdown)
        .or(document.main_text)
        .unwrap_or_else(|| {
            warn!("No markdown content found in backend response");
            String::new()
        });

    let mut images = Vec::with_capacity(document.images.len());
    for (i, part) in document.images.into_iter().enumerate() {
        images.push(decode_image_part(i, part, http_status)?);
    }

    Ok(RawConversionResult {
        markup,
        images,
        metadata: DocumentMetadata {
            status,
            processing_time: parsed.processing_time,
            errors,
        },
    })
}

fn decode_image_part(
    position: usize,
    part: ImagePart,
    http_status: u16,
) -> Result<ImagePayload, ConvertError> {
    let reference = part
        .reference
        .or_else(|| part.filename.clone())
        .unwrap_or_else(|| format!("#{position}"));
    let encoded = part.content_base64.unwrap_or_default();

    let (data, uri_media_type) = if encoded.trim_start().starts_with("data:") {
        let (media_type, data) =
            decode_data_uri(&encoded).map_err(|detail| ConvertError::BackendRejected {
                status: http_status,
                detail: format!("image payload '{reference}': {detail}"),
            })?;
        (data, Some(media_type))
    } else {
        let data = STANDARD
            .decode(strip_whitespace(&encoded))
            .map_err(|e| ConvertError::BackendRejected {
                status: http_status,
                detail: format!("image payload '{reference}' is not valid base64: {e}"),
            })?;
        (data, None)
    };

    let media_type = part
        .mime_type
        .filter(|m| !m.trim().is_empty())
        .or(uri_media_type)
        .or_else(|| part.filename.as_deref().and_then(media_type_from_name))
        .or_else(|| media_type_from_name(&reference));

    Ok(ImagePayload {
        reference,
        media_type,
        data,
    })
}

fn error_message(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => map
            .get("error_message")
            .or_else(|| map.get("message"))
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_ascii_whitespace()).collect()
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars).collect();
        format!("{head}\u{2026}")
    }
}

// ── Client with deadline + retry ─────────────────────────────────────────

/// Submits documents to a [`ConversionBackend`] under a deadline and a
/// transient-only retry policy.
#[derive(Clone)]
pub struct ConversionClient {
    backend: Arc<dyn ConversionBackend>,
    backend_label: String,
    timeout_secs: u64,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl ConversionClient {
    /// Use `config.backend` when set, otherwise an [`HttpBackend`] on `config.backend_url`.
    pub fn from_config(config: &ConversionConfig) -> Result<Self, ConvertError> {
        let (backend, label): (Arc<dyn ConversionBackend>, String) = match config.backend {
            Some(ref backend) => (Arc::clone(backend), "<custom backend>".to_string()),
            None => {
                let http = HttpBackend::new(config)?;
                let label = http.endpoint().to_string();
                (Arc::new(http), label)
            }
        };
        Ok(Self {
            backend,
            backend_label: label,
            timeout_secs: config.request_timeout_secs,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
        })
    }

    /// Convert one document, retrying only while the backend is unreachable.
    ///
    /// Dropping the returned future aborts the in-flight call and any pending
    /// retry; no further backend calls are made.
    pub async fn convert(
        &self,
        request: &ConversionRequest,
    ) -> Result<RawConversionResult, ConvertError> {
        let start = Instant::now();
        let deadline = Duration::from_secs(self.timeout_secs);
        let mut last_err: Option<ConvertError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self
                    .retry_backoff_ms
                    .saturating_mul(2u64.saturating_pow(attempt - 1));
                warn!(
                    "{}: retry {}/{} after {}ms",
                    request.filename, attempt, self.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match timeout(deadline, self.backend.convert_file(request)).await {
                Err(_elapsed) => {
                    warn!(
                        "{}: no response from {} within {}s",
                        request.filename, self.backend_label, self.timeout_secs
                    );
                    return Err(ConvertError::BackendTimeout {
                        secs: self.timeout_secs,
                    });
                }
                Ok(Ok(raw)) => {
                    info!(
                        "{}: backend returned {} chars of markup and {} images in {:?}",
                        request.filename,
                        raw.markup.len(),
                        raw.images.len(),
                        start.elapsed()
                    );
                    return Ok(raw);
                }
                Ok(Err(e)) if e.is_transient() => {
                    warn!(
                        "{}: attempt {} failed: {}",
                        request.filename,
                        attempt + 1,
                        e
                    );
                    last_err = Some(e);
                }
                Ok(Err(e)) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| ConvertError::BackendUnavailable {
            url: self.backend_label.clone(),
            reason: "no attempt was made".to_string(),
        }))
    }
}
