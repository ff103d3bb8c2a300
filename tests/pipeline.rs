//! End-to-end tests for docmost-convert.
//!
//! Every test drives the public `process` entry point and reads the resulting
//! archive back with the `zip` crate. Backends are in-process doubles, or a
//! minimal HTTP server on a loopback port for the tests that exercise the
//! real multipart transport.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use docmost_convert::{
    process, process_to_file, ConversionBackend, ConversionConfig, ConversionRequest,
    ConvertError, ImagePayload, RawConversionResult, Stage,
};
use regex::Regex;
use std::collections::BTreeSet;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use zip::ZipArchive;

// ── Test helpers ─────────────────────────────────────────────────────────────

const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10, b'J', b'F', b'I', b'F'];

/// Returns the same raw result on every call and counts calls.
struct StaticBackend {
    raw: RawConversionResult,
    calls: AtomicUsize,
}

impl StaticBackend {
    fn new(markup: &str, images: Vec<ImagePayload>) -> Arc<Self> {
        Arc::new(Self {
            raw: RawConversionResult {
                markup: markup.to_string(),
                images,
                ..Default::default()
            },
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ConversionBackend for StaticBackend {
    async fn convert_file(
        &self,
        _request: &ConversionRequest,
    ) -> Result<RawConversionResult, ConvertError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.raw.clone())
    }
}

/// Never answers within any reasonable deadline.
#[derive(Default)]
struct HangingBackend {
    calls: AtomicUsize,
}

#[async_trait]
impl ConversionBackend for HangingBackend {
    async fn convert_file(
        &self,
        _request: &ConversionRequest,
    ) -> Result<RawConversionResult, ConvertError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(RawConversionResult::default())
    }
}

/// Route pipeline logs to the test harness; `RUST_LOG=docmost_convert=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn payload(reference: &str, media_type: Option<&str>, data: &[u8]) -> ImagePayload {
    ImagePayload {
        reference: reference.to_string(),
        media_type: media_type.map(str::to_string),
        data: data.to_vec(),
    }
}

fn request() -> ConversionRequest {
    ConversionRequest::new(
        b"PK\x03\x04docx".to_vec(),
        "Handbook.docx",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    )
}

fn config_with(backend: Arc<dyn ConversionBackend>) -> ConversionConfig {
    ConversionConfig::builder().backend(backend).build().unwrap()
}

/// Archive contents, in entry order.
struct Unpacked {
    names: Vec<String>,
    markdown: String,
    files: Vec<(String, Vec<u8>)>,
}

fn unpack(bytes: &[u8]) -> Unpacked {
    let mut archive = ZipArchive::new(Cursor::new(bytes.to_vec())).expect("valid zip");
    let mut names = Vec::new();
    let mut markdown = String::new();
    let mut files = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).unwrap();
        let name = entry.name().to_string();
        if name == "document.md" {
            entry.read_to_string(&mut markdown).unwrap();
        } else if !entry.is_dir() {
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            files.push((name.clone(), data));
        }
        names.push(name);
    }
    Unpacked {
        names,
        markdown,
        files,
    }
}

/// Every local image link in the Markdown names an archive entry.
fn assert_no_dangling_references(unpacked: &Unpacked) {
    let link = Regex::new(r"!\[[^\]]*\]\((images/[^)\s]+)\)").unwrap();
    let entries: BTreeSet<&str> = unpacked.files.iter().map(|(n, _)| n.as_str()).collect();
    for caps in link.captures_iter(&unpacked.markdown) {
        assert!(
            entries.contains(&caps[1]),
            "dangling reference {} in:\n{}",
            &caps[1],
            unpacked.markdown
        );
    }
}

// ── Image numbering ──────────────────────────────────────────────────────────

#[tokio::test]
async fn repeated_reference_yields_single_image() {
    let backend = StaticBackend::new(
        "Intro\n\n<img ref=\"r1\" alt=\"Logo\">\n\nAgain:\n\n<img ref=\"r1\">",
        vec![payload("r1", Some("image/png"), PNG)],
    );
    let archive = process(&request(), &config_with(backend)).await.unwrap();
    let unpacked = unpack(&archive.bytes);

    assert_eq!(archive.image_count, 1);
    assert_eq!(
        unpacked.names,
        vec!["document.md", "images/", "images/image_001.png"]
    );
    assert_eq!(unpacked.markdown.matches("images/image_001.png").count(), 2);
    assert!(unpacked.markdown.contains("![Logo](images/image_001.png)"));
    assert_no_dangling_references(&unpacked);
}

#[tokio::test]
async fn indices_follow_markup_order_not_payload_order() {
    let backend = StaticBackend::new(
        "First <img ref=\"r1\"> then <img ref=\"r2\">",
        vec![
            payload("r2", Some("image/jpeg"), JPEG),
            payload("r1", Some("image/png"), PNG),
        ],
    );
    let archive = process(&request(), &config_with(backend)).await.unwrap();
    let unpacked = unpack(&archive.bytes);

    assert_eq!(
        unpacked.files,
        vec![
            ("images/image_001.png".to_string(), PNG.to_vec()),
            ("images/image_002.jpg".to_string(), JPEG.to_vec()),
        ]
    );
    let first = unpacked.markdown.find("image_001").unwrap();
    let second = unpacked.markdown.find("image_002").unwrap();
    assert!(first < second);
}

#[tokio::test]
async fn mixed_reference_forms_are_numbered_contiguously() {
    let data_uri = format!("data:image/png;base64,{}", STANDARD.encode(PNG));
    let markup = format!(
        "# Guide\n\n![a]({data_uri})\n\n![b](pictures/fig.jpg)\n\n<!-- image -->\n\n![c]({data_uri})\n\n![ext](https://cdn.example.com/x.png)"
    );
    let backend = StaticBackend::new(
        &markup,
        vec![
            payload("pictures/fig.jpg", None, JPEG),
            payload("chart", Some("image/png"), PNG),
        ],
    );
    let archive = process(&request(), &config_with(backend)).await.unwrap();
    let unpacked = unpack(&archive.bytes);

    let names: Vec<&str> = unpacked.files.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names.len(), archive.image_count);
    for (i, name) in names.iter().enumerate() {
        assert!(
            name.starts_with(&format!("images/image_{:03}.", i + 1)),
            "non-contiguous index: {names:?}"
        );
    }
    assert!(unpacked
        .markdown
        .contains("![ext](https://cdn.example.com/x.png)"));
    assert_no_dangling_references(&unpacked);
}

#[tokio::test]
async fn orphans_follow_referenced_images_unless_disabled() {
    let markup = "<img ref=\"used\">";
    let images = vec![
        payload("spare", Some("image/jpeg"), JPEG),
        payload("used", Some("image/png"), PNG),
    ];

    let backend = StaticBackend::new(markup, images.clone());
    let with = process(&request(), &config_with(backend)).await.unwrap();
    assert_eq!(
        unpack(&with.bytes).names,
        vec![
            "document.md",
            "images/",
            "images/image_001.png",
            "images/image_002.jpg"
        ]
    );

    let backend = StaticBackend::new(markup, images);
    let config = ConversionConfig::builder()
        .backend(backend)
        .include_orphan_images(false)
        .build()
        .unwrap();
    let without = process(&request(), &config).await.unwrap();
    assert_eq!(without.image_count, 1);
}

// ── Archive shape ────────────────────────────────────────────────────────────

#[tokio::test]
async fn text_only_document_has_empty_images_directory() {
    let backend = StaticBackend::new("Just **text**.\r\n\r\n\r\n\r\nMore.", vec![]);
    let archive = process(&request(), &config_with(backend)).await.unwrap();
    let unpacked = unpack(&archive.bytes);

    assert_eq!(archive.image_count, 0);
    assert_eq!(unpacked.names, vec!["document.md", "images/"]);
    assert_eq!(unpacked.markdown, "Just **text**.\n\nMore.\n");
}

#[tokio::test]
async fn code_samples_pass_through_untouched() {
    let markup = "Example:\n\n```markdown\n![logo](logo.png)\n```";
    let backend = StaticBackend::new(markup, vec![]);
    let archive = process(&request(), &config_with(backend)).await.unwrap();
    let unpacked = unpack(&archive.bytes);

    assert_eq!(unpacked.names, vec!["document.md", "images/"]);
    assert_eq!(
        unpacked.markdown,
        "Example:\n\n```markdown\n![logo](logo.png)\n```\n"
    );
}

#[tokio::test]
async fn skipped_picture_keeps_later_images_in_place() {
    let backend = StaticBackend::new(
        "A\n\n<!-- image -->\n\nB\n\n<!-- image -->\n\nC\n\n<!-- image -->",
        vec![
            payload("image_0.png", Some("image/png"), PNG),
            payload("image_2.jpeg", Some("image/jpeg"), JPEG),
        ],
    );
    let archive = process(&request(), &config_with(backend)).await.unwrap();
    let unpacked = unpack(&archive.bytes);

    assert_eq!(
        unpacked.markdown,
        "A\n\n![](images/image_001.png)\n\nB\n\nC\n\n![](images/image_002.jpg)\n"
    );
    assert_no_dangling_references(&unpacked);
}

#[tokio::test]
async fn dash_placeholder_rows_survive_packaging() {
    let markup = "| Item | Qty |\n|---|---|\n| - | - |\n| a | 2 |";
    let backend = StaticBackend::new(markup, vec![]);
    let archive = process(&request(), &config_with(backend)).await.unwrap();
    assert_eq!(
        unpack(&archive.bytes).markdown,
        "| Item | Qty |\n| --- | --- |\n| - | - |\n| a | 2 |\n"
    );
}

#[tokio::test]
async fn identical_input_gives_identical_archive() {
    let markup = "## Table\n\n| a | b |\n| 1 | 2 |\n\n<img ref=\"r1\">";
    let images = vec![payload("r1", None, PNG)];
    let a = process(
        &request(),
        &config_with(StaticBackend::new(markup, images.clone())),
    )
    .await
    .unwrap();
    let b = process(&request(), &config_with(StaticBackend::new(markup, images)))
        .await
        .unwrap();
    assert_eq!(a.bytes, b.bytes);
}

#[tokio::test]
async fn packaged_markdown_is_already_normalized() {
    let markup = "```markdown\n### Deep\n\n* one\n* two\n\n<table><tr><th>K</th></tr><tr><td>v</td></tr></table>\n```";
    let backend = StaticBackend::new(markup, vec![]);
    let archive = process(&request(), &config_with(backend)).await.unwrap();
    let md = unpack(&archive.bytes).markdown;

    assert_eq!(md, "# Deep\n\n- one\n- two\n\n| K |\n| --- |\n| v |\n");

    let again = StaticBackend::new(&md, vec![]);
    let second = process(&request(), &config_with(again)).await.unwrap();
    assert_eq!(unpack(&second.bytes).markdown, md);
}

#[tokio::test]
async fn archive_written_under_download_name() {
    let dir = tempfile::tempdir().unwrap();
    let backend = StaticBackend::new("Hello", vec![]);
    let path = process_to_file(&request(), dir.path(), &config_with(backend))
        .await
        .unwrap();
    assert_eq!(path, dir.path().join("Handbook_docmost.zip"));
    let unpacked = unpack(&std::fs::read(path).unwrap());
    assert_eq!(unpacked.markdown, "Hello\n");
}

// ── Failures ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn timeout_is_not_retried_and_produces_no_archive() {
    init_tracing();
    let backend = Arc::new(HangingBackend::default());
    let config = ConversionConfig::builder()
        .backend(backend.clone())
        .request_timeout_secs(1)
        .max_retries(3)
        .retry_backoff_ms(10)
        .build()
        .unwrap();

    let report = process(&request(), &config).await.unwrap_err();
    assert_eq!(report.stage, Stage::Converting);
    assert!(matches!(report.error, ConvertError::BackendTimeout { secs: 1 }));
    assert_eq!(report.http_status(), 504);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dangling_reference_fails_extraction() {
    let backend = StaticBackend::new("<img ref=\"ghost\">", vec![]);
    let report = process(&request(), &config_with(backend)).await.unwrap_err();
    assert_eq!(report.stage, Stage::Extracting);
    assert_eq!(report.error.kind(), "MalformedImageReference");
    assert_eq!(report.http_status(), 422);
    assert!(report.to_string().starts_with("Handbook.docx: extracting images failed"));
}

#[tokio::test]
async fn unterminated_fence_fails_normalization() {
    let backend = StaticBackend::new("# T\n\n~~~\ncode", vec![]);
    let report = process(&request(), &config_with(backend)).await.unwrap_err();
    assert_eq!(report.stage, Stage::Normalizing);
    assert!(matches!(
        report.error,
        ConvertError::UnsupportedMarkupConstruct { line: 3, .. }
    ));
}

// ── HTTP transport ───────────────────────────────────────────────────────────

/// Read one HTTP request (headers plus a multipart body) from `stream`.
async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf);
        let Some(boundary) = text
            .split("boundary=")
            .nth(1)
            .and_then(|rest| rest.split(['\r', '\n', ';']).next())
        else {
            continue;
        };
        if text.contains(&format!("--{boundary}--")) {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn http_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

#[tokio::test]
async fn http_backend_posts_multipart_and_parses_response() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let body = serde_json::json!({
        "document": {
            "md_content": "# Report\n\n![Figure 1](image_0.png)\n\nText with <b>bold</b>.",
            "images": [{
                "filename": "image_0.png",
                "content_base64": STANDARD.encode(PNG),
                "mime_type": "image/png"
            }]
        },
        "status": "success",
        "errors": [],
        "processing_time": 1.5
    })
    .to_string();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let req = read_request(&mut stream).await;
        stream
            .write_all(http_response("200 OK", &body).as_bytes())
            .await
            .unwrap();
        stream.shutdown().await.ok();
        req
    });

    let config = ConversionConfig::builder()
        .backend_url(format!("http://{addr}/"))
        .build()
        .unwrap();
    let archive = process(&request(), &config).await.unwrap();
    let raw_request = server.await.unwrap();

    assert!(raw_request.starts_with("POST /v1/convert/file HTTP/1.1"));
    assert!(raw_request.contains("name=\"files\""));
    assert!(raw_request.contains("filename=\"Handbook.docx\""));

    let unpacked = unpack(&archive.bytes);
    assert_eq!(
        unpacked.markdown,
        "# Report\n\n![Figure 1](images/image_001.png)\n\nText with bold.\n"
    );
    assert_eq!(
        unpacked.files,
        vec![("images/image_001.png".to_string(), PNG.to_vec())]
    );
}

#[tokio::test]
async fn http_503_is_retried_then_reported_unavailable() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = read_request(&mut stream).await;
            let _ = stream
                .write_all(http_response("503 Service Unavailable", "{}").as_bytes())
                .await;
            let _ = stream.shutdown().await;
        }
    });

    let config = ConversionConfig::builder()
        .backend_url(format!("http://{addr}"))
        .max_retries(2)
        .retry_backoff_ms(10)
        .build()
        .unwrap();
    let report = process(&request(), &config).await.unwrap_err();

    assert_eq!(report.stage, Stage::Converting);
    assert!(report.error.is_transient());
    assert_eq!(report.http_status(), 503);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn http_failure_status_in_body_is_a_rejection() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = r#"{"status":"failure","errors":[{"error_message":"Unsupported format"}]}"#;

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut stream).await;
        let _ = stream
            .write_all(http_response("200 OK", body).as_bytes())
            .await;
        let _ = stream.shutdown().await;
    });

    let config = ConversionConfig::builder()
        .backend_url(format!("http://{addr}"))
        .build()
        .unwrap();
    let report = process(&request(), &config).await.unwrap_err();
    match report.error {
        ConvertError::BackendRejected { detail, .. } => {
            assert!(detail.contains("Unsupported format"))
        }
        other => panic!("expected BackendRejected, got {other:?}"),
    }
}
