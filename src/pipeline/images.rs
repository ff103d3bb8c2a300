//! Image extraction: pull every image out of the raw markup and renumber it.
//!
//! The backend can point at an image in several ways, and a single document
//! may mix them:
//!
//! | Form | Example | Identity |
//! |------|---------|----------|
//! | Markdown data URI | `![fig](data:image/png;base64,iVBO…)` | the URI itself |
//! | Markdown payload link | `![fig](image_0.png)` | payload reference |
//! | HTML tag | `<img ref="r1">`, `<img src="…">` | payload reference or URI |
//! | docling placeholder | `<!-- image -->` | picture `k` (`image_{k}.*` payload) |
//!
//! One scan walks all forms in document order, skipping fenced code blocks and
//! inline code spans. Each distinct identity gets
//! the next index on first sight and every occurrence is rewritten to
//! `![alt](images/image_NNN.ext)`. Absolute `http(s)` links are external and
//! left alone.

use crate::error::ConvertError;
use crate::output::{ExtractedImage, ImagePayload, RawConversionResult, ReferenceMap};
use crate::pipeline::normalize::code_regions;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::ImageFormat;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use tracing::{debug, warn};

/// Result of [`extract_images`].
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Markup with every image reference pointing into `images/`.
    pub markup: String,
    /// Images in ascending index order, indices `1..=len` contiguous.
    pub images: Vec<ExtractedImage>,
    /// Origin reference → assigned index, in first-seen order.
    pub references: ReferenceMap,
}

static RE_IMAGE_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?x)
        !\[(?P<alt>[^\]\n]*)\]\(\s*(?P<target><[^>\n]*>|[^)\s]+)(?:\s+"[^"\n]*")?\s*\)
        | (?P<tag>(?i:<img\b[^>]*>))
        | (?P<placeholder><!--\s*image\s*-->)
        "#,
    )
    .unwrap()
});

// docling names the payload of picture `n` `image_{n}.<format>`.
static RE_PICTURE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^image_(\d+)\.[A-Za-z0-9]+$").unwrap());

static RE_IMG_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(?:^|\s)(ref|src|alt)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>"']+))"#).unwrap()
});

/// What a single reference occurrence points at.
enum Target<'a> {
    /// Inline `data:` URI.
    DataUri(&'a str),
    /// Absolute URL outside the document.
    External(&'a str),
    /// Token naming a separately returned payload.
    Payload(&'a str),
}

fn classify(target: &str) -> Target<'_> {
    let t = target.trim();
    if t.len() >= 5 && t[..5].eq_ignore_ascii_case("data:") {
        Target::DataUri(t)
    } else if t.starts_with("http://") || t.starts_with("https://") || t.starts_with("//") {
        Target::External(t)
    } else {
        Target::Payload(t)
    }
}

struct Extractor<'a> {
    payloads: &'a [ImagePayload],
    /// Identity of each payload; a repeated reference gets a `#position` suffix.
    identities: Vec<String>,
    by_reference: HashMap<&'a str, usize>,
    by_file_name: HashMap<&'a str, usize>,
    /// Picture number → payload position, when every payload is named `image_{n}.*`.
    by_picture: Option<HashMap<usize, usize>>,
    used_payloads: HashSet<usize>,
    references: ReferenceMap,
    images: Vec<ExtractedImage>,
    placeholders_seen: usize,
}

impl<'a> Extractor<'a> {
    fn new(payloads: &'a [ImagePayload]) -> Self {
        let mut by_reference = HashMap::new();
        let mut by_file_name = HashMap::new();
        let mut identities = Vec::with_capacity(payloads.len());
        for (i, p) in payloads.iter().enumerate() {
            by_file_name.entry(file_name_of(&p.reference)).or_insert(i);
            match by_reference.get(p.reference.as_str()) {
                Some(&first) => {
                    warn!(
                        "Image payloads #{} and #{} share reference '{}'; links resolve to #{}",
                        first + 1,
                        i + 1,
                        short(&p.reference),
                        first + 1
                    );
                    identities.push(format!("{}#{}", p.reference, i));
                }
                None => {
                    by_reference.insert(p.reference.as_str(), i);
                    identities.push(p.reference.clone());
                }
            }
        }
        let by_picture = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let caps = RE_PICTURE_NAME.captures(file_name_of(&p.reference))?;
                let n = caps[1].parse::<usize>().ok()?;
                Some((n, i))
            })
            .collect::<Option<Vec<_>>>()
            .map(|pairs| {
                let mut map = HashMap::new();
                for (n, i) in pairs {
                    map.entry(n).or_insert(i);
                }
                map
            });
        Self {
            payloads,
            identities,
            by_reference,
            by_file_name,
            by_picture,
            used_payloads: HashSet::new(),
            references: ReferenceMap::new(),
            images: Vec::new(),
            placeholders_seen: 0,
        }
    }

    fn find_payload(&self, token: &str) -> Option<usize> {
        let token = token.trim_start_matches("./");
        self.by_reference
            .get(token)
            .or_else(|| self.by_file_name.get(file_name_of(token)))
            .copied()
    }

    /// Index for `identity`, registering a new image built by `make` on first sight.
    fn assign(
        &mut self,
        identity: &str,
        make: impl FnOnce() -> Result<(Vec<u8>, String), ConvertError>,
    ) -> Result<usize, ConvertError> {
        if let Some(index) = self.references.get(identity) {
            return Ok(index);
        }
        let (data, extension) = make()?;
        let index = self.images.len() + 1;
        self.references.insert(identity, index);
        let image = ExtractedImage {
            index,
            data,
            extension,
        };
        debug!("{} → {}", short(identity), image.file_name());
        self.images.push(image);
        Ok(index)
    }

    fn image(&self, index: usize) -> &ExtractedImage {
        &self.images[index - 1]
    }

    fn link(&self, alt: &str, index: usize) -> String {
        format!("![{}]({})", clean_alt(alt), self.image(index).archive_path())
    }

    /// Payload position for the `k`-th placeholder (0-based).
    fn placeholder_payload(&self, k: usize) -> Option<usize> {
        match &self.by_picture {
            Some(by_picture) => by_picture.get(&k).copied(),
            None => (k < self.payloads.len()).then_some(k),
        }
    }

    fn resolve_payload(&mut self, position: usize) -> Result<usize, ConvertError> {
        self.used_payloads.insert(position);
        let payloads = self.payloads;
        let payload = &payloads[position];
        let identity = self.identities[position].clone();
        self.assign(&identity, || {
            Ok((
                payload.data.clone(),
                extension_for(payload.media_type.as_deref(), &payload.data),
            ))
        })
    }

    fn resolve_target(&mut self, target: &str) -> Result<Option<usize>, ConvertError> {
        match classify(target) {
            Target::External(_) => Ok(None),
            Target::DataUri(uri) => {
                let index = self.assign(uri, || {
                    let (media_type, data) =
                        decode_data_uri(uri).map_err(|detail| {
                            ConvertError::MalformedImageReference {
                                reference: short(uri),
                                detail,
                            }
                        })?;
                    let ext = extension_for(Some(&media_type), &data);
                    Ok((data, ext))
                })?;
                Ok(Some(index))
            }
            Target::Payload(token) => match self.find_payload(token) {
                Some(position) => self.resolve_payload(position).map(Some),
                None => Err(ConvertError::MalformedImageReference {
                    reference: token.to_string(),
                    detail: format!(
                        "no image payload with this reference ({} returned)",
                        self.payloads.len()
                    ),
                }),
            },
        }
    }

    fn rewrite(&mut self, caps: &Captures<'_>) -> Result<String, ConvertError> {
        if caps.name("placeholder").is_some() {
            let k = self.placeholders_seen;
            self.placeholders_seen += 1;
            if let Some(position) = self.placeholder_payload(k) {
                let index = self.resolve_payload(position)?;
                return Ok(self.link("", index));
            }
            warn!("Image placeholder #{} has no payload; removed", k + 1);
            return Ok(String::new());
        }

        if let Some(tag) = caps.name("tag") {
            let attrs = parse_img_attrs(tag.as_str());
            let target = attrs
                .reference
                .as_deref()
                .or(attrs.src.as_deref())
                .ok_or_else(|| ConvertError::MalformedImageReference {
                    reference: tag.as_str().to_string(),
                    detail: "<img> tag has neither ref nor src".to_string(),
                })?;
            let alt = attrs.alt.as_deref().unwrap_or("");
            return Ok(match self.resolve_target(target)? {
                Some(index) => self.link(alt, index),
                None => format!("![{}]({})", clean_alt(alt), target.trim()),
            });
        }

        let alt = caps.name("alt").map_or("", |m| m.as_str());
        let raw_target = caps.name("target").map_or("", |m| m.as_str());
        let target = raw_target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .unwrap_or(raw_target);
        Ok(match self.resolve_target(target)? {
            Some(index) => self.link(alt, index),
            None => caps[0].to_string(),
        })
    }
}

/// Extract, deduplicate and renumber every image in `raw`.
///
/// Code blocks and code spans are copied unchanged. Payloads the markup never
/// references are appended after the referenced images, in backend order,
/// when `include_orphans` is set.
///
/// # Errors
/// [`ConvertError::MalformedImageReference`] when a reference token names no
/// payload, an `<img>` tag carries no target, or a data URI cannot be decoded.
pub fn extract_images(
    raw: &RawConversionResult,
    include_orphans: bool,
) -> Result<Extraction, ConvertError> {
    let mut extractor = Extractor::new(&raw.images);
    let mut markup = String::with_capacity(raw.markup.len());
    let mut last = 0;

    for prose in prose_ranges(&raw.markup) {
        for caps in RE_IMAGE_REF.captures_iter(&raw.markup[prose.clone()]) {
            let whole = caps.get(0).map_or(0..0, |m| m.range());
            markup.push_str(&raw.markup[last..prose.start + whole.start]);
            markup.push_str(&extractor.rewrite(&caps)?);
            last = prose.start + whole.end;
        }
    }
    markup.push_str(&raw.markup[last..]);

    let referenced = extractor.images.len();
    if include_orphans {
        for position in 0..raw.images.len() {
            if !extractor.used_payloads.contains(&position) {
                let index = extractor.resolve_payload(position)?;
                debug!(
                    "Orphan payload '{}' kept as {}",
                    raw.images[position].reference,
                    extractor.image(index).file_name()
                );
            }
        }
    }
    let orphans = extractor.images.len() - referenced;
    if orphans > 0 {
        debug!("{} orphan image(s) appended after {} referenced", orphans, referenced);
    }

    Ok(Extraction {
        markup,
        images: extractor.images,
        references: extractor.references,
    })
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// Complement of [`code_regions`] over `markup`.
fn prose_ranges(markup: &str) -> Vec<Range<usize>> {
    let mut prose = Vec::new();
    let mut pos = 0;
    for code in code_regions(markup) {
        if code.start > pos {
            prose.push(pos..code.start);
        }
        pos = pos.max(code.end);
    }
    if pos < markup.len() {
        prose.push(pos..markup.len());
    }
    prose
}

#[derive(Default)]
struct ImgAttrs {
    reference: Option<String>,
    src: Option<String>,
    alt: Option<String>,
}

fn parse_img_attrs(tag: &str) -> ImgAttrs {
    let body = tag
        .get(4..)
        .unwrap_or("")
        .trim_end_matches('>')
        .trim_end_matches('/');
    let mut attrs = ImgAttrs::default();
    for caps in RE_IMG_ATTR.captures_iter(body) {
        let value = caps
            .get(2)
            .or_else(|| caps.get(3))
            .or_else(|| caps.get(4))
            .map(|m| m.as_str().to_string());
        match caps[1].to_ascii_lowercase().as_str() {
            "ref" => attrs.reference = attrs.reference.take().or(value),
            "src" => attrs.src = attrs.src.take().or(value),
            _ => attrs.alt = attrs.alt.take().or(value),
        }
    }
    attrs.reference = attrs.reference.filter(|v| !v.trim().is_empty());
    attrs.src = attrs.src.filter(|v| !v.trim().is_empty());
    attrs
}

fn clean_alt(alt: &str) -> String {
    alt.replace(['[', ']', '\n', '\r'], " ").trim().to_string()
}

fn file_name_of(reference: &str) -> &str {
    reference.rsplit(['/', '\\']).next().unwrap_or(reference)
}

fn short(reference: &str) -> String {
    if reference.len() > 48 {
        let cut = (0..=48).rev().find(|&i| reference.is_char_boundary(i)).unwrap_or(0);
        format!("{}\u{2026}", &reference[..cut])
    } else {
        reference.to_string()
    }
}

/// Decode `data:<media-type>[;params];base64,<payload>` into `(media type, bytes)`.
pub fn decode_data_uri(uri: &str) -> Result<(String, Vec<u8>), String> {
    let rest = uri
        .trim()
        .get(5..)
        .filter(|_| uri.trim()[..5].eq_ignore_ascii_case("data:"))
        .ok_or_else(|| "not a data URI".to_string())?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| "data URI has no ',' separator".to_string())?;
    let mut params = header.split(';');
    let media_type = params.next().unwrap_or("").trim().to_ascii_lowercase();
    if !params.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
        return Err("only base64 data URIs are supported".to_string());
    }
    let cleaned: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let data = STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|e| format!("invalid base64 payload: {e}"))?;
    if data.is_empty() {
        return Err("empty image payload".to_string());
    }
    let media_type = if media_type.is_empty() {
        "image/png".to_string()
    } else {
        media_type
    };
    Ok((media_type, data))
}

/// Media type implied by an image file name's extension (`fig.JPG` → `image/jpeg`).
pub fn media_type_from_name(name: &str) -> Option<String> {
    let ext = std::path::Path::new(file_name_of(name))
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    if ext == "svg" {
        return Some("image/svg+xml".to_string());
    }
    ImageFormat::from_extension(&ext).map(|f| f.to_mime_type().to_string())
}

/// File extension for a payload: declared media type, then magic bytes, then `png`.
pub fn extension_for(media_type: Option<&str>, data: &[u8]) -> String {
    if let Some(mt) = media_type {
        let mt = mt.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match mt.as_str() {
            "image/svg+xml" => return "svg".to_string(),
            "image/jpg" | "image/pjpeg" => return "jpg".to_string(),
            _ => {}
        }
        if let Some(ext) = ImageFormat::from_mime_type(&mt).and_then(|f| f.extensions_str().first()) {
            return (*ext).to_string();
        }
    }
    if let Some(ext) = image::guess_format(data)
        .ok()
        .and_then(|f| f.extensions_str().first())
    {
        return (*ext).to_string();
    }
    "png".to_string()
}
