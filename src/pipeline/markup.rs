//! Residual HTML handling for prose text (never applied inside code fences).
//!
//! The backend mixes Markdown with leftover HTML: comments, `<table>` blocks
//! from layout analysis, formatting tags Docmost cannot import. Each pass here
//! removes or maps one family of constructs and leaves no markup behind that
//! a second run would treat differently.
//!
//! Passes, in order:
//! 1. HTML comments removed
//! 2. `<table>` blocks converted to pipe tables
//! 3. tags in [`MarkupPolicy::drop_with_content`] removed with their content
//! 4. every other tag not in [`MarkupPolicy::keep`] stripped, text kept;
//!    block-level tags become paragraph breaks, `<li>` becomes a bullet

use crate::config::MarkupPolicy;
use crate::error::ConvertError;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::ops::Range;

/// Upper bound on strip iterations; tags nested inside tag syntax need more than one.
const MAX_STRIP_ROUNDS: usize = 8;

static RE_TABLE_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<table\b[^>]*>").unwrap());
static RE_TABLE_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</table\s*>").unwrap());
static RE_ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<tr\b[^>]*>(.*?)</tr\s*>").unwrap());
static RE_CELL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<t([hd])\b([^>]*)>(.*?)</t[hd]\s*>").unwrap());
static RE_COLSPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)colspan\s*=\s*["']?(\d+)"#).unwrap());
static RE_ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());
static RE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<(/?)([a-z][a-z0-9-]*)(?:\s[^<>]*)?/?>").unwrap());
static RE_CODE_SPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"``[^`\n](?:[^\n]*?[^`\n])?``|`[^`\n]+`").unwrap());
static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Run every prose pass over `text`. `first_line` is the 1-based line number
/// of `text` within the document, used in error reports.
pub(crate) fn clean_prose(
    text: &str,
    first_line: usize,
    policy: &MarkupPolicy,
) -> Result<String, ConvertError> {
    let s = remove_comments(text, first_line)?;
    let s = if policy.keeps("table") {
        s
    } else {
        convert_html_tables(&s, first_line)?
    };
    let s = drop_tags_with_content(&s, policy);
    Ok(strip_tags(&s, policy))
}

fn line_of(text: &str, byte_pos: usize, first_line: usize) -> usize {
    first_line + text[..byte_pos].matches('\n').count()
}

// ── Pass 1: comments ─────────────────────────────────────────────────────

fn remove_comments(text: &str, first_line: usize) -> Result<String, ConvertError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut consumed = 0;
    while let Some(start) = rest.find("<!--") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 4..];
        let Some(end) = after.find("-->") else {
            return Err(ConvertError::UnsupportedMarkupConstruct {
                construct: "unterminated HTML comment".to_string(),
                line: line_of(text, consumed + start, first_line),
            });
        };
        let skip = start + 4 + end + 3;
        consumed += skip;
        rest = &rest[skip..];
    }
    out.push_str(rest);
    Ok(out)
}

// ── Pass 2: HTML tables ──────────────────────────────────────────────────

fn convert_html_tables(text: &str, first_line: usize) -> Result<String, ConvertError> {
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    while let Some(open) = RE_TABLE_OPEN.find_at(text, pos) {
        let Some(close) = RE_TABLE_CLOSE.find_at(text, open.end()) else {
            return Err(ConvertError::UnsupportedMarkupConstruct {
                construct: "unterminated <table>".to_string(),
                line: line_of(text, open.start(), first_line),
            });
        };
        if let Some(nested) = RE_TABLE_OPEN.find_at(text, open.end()) {
            if nested.start() < close.start() {
                return Err(ConvertError::UnsupportedMarkupConstruct {
                    construct: "nested <table>".to_string(),
                    line: line_of(text, nested.start(), first_line),
                });
            }
        }
        out.push_str(&text[pos..open.start()]);
        let rows = html_table_rows(&text[open.end()..close.start()]);
        if !rows.is_empty() {
            out.push_str("\n\n");
            out.push_str(&pipe_table(&rows));
            out.push_str("\n\n");
        }
        pos = close.end();
    }
    out.push_str(&text[pos..]);
    Ok(out)
}

fn html_table_rows(inner: &str) -> Vec<Vec<String>> {
    RE_ROW
        .captures_iter(inner)
        .map(|row| {
            let mut cells = Vec::new();
            for cell in RE_CELL.captures_iter(&row[1]) {
                cells.push(cell_text(&cell[3]));
                let span = RE_COLSPAN
                    .captures(&cell[2])
                    .and_then(|c| c[1].parse::<usize>().ok())
                    .unwrap_or(1)
                    .clamp(1, 64);
                cells.extend((1..span).map(|_| String::new()));
            }
            cells
        })
        .filter(|cells| !cells.is_empty())
        .collect()
}

fn cell_text(html: &str) -> String {
    let text = RE_ANY_TAG.replace_all(html, " ");
    let text = text.replace("&nbsp;", " ");
    RE_WHITESPACE
        .replace_all(text.trim(), " ")
        .replace('|', "\\|")
        .replace("\\\\|", "\\|")
}

/// First row is the header; the layout pass in the normalizer pads columns.
fn pipe_table(rows: &[Vec<String>]) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 1);
    for (i, row) in rows.iter().enumerate() {
        lines.push(format!("| {} |", row.join(" | ")));
        if i == 0 {
            let sep = vec!["---"; row.len()].join(" | ");
            lines.push(format!("| {sep} |"));
        }
    }
    lines.join("\n")
}

// ── Pass 3: tags dropped with content ────────────────────────────────────

static RE_OPEN_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<([a-z][a-z0-9:-]*)\b[^>]*>").unwrap());

fn drop_tags_with_content(text: &str, policy: &MarkupPolicy) -> String {
    if policy.drop_with_content.is_empty() {
        return text.to_string();
    }
    // ASCII lowercasing keeps byte offsets.
    let lower = text.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    while let Some(caps) = RE_OPEN_TAG.captures_at(text, pos) {
        let Some(open) = caps.get(0) else { break };
        let name = caps[1].to_ascii_lowercase();
        if !policy.drops_content_of(&name) {
            out.push_str(&text[pos..open.end()]);
            pos = open.end();
            continue;
        }
        out.push_str(&text[pos..open.start()]);
        // Unclosed: only the opening tag goes.
        pos = closing_tag_end(&lower, open.end(), &name).unwrap_or(open.end());
    }
    out.push_str(&text[pos..]);
    out
}

/// Byte offset just past the first `</name>` at or after `from`.
fn closing_tag_end(lower: &str, from: usize, name: &str) -> Option<usize> {
    let needle = format!("</{name}");
    let mut at = from;
    while let Some(i) = lower[at..].find(&needle) {
        let after = at + i + needle.len();
        let rest = &lower[after..];
        let trimmed = rest.trim_start();
        if trimmed.starts_with('>') {
            return Some(after + (rest.len() - trimmed.len()) + 1);
        }
        at = after;
    }
    None
}

// ── Pass 4: strip remaining tags ─────────────────────────────────────────

fn strip_tags(text: &str, policy: &MarkupPolicy) -> String {
    text.split('\n')
        .map(|line| {
            let in_table_row = line.trim_start().starts_with('|');
            let mut current = line.to_string();
            for _ in 0..MAX_STRIP_ROUNDS {
                let next = outside_code_spans(&current, |chunk| {
                    strip_tags_once(chunk, policy, in_table_row)
                });
                if next == current {
                    break;
                }
                current = next;
            }
            current
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_tags_once(chunk: &str, policy: &MarkupPolicy, in_table_row: bool) -> String {
    RE_TAG
        .replace_all(chunk, |caps: &Captures<'_>| {
            let closing = !caps[1].is_empty();
            let name = caps[2].to_ascii_lowercase();
            if policy.keeps(&name) {
                return caps[0].to_string();
            }
            if in_table_row {
                return if is_block_tag(&name) || name == "br" {
                    " ".to_string()
                } else {
                    String::new()
                };
            }
            tag_replacement(&name, closing).to_string()
        })
        .replace("&nbsp;", " ")
}

fn tag_replacement(name: &str, closing: bool) -> &'static str {
    match (name, closing) {
        ("br", _) => " ",
        ("hr", _) => "\n\n---\n\n",
        ("li", false) => "\n- ",
        ("li", true) => "\n",
        ("h1", false) => "\n\n# ",
        ("h2", false) => "\n\n## ",
        ("h3", false) => "\n\n### ",
        ("h4", false) => "\n\n#### ",
        ("h5", false) => "\n\n##### ",
        ("h6", false) => "\n\n###### ",
        (n, _) if is_block_tag(n) => "\n\n",
        _ => "",
    }
}

fn is_block_tag(name: &str) -> bool {
    matches!(
        name,
        "p" | "div"
            | "section"
            | "article"
            | "header"
            | "footer"
            | "main"
            | "aside"
            | "nav"
            | "figure"
            | "figcaption"
            | "blockquote"
            | "pre"
            | "ul"
            | "ol"
            | "table"
            | "thead"
            | "tbody"
            | "tfoot"
            | "tr"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
    )
}

/// Apply `f` to the parts of `line` outside inline code spans.
/// Byte ranges of inline code spans within one line.
pub(crate) fn code_span_ranges(line: &str) -> impl Iterator<Item = Range<usize>> + '_ {
    RE_CODE_SPAN.find_iter(line).map(|m| m.range())
}

fn outside_code_spans(line: &str, f: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(line.len());
    let mut last = 0;
    for span in RE_CODE_SPAN.find_iter(line) {
        out.push_str(&f(&line[last..span.start()]));
        out.push_str(span.as_str());
        last = span.end();
    }
    out.push_str(&f(&line[last..]));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean(s: &str) -> String {
        clean_prose(s, 1, &MarkupPolicy::default()).unwrap()
    }

    #[test]
    fn comments_are_removed() {
        assert_eq!(remove_comments("a <!-- x --> b", 1).unwrap(), "a  b");
        assert_eq!(
            remove_comments("a\n<!--\nmulti\n-->\nb", 1).unwrap(),
            "a\n\nb"
        );
    }

    #[test]
    fn unterminated_comment_reports_line() {
        let err = remove_comments("ok\nok\n<!-- never closed", 10).unwrap_err();
        match err {
            ConvertError::UnsupportedMarkupConstruct { line, .. } => assert_eq!(line, 12),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn html_table_becomes_pipe_table() {
        let html = "<table><tr><th>Name</th><th>Qty</th></tr>\n<tr><td>a|b</td><td><b>2</b></td></tr></table>";
        let out = convert_html_tables(html, 1).unwrap();
        assert!(out.contains("| Name | Qty |\n| --- | --- |\n| a\\|b | 2 |"), "got {out:?}");
    }

    #[test]
    fn colspan_keeps_column_count() {
        let html = "<table><tr><td colspan=\"2\">wide</td></tr><tr><td>a</td><td>b</td></tr></table>";
        let out = convert_html_tables(html, 1).unwrap();
        assert!(out.contains("| wide |  |"));
    }

    #[test]
    fn unterminated_and_nested_tables_fail() {
        assert!(matches!(
            convert_html_tables("<table><tr><td>x</td></tr>", 1),
            Err(ConvertError::UnsupportedMarkupConstruct { .. })
        ));
        let nested = "<table><tr><td><table><tr><td>x</td></tr></table></td></tr></table>";
        match convert_html_tables(nested, 1).unwrap_err() {
            ConvertError::UnsupportedMarkupConstruct { construct, .. } => {
                assert!(construct.contains("nested"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn tags_are_stripped_text_kept() {
        assert_eq!(clean("a <span class=\"x\">b</span> c"), "a b c");
        assert_eq!(clean("x<br/>y"), "x y");
    }

    #[test]
    fn script_and_style_dropped_with_content() {
        assert_eq!(clean("a<script>alert(1)</script>b<style>p{}</style>c"), "abc");
    }

    #[test]
    fn configured_drop_tags_match_case_insensitively() {
        let policy = MarkupPolicy::default().drop_tag_with_content("Aside");
        let out = clean_prose("a<ASIDE id=1>note</aside >b <asides>kept</asides>", 1, &policy)
            .unwrap();
        assert_eq!(out, "ab kept");
    }

    #[test]
    fn unclosed_drop_tag_keeps_following_text() {
        assert_eq!(clean("a<script>b"), "ab");
    }

    #[test]
    fn kept_tags_survive() {
        let policy = MarkupPolicy::default().keep_tag("sup");
        let out = clean_prose("E = mc<sup>2</sup> <font>x</font>", 1, &policy).unwrap();
        assert_eq!(out, "E = mc<sup>2</sup> x");
    }

    #[test]
    fn code_spans_are_untouched() {
        assert_eq!(clean("use `<div>` here <i>now</i>"), "use `<div>` here now");
    }

    #[test]
    fn autolinks_are_not_tags() {
        assert_eq!(clean("see <https://docmost.com>"), "see <https://docmost.com>");
    }

    #[test]
    fn nested_tag_syntax_reaches_fixpoint() {
        let once = clean("<<b>div>text");
        assert_eq!(once.trim(), "text");
        assert_eq!(clean(&once), once);
    }

    #[test]
    fn block_tags_in_table_rows_stay_inline() {
        assert_eq!(clean("| <p>a</p> | b<br>c |"), "|  a  | b c |");
    }

    #[test]
    fn html_headings_and_items_map_to_markdown() {
        let out = clean("<h2>Scope</h2><ul><li>one</li><li>two</li></ul>");
        assert!(out.contains("## Scope"));
        assert!(out.contains("- one\n"));
        assert!(out.contains("- two\n"));
    }
}
