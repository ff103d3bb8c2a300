//! Markdown normalization: reduce backend markup to the subset Docmost imports.
//!
//! The raw markup is first cleaned at the text level (line endings, invisible
//! characters, a wrapping ```` ```markdown ```` fence, YAML front matter), then
//! split into fenced code and prose. Prose goes through the HTML passes in
//! [`super::markup`] and is parsed into a flat list of blocks:
//!
//! ```text
//! heading | paragraph | list | pipe table | code | thematic break
//! ```
//!
//! Blocks are adjusted (heading levels renumbered, list markers unified,
//! tables given exactly one header separator) and rendered back with one blank
//! line between blocks. Rendering only ever emits constructs the parser reads
//! back as the same blocks, so `normalize(normalize(x)) == normalize(x)`.
//!
//! Code fence content is never touched beyond trailing whitespace.

use crate::config::MarkupPolicy;
use crate::error::ConvertError;
use crate::output::NormalizedDocument;
use crate::pipeline::markup::{clean_prose, code_span_ranges};
use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Range;
use tracing::debug;

/// Normalize raw markup (after image extraction) into Docmost-ready Markdown.
///
/// # Errors
/// [`ConvertError::UnsupportedMarkupConstruct`] for an unterminated code
/// fence, an unterminated HTML comment, or an unterminated or nested
/// `<table>`. The error carries the 1-based line where the construct starts.
pub fn normalize(markup: &str, policy: &MarkupPolicy) -> Result<NormalizedDocument, ConvertError> {
    let text = prepare(markup);

    let mut blocks = Vec::new();
    for segment in split_fences(&text)? {
        match segment {
            Segment::Code(lines) => blocks.push(Block::Code(lines)),
            Segment::Prose { text, first_line } => {
                let cleaned = clean_prose(&text, first_line, policy)?;
                blocks.extend(parse_blocks(&cleaned));
            }
        }
    }

    renumber_headings(&mut blocks);
    let markdown = render(&blocks);
    debug!(
        blocks = blocks.len(),
        input_bytes = markup.len(),
        output_bytes = markdown.len(),
        "Normalized markdown"
    );
    Ok(NormalizedDocument { markdown })
}

// ── Text-level pre-passes ────────────────────────────────────────────────

fn prepare(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_invisible_chars(&s);
    let s = strip_outer_fence(&s);
    strip_front_matter(&s)
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

/// Zero-width space, BOM, soft hyphen, ZWNJ, ZWJ, word joiner.
fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            !matches!(
                c,
                '\u{200B}' | '\u{FEFF}' | '\u{00AD}' | '\u{200C}' | '\u{200D}' | '\u{2060}'
            )
        })
        .collect()
}

// Only an explicitly tagged fence is unwrapped; a bare ``` block is real code.
static RE_OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)[ \t]*\r?\n(.*)\r?\n```[ \t]*$").unwrap());

/// Byte range of the body of a ```` ```markdown ```` wrapper around the whole text.
fn outer_fence_body(input: &str) -> Option<Range<usize>> {
    let lead = input.len() - input.trim_start().len();
    let body = RE_OUTER_FENCE.captures(input.trim())?.get(1)?;
    Some(lead + body.start()..lead + body.end())
}

fn strip_outer_fence(input: &str) -> String {
    match outer_fence_body(input) {
        Some(body) => input[body].to_string(),
        None => input.to_string(),
    }
}

// `key: value` lines, optionally with indented or `- item` continuations.
static RE_FRONT_MATTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^---[ \t]*\n(?:[A-Za-z_][\w-]*[ \t]*:[^\n]*\n(?:[ \t]+[^\n]*\n|-[ \t][^\n]*\n)*)+---[ \t]*(?:\n|$)",
    )
    .unwrap()
});

fn strip_front_matter(input: &str) -> String {
    RE_FRONT_MATTER.replace(input, "").into_owned()
}

// ── Fenced code vs prose ─────────────────────────────────────────────────

enum Segment {
    Prose { text: String, first_line: usize },
    Code(Vec<String>),
}

static RE_FENCE_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^( {0,3})(`{3,}|~{3,})(.*)$").unwrap());

fn fence_open(line: &str) -> Option<String> {
    let caps = RE_FENCE_OPEN.captures(line)?;
    let fence = &caps[2];
    if fence.starts_with('`') && caps[3].contains('`') {
        return None;
    }
    Some(fence.to_string())
}

fn closes_fence(line: &str, fence: &str) -> bool {
    let t = line.trim_end();
    let rest = t.trim_start_matches(' ');
    if t.len() - rest.len() > 3 || rest.len() < fence.len() {
        return false;
    }
    let ch = fence.chars().next().unwrap_or('`');
    rest.chars().all(|c| c == ch)
}

/// Byte ranges of `text` holding code: fenced blocks and inline code spans,
/// in order and non-overlapping. A ```` ```markdown ```` wrapper around the
/// whole text is prose. An unterminated fence runs to the end.
pub(crate) fn code_regions(text: &str) -> Vec<Range<usize>> {
    let body = outer_fence_body(text).unwrap_or(0..text.len());
    let mut regions = Vec::new();
    let mut open: Option<(String, usize)> = None;
    let mut offset = body.start;

    for line in text[body.clone()].split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let content = line.trim_end_matches(['\n', '\r']);

        if let Some((fence, block_start)) = open.take() {
            if closes_fence(content, &fence) {
                regions.push(block_start..offset);
            } else {
                open = Some((fence, block_start));
            }
            continue;
        }
        match fence_open(content) {
            Some(fence) => open = Some((fence, line_start)),
            None => regions.extend(
                code_span_ranges(content).map(|r| line_start + r.start..line_start + r.end),
            ),
        }
    }
    if let Some((_, block_start)) = open {
        regions.push(block_start..body.end);
    }
    regions
}

fn split_fences(text: &str) -> Result<Vec<Segment>, ConvertError> {
    let mut segments = Vec::new();
    let mut prose: Vec<&str> = Vec::new();
    let mut prose_start = 1;
    let mut lines = text.split('\n').enumerate();

    while let Some((i, line)) = lines.next() {
        let Some(fence) = fence_open(line) else {
            if prose.is_empty() {
                prose_start = i + 1;
            }
            prose.push(line);
            continue;
        };
        if !prose.is_empty() {
            segments.push(Segment::Prose {
                text: prose.join("\n"),
                first_line: prose_start,
            });
            prose.clear();
        }

        let mut code = vec![line.trim_end().to_string()];
        let mut closed = false;
        for (_, inner) in lines.by_ref() {
            code.push(inner.trim_end().to_string());
            if closes_fence(inner, &fence) {
                closed = true;
                break;
            }
        }
        if !closed {
            return Err(ConvertError::UnsupportedMarkupConstruct {
                construct: "unterminated code fence".to_string(),
                line: i + 1,
            });
        }
        segments.push(Segment::Code(code));
    }

    if !prose.is_empty() {
        segments.push(Segment::Prose {
            text: prose.join("\n"),
            first_line: prose_start,
        });
    }
    Ok(segments)
}

// ── Block model ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Block {
    Heading { level: usize, text: String },
    Paragraph(Vec<String>),
    List(Vec<ListLine>),
    Table(Table),
    Code(Vec<String>),
    Rule,
}

#[derive(Debug, Clone, PartialEq)]
enum ListLine {
    Item {
        indent: String,
        marker: Marker,
        text: String,
    },
    Continuation(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Marker {
    Bullet,
    Ordered(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Align {
    None,
    Left,
    Right,
    Center,
}

#[derive(Debug, Clone, PartialEq)]
struct Table {
    align: Vec<Align>,
    rows: Vec<Vec<String>>,
}

static RE_ATX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ {0,3}(#{1,6})(?:[ \t]+(.*))?$").unwrap());
// `#Title` with no space, which some backends emit for section headers.
static RE_ATX_TIGHT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ {0,3}(#{1,6})([\p{L}\p{N}].*)$").unwrap());
static RE_SETEXT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ {0,3}(=+|-+)[ \t]*$").unwrap());
static RE_ITEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([ \t]*)([-*+•◦▪●]|\d{1,9}[.)])[ \t]+(\S.*)$").unwrap()
});
static RE_SEPARATOR_CELL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^:?-+:?$").unwrap());
static RE_DELIMITER_CELL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^:?-{3,}:?$").unwrap());

fn parse_heading(line: &str) -> Option<(usize, String)> {
    if let Some(caps) = RE_ATX.captures(line) {
        let text = caps.get(2).map_or("", |m| m.as_str());
        return Some((caps[1].len(), strip_closing_hashes(text)));
    }
    let caps = RE_ATX_TIGHT.captures(line)?;
    Some((caps[1].len(), strip_closing_hashes(&caps[2])))
}

/// `## Title ##` → `Title`; a `#` glued to a word (`C#`) is content.
fn strip_closing_hashes(text: &str) -> String {
    let t = text.trim();
    let without = t.trim_end_matches('#');
    if without.is_empty() {
        return String::new();
    }
    if without.len() < t.len() && without.ends_with([' ', '\t']) {
        return without.trim_end().to_string();
    }
    t.to_string()
}

fn is_thematic_break(line: &str) -> bool {
    let t = line.trim();
    let Some(c) = t.chars().next() else {
        return false;
    };
    if !matches!(c, '-' | '*' | '_') || line.len() - line.trim_start().len() > 3 {
        return false;
    }
    t.chars().filter(|&x| x == c).count() >= 3 && t.chars().all(|x| x == c || x == ' ' || x == '\t')
}

fn parse_item(line: &str) -> Option<ListLine> {
    let caps = RE_ITEM.captures(line)?;
    let raw = &caps[2];
    let marker = match raw.strip_suffix(['.', ')']) {
        Some(digits) if digits.chars().all(|c| c.is_ascii_digit()) => {
            Marker::Ordered(digits.to_string())
        }
        _ => Marker::Bullet,
    };
    Some(ListLine::Item {
        indent: caps[1].to_string(),
        marker,
        text: caps[3].trim_end().to_string(),
    })
}

fn is_list_continuation(line: &str) -> bool {
    (line.starts_with("  ") || line.starts_with('\t')) && !line.trim().is_empty()
}

/// Split a pipe-table row on unescaped `|`, dropping the outer borders.
fn split_cells(line: &str) -> Vec<String> {
    let t = line.trim();
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    let mut ended_on_pipe = false;
    for c in t.chars() {
        ended_on_pipe = false;
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                current.push(c);
                escaped = true;
            }
            '|' => {
                cells.push(std::mem::take(&mut current));
                ended_on_pipe = true;
            }
            _ => current.push(c),
        }
    }
    cells.push(current);
    if t.starts_with('|') {
        cells.remove(0);
    }
    if ended_on_pipe && !cells.is_empty() {
        cells.pop();
    }
    cells.into_iter().map(|c| c.trim().to_string()).collect()
}

fn is_separator_row(cells: &[String]) -> bool {
    !cells.is_empty() && cells.iter().all(|c| RE_SEPARATOR_CELL.is_match(c))
}

fn is_separator_line(line: &str) -> bool {
    line.contains('|') && is_separator_row(&split_cells(line))
}

fn starts_table(line: &str, next: Option<&str>) -> bool {
    let t = line.trim();
    if t.starts_with('|') && t.len() >= 2 {
        return true;
    }
    t.contains('|') && next.is_some_and(is_separator_line)
}

fn parse_align(cell: &str) -> Align {
    match (cell.starts_with(':'), cell.ends_with(':')) {
        (true, true) => Align::Center,
        (true, false) => Align::Left,
        (false, true) => Align::Right,
        (false, false) => Align::None,
    }
}

/// A delimiter row repeated later in the table, e.g. at a page break. Needs
/// at least three dashes per cell and the header delimiter's column count, so
/// `| - | - |` placeholder rows stay data.
fn is_repeated_delimiter(cells: &[String], columns: usize) -> bool {
    cells.len() == columns && cells.iter().all(|c| RE_DELIMITER_CELL.is_match(c))
}

/// The row directly under the first row is the delimiter. Later rows are data
/// unless they repeat the delimiter's shape. Every row is padded to the
/// widest row.
fn build_table(lines: &[String]) -> Option<Table> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut align: Option<Vec<Align>> = None;
    for line in lines {
        let cells = split_cells(line);
        if rows.len() == 1 && align.is_none() && is_separator_row(&cells) {
            align = Some(cells.iter().map(|c| parse_align(c)).collect());
            continue;
        }
        let columns = align
            .as_ref()
            .map(Vec::len)
            .or_else(|| rows.first().map(Vec::len))
            .unwrap_or(cells.len());
        if is_repeated_delimiter(&cells, columns) {
            continue;
        }
        rows.push(cells);
    }
    if rows.is_empty() {
        return None;
    }

    let mut align = align.unwrap_or_default();
    let width = rows
        .iter()
        .map(Vec::len)
        .chain(std::iter::once(align.len()))
        .max()
        .unwrap_or(0)
        .max(1);
    align.resize(width, Align::None);
    for row in &mut rows {
        row.resize(width, String::new());
    }
    Some(Table { align, rows })
}

/// A prose line that would open a fence on re-read is escaped so it stays text.
fn escape_stray_fence(line: &str) -> String {
    match RE_FENCE_OPEN.captures(line) {
        Some(caps) => format!("{}\\{}{}", &caps[1], &caps[2], &caps[3]),
        None => line.to_string(),
    }
}

/// Strip up to three leading spaces; four or more is left alone.
fn paragraph_line(line: &str) -> String {
    let indent = line.len() - line.trim_start_matches(' ').len();
    let line = if indent < 4 { line.trim_start_matches(' ') } else { line };
    line.trim_end().to_string()
}

#[derive(Default)]
struct BlockParser {
    blocks: Vec<Block>,
    paragraph: Vec<String>,
    list: Vec<ListLine>,
    table: Vec<String>,
}

impl BlockParser {
    fn flush(&mut self) {
        if !self.paragraph.is_empty() {
            let lines = std::mem::take(&mut self.paragraph);
            self.blocks.push(Block::Paragraph(lines));
        }
        if !self.list.is_empty() {
            let lines = std::mem::take(&mut self.list);
            self.blocks.push(Block::List(lines));
        }
        if !self.table.is_empty() {
            let lines = std::mem::take(&mut self.table);
            if let Some(table) = build_table(&lines) {
                self.blocks.push(Block::Table(table));
            }
        }
    }

    fn line(&mut self, line: &str, next: Option<&str>) {
        if line.trim().is_empty() {
            self.flush();
            return;
        }

        if !self.table.is_empty() {
            if line.contains('|') {
                self.table.push(line.to_string());
                return;
            }
            self.flush();
        }

        if !self.list.is_empty() {
            if let Some(item) = parse_item(line).filter(|_| !is_thematic_break(line)) {
                self.list.push(item);
                return;
            }
            if is_list_continuation(line) {
                self.list.push(ListLine::Continuation(line.trim_end().to_string()));
                return;
            }
            self.flush();
        }

        if !self.paragraph.is_empty() {
            if let Some(caps) = RE_SETEXT.captures(line) {
                let level = if caps[1].starts_with('=') { 1 } else { 2 };
                let text = self
                    .paragraph
                    .iter()
                    .map(|l| l.trim())
                    .collect::<Vec<_>>()
                    .join(" ");
                self.paragraph.clear();
                self.blocks.push(Block::Heading { level, text });
                return;
            }
        }

        if let Some((level, text)) = parse_heading(line) {
            self.flush();
            self.blocks.push(Block::Heading { level, text });
        } else if is_thematic_break(line) {
            self.flush();
            self.blocks.push(Block::Rule);
        } else if let Some(item) = parse_item(line) {
            self.flush();
            self.list.push(item);
        } else if starts_table(line, next) {
            self.flush();
            self.table.push(line.to_string());
        } else {
            self.paragraph.push(paragraph_line(line));
        }
    }
}

fn parse_blocks(prose: &str) -> Vec<Block> {
    let lines: Vec<String> = prose.split('\n').map(escape_stray_fence).collect();
    let mut parser = BlockParser::default();
    for (i, line) in lines.iter().enumerate() {
        parser.line(line, lines.get(i + 1).map(String::as_str));
    }
    parser.flush();
    parser.blocks
}

// ── Block adjustments ────────────────────────────────────────────────────

/// Drop empty headings and renumber the rest so the first is level 1 and no
/// heading sits more than one level below its predecessor.
fn renumber_headings(blocks: &mut Vec<Block>) {
    blocks.retain(|b| !matches!(b, Block::Heading { text, .. } if text.trim().is_empty()));

    // (level in the source, level assigned)
    let mut stack: Vec<(usize, usize)> = Vec::new();
    for block in blocks.iter_mut() {
        let Block::Heading { level, .. } = block else {
            continue;
        };
        while stack.last().is_some_and(|&(source, _)| source >= *level) {
            stack.pop();
        }
        let assigned = stack.last().map_or(1, |&(_, out)| out + 1).min(6);
        stack.push((*level, assigned));
        *level = assigned;
    }
}

// ── Rendering ────────────────────────────────────────────────────────────

fn render(blocks: &[Block]) -> String {
    let rendered: Vec<String> = blocks
        .iter()
        .map(render_block)
        .filter(|s| !s.trim().is_empty())
        .collect();
    if rendered.is_empty() {
        return "\n".to_string();
    }
    let mut out = rendered.join("\n\n");
    out.push('\n');
    out
}

fn render_block(block: &Block) -> String {
    let lines: Vec<String> = match block {
        Block::Heading { level, text } => vec![format!("{} {}", "#".repeat(*level), text.trim())],
        Block::Paragraph(lines) | Block::Code(lines) => lines.clone(),
        Block::List(items) => items.iter().map(render_list_line).collect(),
        Block::Table(table) => render_table(table),
        Block::Rule => vec!["---".to_string()],
    };
    lines
        .iter()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_list_line(line: &ListLine) -> String {
    match line {
        ListLine::Item {
            indent,
            marker: Marker::Bullet,
            text,
        } => format!("{indent}- {text}"),
        ListLine::Item {
            indent,
            marker: Marker::Ordered(n),
            text,
        } => format!("{indent}{n}. {text}"),
        ListLine::Continuation(line) => line.clone(),
    }
}

fn render_table(table: &Table) -> Vec<String> {
    let row = |cells: &[String]| format!("| {} |", cells.join(" | "));
    let separator: Vec<String> = table
        .align
        .iter()
        .map(|a| match a {
            Align::None => "---",
            Align::Left => ":---",
            Align::Right => "---:",
            Align::Center => ":---:",
        })
        .map(str::to_string)
        .collect();

    let mut lines = Vec::with_capacity(table.rows.len() + 1);
    for (i, cells) in table.rows.iter().enumerate() {
        lines.push(row(cells));
        if i == 0 {
            lines.push(row(&separator));
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(s: &str) -> String {
        normalize(s, &MarkupPolicy::default()).unwrap().markdown
    }

    fn assert_idempotent(s: &str) {
        let once = norm(s);
        assert_eq!(norm(&once), once, "not idempotent for input {s:?}");
    }

    // ── text-level passes ───────────────────────────────────────────────

    #[test]
    fn strips_tagged_outer_fence() {
        assert_eq!(norm("```markdown\n# Title\n\nBody\n```"), "# Title\n\nBody\n");
    }

    #[test]
    fn bare_code_block_is_not_unwrapped() {
        let md = "```\nlet x = 1;\n```";
        assert_eq!(norm(md), "```\nlet x = 1;\n```\n");
    }

    #[test]
    fn crlf_and_trailing_whitespace() {
        assert_eq!(norm("Line one   \r\nLine two\t\r\n"), "Line one\nLine two\n");
    }

    #[test]
    fn invisible_chars_removed() {
        assert_eq!(norm("\u{FEFF}Hello\u{200B}World\u{00AD}"), "HelloWorld\n");
    }

    #[test]
    fn front_matter_removed_but_leading_rule_kept() {
        assert_eq!(norm("---\ntitle: Report\ntags:\n  - a\n---\nBody"), "Body\n");
        assert_eq!(norm("---\n\nIntro\n\n---\n\nBody"), "---\n\nIntro\n\n---\n\nBody\n");
    }

    #[test]
    fn blank_lines_collapse_to_one() {
        assert_eq!(norm("a\n\n\n\n\nb"), "a\n\nb\n");
    }

    #[test]
    fn empty_input_is_single_newline() {
        assert_eq!(norm(""), "\n");
        assert_eq!(norm("  \n\n <!-- only a comment -->\n"), "\n");
    }

    // ── headings ────────────────────────────────────────────────────────

    #[test]
    fn heading_levels_do_not_skip() {
        let md = "### A\n\n##### B\n\n#### C\n\n## D\n\n###### E";
        assert_eq!(norm(md), "# A\n\n## B\n\n## C\n\n# D\n\n## E\n");
    }

    #[test]
    fn setext_and_tight_headings() {
        assert_eq!(norm("Title\n=====\n\nSub\n---"), "# Title\n\n## Sub\n");
        assert_eq!(norm("#Summary\n\ntext"), "# Summary\n\ntext\n");
    }

    #[test]
    fn closing_hashes_and_empty_headings() {
        assert_eq!(norm("## Intro ##\n\n##\n\n### C#"), "# Intro\n\n## C#\n");
    }

    #[test]
    fn heading_gets_blank_line_before() {
        assert_eq!(norm("para\n## Next"), "para\n\n# Next\n");
    }

    // ── lists ───────────────────────────────────────────────────────────

    #[test]
    fn bullet_markers_unified() {
        assert_eq!(norm("* a\n+ b\n• c\n  ◦ d"), "- a\n- b\n- c\n  - d\n");
    }

    #[test]
    fn ordered_paren_becomes_dot() {
        assert_eq!(norm("1) first\n2) second"), "1. first\n2. second\n");
    }

    #[test]
    fn list_continuation_kept() {
        assert_eq!(norm("- item\n  more text\nafter"), "- item\n  more text\n\nafter\n");
    }

    #[test]
    fn thematic_break_is_not_a_list() {
        assert_eq!(norm("a\n\n* * *\n\nb"), "a\n\n---\n\nb\n");
    }

    // ── tables ──────────────────────────────────────────────────────────

    #[test]
    fn missing_separator_inserted() {
        assert_eq!(
            norm("| A | B |\n| 1 | 2 |"),
            "| A | B |\n| --- | --- |\n| 1 | 2 |\n"
        );
    }

    #[test]
    fn mid_table_separators_removed_alignment_kept() {
        let md = "| A | B |\n|:---|---:|\n| 1 | 2 |\n|---|---|\n| 3 | 4 |";
        assert_eq!(
            norm(md),
            "| A | B |\n| :--- | ---: |\n| 1 | 2 |\n| 3 | 4 |\n"
        );
    }

    #[test]
    fn dash_only_data_rows_are_kept() {
        let md = "| Item | Qty |\n|---|---|\n| - | - |\n| a | 2 |";
        let once = norm(md);
        assert_eq!(once, "| Item | Qty |\n| --- | --- |\n| - | - |\n| a | 2 |\n");
        assert_eq!(norm(&once), once);
    }

    #[test]
    fn leading_delimiter_row_is_dropped() {
        assert_eq!(
            norm("|---|---|\n| A | B |\n| 1 | 2 |"),
            "| A | B |\n| --- | --- |\n| 1 | 2 |\n"
        );
    }

    #[test]
    fn ragged_rows_padded() {
        assert_eq!(
            norm("| A |\n|---|\n| 1 | 2 | 3 |"),
            "| A |  |  |\n| --- | --- | --- |\n| 1 | 2 | 3 |\n"
        );
    }

    #[test]
    fn escaped_pipes_stay_in_cell() {
        assert_eq!(norm("| a\\|b | c |\n|---|---|"), "| a\\|b | c |\n| --- | --- |\n");
    }

    #[test]
    fn table_without_outer_pipes() {
        assert_eq!(norm("A | B\n--|--\n1 | 2"), "| A | B |\n| --- | --- |\n| 1 | 2 |\n");
    }

    #[test]
    fn html_table_converted() {
        let md = "Before\n<table><tr><th>K</th><th>V</th></tr><tr><td>x</td><td>1</td></tr></table>\nAfter";
        assert_eq!(
            norm(md),
            "Before\n\n| K | V |\n| --- | --- |\n| x | 1 |\n\nAfter\n"
        );
    }

    // ── code and markup ─────────────────────────────────────────────────

    #[test]
    fn code_fence_content_untouched() {
        let md = "```html\n<div>keep</div>\n<!-- keep -->\n# not a heading\n```";
        assert_eq!(norm(md), format!("{md}\n"));
    }

    #[test]
    fn residual_html_stripped_outside_code() {
        assert_eq!(norm("<p>Hello <b>world</b></p>"), "Hello world\n");
    }

    #[test]
    fn image_links_survive() {
        let md = "Figure:\n\n![Chart](images/image_001.png)";
        assert_eq!(norm(md), "Figure:\n\n![Chart](images/image_001.png)\n");
    }

    #[test]
    fn stray_fence_from_stripped_tags_is_escaped() {
        let once = norm("<span>```</span>");
        assert_eq!(once, "\\```\n");
        assert_eq!(norm(&once), once);
    }

    #[test]
    fn code_regions_cover_fences_and_spans() {
        let text = "a `x` b\r\n```\r\n![i](p.png)\r\n```\r\nc\n~~~\nopen";
        let regions: Vec<&str> = code_regions(text).into_iter().map(|r| &text[r]).collect();
        assert_eq!(regions, vec!["`x`", "```\r\n![i](p.png)\r\n```\r\n", "~~~\nopen"]);
    }

    #[test]
    fn markdown_wrapper_is_not_a_code_region() {
        let text = "```markdown\n# T `c`\n```";
        let regions: Vec<&str> = code_regions(text).into_iter().map(|r| &text[r]).collect();
        assert_eq!(regions, vec!["`c`"]);
    }

    // ── errors ──────────────────────────────────────────────────────────

    #[test]
    fn unterminated_fence_reports_line() {
        let err = normalize("intro\n\n```rust\nfn main() {}", &MarkupPolicy::default()).unwrap_err();
        match err {
            ConvertError::UnsupportedMarkupConstruct { construct, line } => {
                assert!(construct.contains("code fence"));
                assert_eq!(line, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unterminated_comment_reports_document_line() {
        let err = normalize("```\ncode\n```\ntext\n<!-- open", &MarkupPolicy::default()).unwrap_err();
        assert!(matches!(
            err,
            ConvertError::UnsupportedMarkupConstruct { line: 5, .. }
        ));
    }

    #[test]
    fn nested_table_fails() {
        let md = "<table><tr><td><table></table></td></tr></table>";
        assert!(matches!(
            normalize(md, &MarkupPolicy::default()),
            Err(ConvertError::UnsupportedMarkupConstruct { .. })
        ));
    }

    #[test]
    fn comment_inside_code_is_not_an_error() {
        assert!(normalize("```\n<!-- open\n```", &MarkupPolicy::default()).is_ok());
    }

    // ── idempotence ─────────────────────────────────────────────────────

    #[test]
    fn idempotent_on_mixed_documents() {
        let samples = [
            "```markdown\n## Report\n\nText\n```",
            "### Deep\n\nbody\n\n# Top\n\n#### deeper",
            "Title\n---\n\n* a\n* b\n  cont\n\n1) x\n2) y",
            "| A | B |\n| 1 |\n|---|---|\n| 2 | 3 | 4 |",
            "<div><h3>Heading</h3><p>para <i>it</i></p><ul><li>one</li></ul></div>",
            "- \n-\n\n---\n\n___",
            "   indented para\n    four spaces\n\tTabbed",
            "| x |\nnot a row\n\n|",
            "text\n<table><tr><td>a</td></tr></table>\n```\ncode  \n```\n",
        ];
        for s in samples {
            assert_idempotent(s);
        }
    }

    #[test]
    fn output_always_ends_with_single_newline() {
        for s in ["a", "a\n\n\n", "# h\n", "| a |"] {
            let out = norm(s);
            assert!(out.ends_with('\n') && !out.ends_with("\n\n"), "{out:?}");
        }
    }
}
