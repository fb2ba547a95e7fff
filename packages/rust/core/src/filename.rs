//! Page-number inference from file names, page ordering, and sequence checks.
//!
//! Parsing tries a fixed list of strategies, most specific first, and the
//! first match wins. It never fails: a name with no digits at all gets
//! [`UNPARSEABLE_PAGE`] with zero confidence, which sorts it last.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use folio_shared::{FilenameFormat, FolioError, PageFile, Result, SourceFile, UNPARSEABLE_PAGE};

/// Pages per chapter assumed by the `ch2_p5` scheme.
const CHAPTER_SIZE: u32 = 50;

/// Confidence below which a file is counted in the low-confidence rollup.
const LOW_CONFIDENCE: f64 = 0.5;

static NUMERIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.").expect("valid regex"));

static PREFIX_RES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("page_prefix", r"(?i)page[\s_-]*(\d+)"),
        ("short_prefix", r"(?i)^p(?:g)?[\s_-]*(\d+)"),
        ("image_prefix", r"(?i)(?:image|scan|img)[\s_-]*(\d+)"),
        ("book_page", r"(?i)book[\s_-]*p(?:age)?[\s_-]*(\d+)"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("valid regex")))
    .collect()
});

static CHAPTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)ch(?:apter)?[\s_-]*(\d+)[\s_-]*p(?:age)?[\s_-]*(\d+)").expect("valid regex")
});

static TEXT_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-zA-Z]+[\s_-]+(\d+)").expect("valid regex"));

static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));

// ---------------------------------------------------------------------------
// Parse result
// ---------------------------------------------------------------------------

/// Outcome of parsing one file name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedFilename {
    pub page_number: u32,
    pub confidence: f64,
    pub format: FilenameFormat,
    pub metadata: BTreeMap<String, Value>,
}

impl ParsedFilename {
    fn new(page_number: u32, confidence: f64, format: FilenameFormat) -> Self {
        Self {
            page_number,
            confidence,
            format,
            metadata: BTreeMap::new(),
        }
    }

    fn with(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Infers page numbers from file names.
#[derive(Debug, Clone)]
pub struct FilenameParser {
    grouped_re: Regex,
    group_size: u32,
}

impl FilenameParser {
    /// Build a parser for grouped names introduced by `group_prefix`, e.g.
    /// `baron001 3.png` with prefix `baron`.
    pub fn new(group_prefix: &str, group_size: u32) -> Result<Self> {
        if group_size == 0 {
            return Err(FolioError::config("group_size must be at least 1"));
        }
        let pattern = format!(r"(?i)^{}(\d{{3}})(?:\s+(\d+))?", regex::escape(group_prefix));
        let grouped_re = Regex::new(&pattern)
            .map_err(|e| FolioError::config(format!("invalid group prefix: {e}")))?;
        Ok(Self {
            grouped_re,
            group_size,
        })
    }

    pub fn group_size(&self) -> u32 {
        self.group_size
    }

    /// Infer the page number of `filename`.
    pub fn parse(&self, filename: &str) -> ParsedFilename {
        let stem = file_stem(filename);

        self.parse_grouped(stem)
            .or_else(|| parse_numeric(filename))
            .or_else(|| parse_prefixed(stem))
            .or_else(|| parse_chapter_page(stem))
            .or_else(|| parse_text_number(stem))
            .or_else(|| parse_fallback(stem))
            .unwrap_or_else(|| {
                ParsedFilename::new(UNPARSEABLE_PAGE, 0.0, FilenameFormat::Unknown)
                    .with("error", json!("No page number found"))
            })
    }

    /// `page = (group - 1) * group_size + position`, where position is 1
    /// without a suffix and `suffix + 1` with one.
    fn parse_grouped(&self, stem: &str) -> Option<ParsedFilename> {
        let caps = self.grouped_re.captures(stem)?;
        let group_str = caps.get(1)?.as_str();
        let group: u32 = group_str.parse().ok()?;
        let position_str = caps.get(2).map(|m| m.as_str());
        let position = match position_str {
            Some(s) => s.parse::<u32>().ok()?.checked_add(1)?,
            None => 1,
        };
        let page = group
            .saturating_sub(1)
            .checked_mul(self.group_size)?
            .checked_add(position)?;

        Some(
            ParsedFilename::new(page, 1.0, FilenameFormat::Grouped)
                .with("group", json!(group))
                .with("position", json!(position))
                .with("group_str", json!(group_str))
                .with("position_str", json!(position_str)),
        )
    }

    /// Parse every listed file and order them for processing.
    ///
    /// Sorted by page number, then by confidence descending. The sort is
    /// stable, so equal keys keep listing order.
    pub fn sort(&self, files: &[SourceFile]) -> Vec<PageFile> {
        let mut pages: Vec<PageFile> = files
            .iter()
            .map(|file| {
                let parsed = if file.name.is_empty() {
                    ParsedFilename::new(UNPARSEABLE_PAGE, 0.0, FilenameFormat::Unknown)
                        .with("error", json!("No file name"))
                } else {
                    self.parse(&file.name)
                };
                PageFile {
                    file_id: file.id.clone(),
                    file_name: file.name.clone(),
                    page_number: parsed.page_number,
                    confidence: parsed.confidence,
                    format: parsed.format,
                    metadata: parsed.metadata,
                    size_bytes: file.size_bytes,
                }
            })
            .collect();

        pages.sort_by(|a, b| {
            a.page_number
                .cmp(&b.page_number)
                .then(b.confidence.total_cmp(&a.confidence))
        });
        pages
    }
}

/// File name without its final extension. Leading dots do not start an
/// extension (`.png` has no extension).
fn file_stem(filename: &str) -> &str {
    match filename.rfind('.') {
        Some(idx) if filename[..idx].chars().any(|c| c != '.') => &filename[..idx],
        _ => filename,
    }
}

fn parse_numeric(filename: &str) -> Option<ParsedFilename> {
    let caps = NUMERIC_RE.captures(filename)?;
    let page: u32 = caps.get(1)?.as_str().parse().ok()?;
    Some(ParsedFilename::new(page, 0.9, FilenameFormat::Numeric))
}

fn parse_prefixed(stem: &str) -> Option<ParsedFilename> {
    PREFIX_RES.iter().find_map(|(name, re)| {
        let caps = re.captures(stem)?;
        let page: u32 = caps.get(1)?.as_str().parse().ok()?;
        Some(ParsedFilename::new(page, 0.85, FilenameFormat::Prefixed).with("pattern", json!(name)))
    })
}

fn parse_chapter_page(stem: &str) -> Option<ParsedFilename> {
    let caps = CHAPTER_RE.captures(stem)?;
    let chapter: u32 = caps.get(1)?.as_str().parse().ok()?;
    let page_in_chapter: u32 = caps.get(2)?.as_str().parse().ok()?;
    let page = chapter
        .saturating_sub(1)
        .checked_mul(CHAPTER_SIZE)?
        .checked_add(page_in_chapter)?;
    Some(
        ParsedFilename::new(page, 0.7, FilenameFormat::Named)
            .with("chapter", json!(chapter))
            .with("page_in_chapter", json!(page_in_chapter)),
    )
}

fn parse_text_number(stem: &str) -> Option<ParsedFilename> {
    let caps = TEXT_NUMBER_RE.captures(stem)?;
    let page: u32 = caps.get(1)?.as_str().parse().ok()?;
    Some(ParsedFilename::new(page, 0.75, FilenameFormat::Sequential))
}

/// Pick the most plausible digit run: later in the name scores higher, and
/// 3-4 digit runs look more like page numbers than anything else.
fn parse_fallback(stem: &str) -> Option<ParsedFilename> {
    let numbers: Vec<&str> = DIGITS_RE.find_iter(stem).map(|m| m.as_str()).collect();
    if numbers.is_empty() {
        return None;
    }

    let len = stem.len() as f64;
    let mut best: Option<(u32, &str, f64)> = None;
    for num in &numbers {
        let Ok(value) = num.parse::<u32>() else {
            continue;
        };
        let position = stem.rfind(num).unwrap_or(0) as f64 / len;
        let digit_score = if (3..=4).contains(&num.len()) { 1.0 } else { 0.5 };
        let score = position * 0.7 + digit_score * 0.3;
        if best.is_none_or(|(_, _, top)| score > top) {
            best = Some((value, num, score));
        }
    }

    let (page, raw, score) = best?;
    Some(
        ParsedFilename::new(page, score.min(0.5), FilenameFormat::Unknown)
            .with("extraction_method", json!("fallback"))
            .with("raw_number", json!(raw))
            .with("all_numbers", json!(numbers)),
    )
}

// ---------------------------------------------------------------------------
// Sequence validation
// ---------------------------------------------------------------------------

/// Kind of anomaly found in a sorted page list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceIssueKind {
    LargeGap,
    NegativeGap,
    DuplicatePage,
    LowConfidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Info,
    Warning,
    Error,
}

/// One advisory finding from [`validate_sequence`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceIssue {
    pub kind: SequenceIssueKind,
    pub severity: IssueSeverity,
    pub message: String,
    /// Files involved (first five for the low-confidence rollup).
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gap_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<usize>,
}

/// Report gaps, ordering problems, duplicates, and low-confidence parses.
///
/// Purely advisory; the list is checked in the order given.
pub fn validate_sequence(files: &[PageFile], max_gap: u32) -> Vec<SequenceIssue> {
    let mut issues = Vec::new();

    for pair in files.windows(2) {
        let (prev, curr) = (&pair[0], &pair[1]);
        let gap = i64::from(curr.page_number) - i64::from(prev.page_number);
        let names = vec![prev.file_name.clone(), curr.file_name.clone()];

        if gap > i64::from(max_gap) {
            issues.push(SequenceIssue {
                kind: SequenceIssueKind::LargeGap,
                severity: IssueSeverity::Warning,
                message: format!(
                    "Large gap between pages {} and {}",
                    prev.page_number, curr.page_number
                ),
                files: names,
                gap_size: Some(gap),
                total_count: None,
            });
        } else if gap < 0 {
            issues.push(SequenceIssue {
                kind: SequenceIssueKind::NegativeGap,
                severity: IssueSeverity::Error,
                message: format!(
                    "Page numbers out of order: {} followed by {}",
                    prev.page_number, curr.page_number
                ),
                files: names,
                gap_size: Some(gap),
                total_count: None,
            });
        } else if gap == 0 {
            issues.push(SequenceIssue {
                kind: SequenceIssueKind::DuplicatePage,
                severity: IssueSeverity::Warning,
                message: format!("Duplicate page number: {}", curr.page_number),
                files: names,
                gap_size: None,
                total_count: None,
            });
        }
    }

    let low: Vec<&PageFile> = files
        .iter()
        .filter(|f| f.confidence < LOW_CONFIDENCE)
        .collect();
    if !low.is_empty() {
        issues.push(SequenceIssue {
            kind: SequenceIssueKind::LowConfidence,
            severity: IssueSeverity::Info,
            message: format!("{} files with low confidence page extraction", low.len()),
            files: low.iter().take(5).map(|f| f.file_name.clone()).collect(),
            gap_size: None,
            total_count: Some(low.len()),
        });
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> FilenameParser {
        FilenameParser::new("baron", 25).expect("parser")
    }

    fn page(n: u32, name: &str) -> PageFile {
        PageFile {
            file_id: name.into(),
            file_name: name.into(),
            page_number: n,
            confidence: 1.0,
            format: FilenameFormat::Numeric,
            metadata: BTreeMap::new(),
            size_bytes: None,
        }
    }

    #[test]
    fn grouped_numbering() {
        let p = parser();
        assert_eq!(p.parse("baron001.png").page_number, 1);
        assert_eq!(p.parse("baron001 1.png").page_number, 2);
        assert_eq!(p.parse("baron001 24.png").page_number, 25);
        assert_eq!(p.parse("baron002.png").page_number, 26);
        assert_eq!(p.parse("BARON017 8.png").page_number, 409);

        let parsed = p.parse("baron001 1.png");
        assert_eq!(parsed.format, FilenameFormat::Grouped);
        assert_eq!(parsed.confidence, 1.0);
        assert_eq!(parsed.metadata["position"], json!(2));
    }

    #[test]
    fn grouped_prefix_and_size_are_configurable() {
        let p = FilenameParser::new("scheme", 20).expect("parser");
        assert_eq!(p.parse("scheme002.png").page_number, 21);
        assert_eq!(p.parse("scheme002 3.png").page_number, 24);
        assert_ne!(p.parse("baron002.png").format, FilenameFormat::Grouped);
    }

    #[test]
    fn zero_group_size_is_rejected() {
        assert!(FilenameParser::new("baron", 0).is_err());
    }

    #[test]
    fn numeric_and_prefixed() {
        let p = parser();
        let n = p.parse("042.jpg");
        assert_eq!((n.page_number, n.format), (42, FilenameFormat::Numeric));
        assert_eq!(n.confidence, 0.9);

        let pre = p.parse("Page_7.png");
        assert_eq!((pre.page_number, pre.format), (7, FilenameFormat::Prefixed));
        assert_eq!(pre.metadata["pattern"], json!("page_prefix"));

        assert_eq!(p.parse("p12.png").metadata["pattern"], json!("short_prefix"));
        assert_eq!(p.parse("scan-0003.tiff").page_number, 3);
    }

    #[test]
    fn chapter_and_text_number() {
        let p = parser();
        let ch = p.parse("ch2_p5.png");
        assert_eq!((ch.page_number, ch.format), (55, FilenameFormat::Named));

        let text = p.parse("manuscript 14.png");
        assert_eq!((text.page_number, text.format), (14, FilenameFormat::Sequential));
        assert_eq!(text.confidence, 0.75);
    }

    #[test]
    fn fallback_prefers_late_three_digit_runs() {
        // A recognised prefix wins before the digit-run fallback is consulted.
        let parsed = parser().parse("IMG2023x0412.png");
        assert_eq!(parsed.format, FilenameFormat::Prefixed);
        assert_eq!(parsed.page_number, 2023);

        let parsed = parser().parse("x12y345.png");
        assert_eq!(parsed.page_number, 345);
        assert_eq!(parsed.format, FilenameFormat::Unknown);
        assert!(parsed.confidence <= 0.5);
        assert_eq!(parsed.metadata["all_numbers"], json!(["12", "345"]));
    }

    #[test]
    fn never_fails_on_odd_input() {
        let p = parser();
        for name in ["", "cover.png", ".png", "...", "no digits here", "99999999999999999999.png"] {
            let parsed = p.parse(name);
            assert!((0.0..=1.0).contains(&parsed.confidence), "{name}");
        }
        let none = p.parse("cover.png");
        assert_eq!(none.page_number, UNPARSEABLE_PAGE);
        assert_eq!(none.confidence, 0.0);
        assert!(none.metadata.contains_key("error"));
    }

    #[test]
    fn sort_orders_by_page_then_confidence() {
        let files = vec![
            SourceFile::new("c", "baron002.png"),
            SourceFile::new("x", "cover.png"),
            SourceFile::new("a", "baron001.png"),
            SourceFile::new("b", "baron001 1.png"),
            SourceFile::new("d", "2.png"),
        ];
        let sorted = parser().sort(&files);
        let order: Vec<&str> = sorted.iter().map(|p| p.file_id.as_str()).collect();
        // "2.png" and "baron001 1.png" are both page 2; grouped wins on confidence.
        assert_eq!(order, vec!["a", "b", "d", "c", "x"]);
        assert_eq!(sorted[4].page_number, UNPARSEABLE_PAGE);
    }

    #[test]
    fn sort_is_deterministic() {
        let files: Vec<SourceFile> = ["p3.png", "baron001 4.png", "7.png", "scan 2.png"]
            .iter()
            .map(|n| SourceFile::new(*n, *n))
            .collect();
        let p = parser();
        assert_eq!(p.sort(&files), p.sort(&files));
    }

    #[test]
    fn validate_reports_gaps_and_duplicates() {
        let files: Vec<PageFile> = [1, 2, 4, 10, 10]
            .iter()
            .map(|n| page(*n, &format!("{n}.png")))
            .collect();
        let issues = validate_sequence(&files, 5);
        let kinds: Vec<SequenceIssueKind> = issues.iter().map(|i| i.kind).collect();
        assert_eq!(
            kinds,
            vec![SequenceIssueKind::LargeGap, SequenceIssueKind::DuplicatePage]
        );
        assert_eq!(issues[0].gap_size, Some(6));
    }

    #[test]
    fn validate_reports_negative_gap() {
        let files = vec![page(5, "5.png"), page(3, "3.png")];
        let issues = validate_sequence(&files, 5);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, SequenceIssueKind::NegativeGap);
        assert_eq!(issues[0].severity, IssueSeverity::Error);
    }

    #[test]
    fn validate_rolls_up_low_confidence() {
        let mut files: Vec<PageFile> = (1..=7).map(|n| page(n, &format!("f{n}"))).collect();
        for f in &mut files {
            f.confidence = 0.2;
        }
        let issues = validate_sequence(&files, 5);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].total_count, Some(7));
        assert_eq!(issues[0].files.len(), 5);
        assert!(validate_sequence(&[], 5).is_empty());
    }
}
