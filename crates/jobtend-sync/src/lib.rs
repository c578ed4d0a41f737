//! Section synchronization pipeline: markdown table codec, record
//! classification, dedup, staleness archival and conflict-safe write-back.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use chrono::{Datelike, NaiveDate, Utc};
use jobtend_adapters::{adapter_for_source, FetchQuery, SourceAdapter};
use jobtend_core::{
    PassKind, PassReport, PassStatus, RawRecord, Record, RecordError, ReviewPair, RoleCategory,
    SectionKind, WorkMode,
};
use jobtend_storage::{
    DocumentStore, GithubDocumentStore, GithubStoreConfig, HttpClientConfig, HttpFetcher,
    WriteOutcome,
};
use once_cell::sync::Lazy;
use regex::Regex;
use strsim::jaro_winkler;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "jobtend-sync";

/// Months of inactivity after which a posting is archived away.
pub const DEFAULT_STALENESS_MONTHS: i32 = 3;

/// Similarity floor above which two distinct postings are flagged for review.
pub const DEFAULT_REVIEW_THRESHOLD: f64 = 0.93;

/// Row rendered in place of a table when a section holds no records.
pub const EMPTY_SENTINEL: &str = "| No entries found |";

const STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const PERIOD_FORMAT: &str = "%Y-%m";

// ---------------------------------------------------------------------------
// Section codec
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("section table has no header row")]
    MissingHeader,
    #[error("section table has no separator row under the header")]
    MissingSeparator,
    #[error("section table is missing required column '{0}'")]
    MissingColumn(&'static str),
}

/// A section cut out of the document: everything before the heading,
/// the heading plus its table, and everything from the next level-2
/// heading onwards. Reassembling `prefix + body + suffix` yields the
/// original document byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionSplit {
    pub prefix: String,
    pub body: String,
    pub suffix: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionLookup {
    /// The heading does not occur in the document at all.
    Missing,
    Found(SectionSplit),
}

/// Locates `kind`'s section. The body runs from the heading line to the
/// next level-2 heading (exclusive) or the end of the document.
pub fn split_section(document: &str, kind: SectionKind) -> SectionLookup {
    let heading = kind.heading();
    let Some(start) = find_heading_line(document, heading) else {
        return SectionLookup::Missing;
    };
    let after_heading = start + heading.len();
    let body_end = document[after_heading..]
        .find("\n## ")
        .map(|rel| after_heading + rel)
        .unwrap_or(document.len());
    SectionLookup::Found(SectionSplit {
        prefix: document[..start].to_string(),
        body: document[start..body_end].to_string(),
        suffix: document[body_end..].to_string(),
    })
}

/// Exact-line heading match: the heading must start at a line boundary and
/// fill the whole line, so `## 🚀 Internships (old)` is not a hit.
fn find_heading_line(document: &str, heading: &str) -> Option<usize> {
    let bytes = document.as_bytes();
    let mut from = 0;
    while let Some(rel) = document[from..].find(heading) {
        let start = from + rel;
        let end = start + heading.len();
        let at_line_start = start == 0 || bytes[start - 1] == b'\n';
        let at_line_end = end == document.len() || bytes[end] == b'\n' || bytes[end] == b'\r';
        if at_line_start && at_line_end {
            return Some(start);
        }
        from = start + 1;
    }
    None
}

/// Parses the records out of a section body produced by [`split_section`].
///
/// Structural defects (no header, no separator, a required column gone)
/// are errors; a bad row is not. Rows whose cell count disagrees with the
/// header and rows that fail record validation are logged and dropped so
/// one mangled line cannot take the whole section hostage.
pub fn parse_section_records(body: &str, kind: SectionKind) -> Result<Vec<Record>, CodecError> {
    let mut lines = body
        .lines()
        .skip(1) // heading line
        .map(str::trim)
        .filter(|line| !line.is_empty());

    let Some(header_line) = lines.next() else {
        return Err(CodecError::MissingHeader);
    };
    if is_empty_sentinel(header_line) {
        return Ok(Vec::new());
    }
    let Some(headers) = split_row(header_line) else {
        return Err(CodecError::MissingHeader);
    };

    let separator_ok = lines
        .next()
        .and_then(split_row)
        .map(|cells| !cells.is_empty() && cells.iter().all(|cell| is_separator_cell(cell)))
        .unwrap_or(false);
    if !separator_ok {
        return Err(CodecError::MissingSeparator);
    }

    let layout = SectionLayout::from_headers(&headers, kind)?;

    let mut records = Vec::new();
    for line in lines {
        let Some(cells) = split_row(line) else {
            continue;
        };
        if cells.len() != headers.len() {
            warn!(
                section = kind.heading(),
                line, "row cell count disagrees with header; dropping row"
            );
            continue;
        }
        match layout.record_from_cells(&cells) {
            Ok(record) => records.push(record),
            Err(err) => {
                warn!(
                    section = kind.heading(),
                    error = %err,
                    line,
                    "row failed validation; dropping row"
                );
            }
        }
    }
    Ok(records)
}

/// Column positions resolved case-insensitively from a header row, so a
/// hand-reordered table still parses.
struct SectionLayout {
    company: usize,
    role: usize,
    work_mode: usize,
    location: usize,
    link: usize,
    last_updated: usize,
    duration: Option<usize>,
}

impl SectionLayout {
    fn from_headers(headers: &[String], kind: SectionKind) -> Result<Self, CodecError> {
        let find = |name: &'static str| {
            headers
                .iter()
                .position(|header| header.eq_ignore_ascii_case(name))
                .ok_or(CodecError::MissingColumn(name))
        };
        Ok(Self {
            company: find("Company")?,
            role: find("Role")?,
            work_mode: find("Work Mode")?,
            location: find("Location")?,
            link: find("Link to Application")?,
            last_updated: find("Last Updated")?,
            duration: match kind {
                SectionKind::Internships => headers
                    .iter()
                    .position(|header| header.eq_ignore_ascii_case("Duration")),
                SectionKind::Jobs => None,
            },
        })
    }

    fn record_from_cells(&self, cells: &[String]) -> Result<Record, RecordError> {
        let work_mode = WorkMode::from_label(strip_backticks(&cells[self.work_mode]));
        let duration = self
            .duration
            .map(|index| cells[index].clone())
            .filter(|cell| !cell.trim().is_empty());
        Record::new(
            cells[self.company].clone(),
            cells[self.role].clone(),
            work_mode,
            cells[self.location].clone(),
            decode_link_cell(&cells[self.link]),
            cells[self.last_updated].clone(),
            duration,
        )
    }
}

fn split_row(line: &str) -> Option<Vec<String>> {
    let inner = line.trim().strip_prefix('|')?.strip_suffix('|')?;
    Some(inner.split('|').map(|cell| cell.trim().to_string()).collect())
}

fn is_empty_sentinel(line: &str) -> bool {
    split_row(line)
        .is_some_and(|cells| cells.len() == 1 && cells[0].eq_ignore_ascii_case("No entries found"))
}

fn is_separator_cell(cell: &str) -> bool {
    let dashes = cell.trim_start_matches(':').trim_end_matches(':');
    !dashes.is_empty() && dashes.chars().all(|c| c == '-')
}

fn strip_backticks(cell: &str) -> &str {
    cell.trim().trim_matches('`').trim()
}

static APPLY_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[[^\]]*\]\((.+)\)$").expect("static pattern compiles"));

/// Accepts both the rendered `[Apply](url)` form and a bare URL cell.
/// The capture runs to the final closing paren so URLs containing
/// parentheses survive intact.
fn decode_link_cell(cell: &str) -> String {
    let trimmed = cell.trim();
    match APPLY_LINK_RE.captures(trimmed) {
        Some(caps) => caps[1].trim().to_string(),
        None => trimmed.to_string(),
    }
}

/// Renders records as a markdown pipe table in the section's canonical
/// column order. An empty slice renders the empty-section sentinel.
pub fn render_table(records: &[Record], kind: SectionKind) -> String {
    if records.is_empty() {
        return EMPTY_SENTINEL.to_string();
    }
    let columns = kind.columns();
    let mut lines = Vec::with_capacity(records.len() + 2);
    lines.push(format!("| {} |", columns.join(" | ")));
    lines.push(format!(
        "| {} |",
        columns.iter().map(|_| "---").collect::<Vec<_>>().join(" | ")
    ));
    for record in records {
        lines.push(render_row(record, kind));
    }
    lines.join("\n")
}

fn render_row(record: &Record, kind: SectionKind) -> String {
    let mut cells = vec![
        sanitize_cell(&record.company),
        sanitize_cell(&record.role),
        format!("`{}`", record.work_mode.label()),
        sanitize_cell(&record.location),
        format!("[Apply]({})", encode_link_cell(&record.apply_link)),
        sanitize_cell(&record.last_updated),
    ];
    if kind == SectionKind::Internships {
        cells.push(sanitize_cell(record.duration.as_deref().unwrap_or("Ongoing")));
    }
    format!("| {} |", cells.join(" | "))
}

/// A literal `|` inside a cell would add a phantom column on re-parse,
/// and a newline would split the row. Collapses any interior whitespace
/// run to a single space.
fn sanitize_cell(value: &str) -> String {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.replace('|', "/")
}

/// The URL parser strips tabs and newlines during validation, so dropping
/// them here keeps the rendered link equal to the address that was checked.
fn encode_link_cell(link: &str) -> String {
    link.replace('|', "%7C")
        .replace('\n', "")
        .replace('\r', "")
        .replace('\t', "")
}

fn rebuild_document(split: &SectionSplit, kind: SectionKind, table: &str) -> String {
    format!("{}{}\n\n{}\n{}", split.prefix, kind.heading(), table, split.suffix)
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

static REMOTE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bremote\b").expect("static pattern compiles"));
static ONSITE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bon[- ]?site\b|\bin[- ]?office\b").expect("static pattern compiles"));
static HYBRID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bhybrid\b").expect("static pattern compiles"));

/// Scans free text for a work-mode hint. Remote wins over on-site wins
/// over hybrid when a posting mentions several.
pub fn classify_work_mode(text: &str, default: WorkMode) -> WorkMode {
    let lowered = text.to_lowercase();
    if REMOTE_RE.is_match(&lowered) {
        WorkMode::Remote
    } else if ONSITE_RE.is_match(&lowered) {
        WorkMode::OnSite
    } else if HYBRID_RE.is_match(&lowered) {
        WorkMode::Hybrid
    } else {
        default
    }
}

const INTERNSHIP_MARKERS: &[&str] = &["intern", "internship", "trainee"];

/// Substring match on the role title. Deliberately greedy: titles like
/// "International Sales" land in the internships section rather than a
/// real internship being missed.
pub fn is_internship(title: &str) -> bool {
    let lowered = title.to_lowercase();
    INTERNSHIP_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Buckets a role title for per-pass reporting. First matching bucket
/// wins, so the order below is load-bearing: full-stack before frontend,
/// mobile before frontend ("react native"), javascript before java.
pub fn classify_role_category(title: &str) -> RoleCategory {
    let lowered = title.to_lowercase();
    let matches = |needles: &[&str]| needles.iter().any(|needle| lowered.contains(needle));
    if matches(&["full stack", "full-stack", "fullstack"]) {
        RoleCategory::FullStack
    } else if matches(&["mobile", "android", "ios", "flutter", "react native"]) {
        RoleCategory::Mobile
    } else if matches(&[
        "frontend",
        "front end",
        "front-end",
        "javascript",
        "typescript",
        "react",
        "angular",
        "vue",
    ]) {
        RoleCategory::Frontend
    } else if matches(&[
        "data scientist",
        "data engineer",
        "data analyst",
        "machine learning",
        "database",
        "analytics",
    ]) {
        RoleCategory::Data
    } else if matches(&["security", "cybersecurity", "penetration"]) {
        RoleCategory::Security
    } else if matches(&["devops", "site reliability", "sre", "cloud", "infrastructure", "platform engineer"]) {
        RoleCategory::DevOps
    } else if matches(&["qa", "quality assurance", "test"]) {
        RoleCategory::Qa
    } else if matches(&[
        "backend", "back end", "back-end", "python", "java", "golang", "node", "php", "ruby",
    ]) {
        RoleCategory::Backend
    } else {
        RoleCategory::Other
    }
}

/// Internship duration is not scraped, only inferred from the title.
pub fn derive_duration(title: &str, year: i32) -> String {
    let lowered = title.to_lowercase();
    if lowered.contains("summer") || lowered.contains("season") {
        format!("Summer {year}")
    } else {
        "Ongoing".to_string()
    }
}

// ---------------------------------------------------------------------------
// Dedup
// ---------------------------------------------------------------------------

/// Drops records sharing an identity key with an earlier one, keeping
/// arrival order. First seen wins.
pub fn dedupe(records: Vec<Record>) -> Vec<Record> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(records.len());
    for record in records {
        if seen.insert(record.identity_key()) {
            unique.push(record);
        }
    }
    unique
}

fn normalize_key_fragment(value: &str) -> String {
    let lowered = value.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Flags pairs of distinct postings that look like the same opportunity
/// under slightly different titles. Advisory only: nothing is removed,
/// the pairs ride along in the pass report for a human to look at.
pub fn near_duplicates(records: &[Record], threshold: f64) -> Vec<ReviewPair> {
    let mut pairs = Vec::new();
    for (index, a) in records.iter().enumerate() {
        for b in &records[index + 1..] {
            if a.identity_key() == b.identity_key() {
                continue;
            }
            let role_similarity =
                jaro_winkler(&normalize_key_fragment(&a.role), &normalize_key_fragment(&b.role));
            let company_similarity = jaro_winkler(
                &normalize_key_fragment(&a.company),
                &normalize_key_fragment(&b.company),
            );
            let confidence = role_similarity * 0.7 + company_similarity * 0.3;
            if confidence >= threshold {
                pairs.push(ReviewPair {
                    key_a: a.identity_key(),
                    key_b: b.identity_key(),
                    confidence,
                });
            }
        }
    }
    pairs
}

// ---------------------------------------------------------------------------
// Staleness
// ---------------------------------------------------------------------------

const STALE_SENTINELS: &[&str] = &["unknown", "n/a", ""];

const CALENDAR_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y", "%B %d, %Y", "%d %B %Y"];

static YEAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(19|20)\d{2}\b").expect("static pattern compiles"));
static MONTH_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*").expect("static pattern compiles")
});
static MONTH_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,2})\b").expect("static pattern compiles"));

/// Extracts (year, month) from a period token, trying strict `YYYY-MM`
/// first, then full calendar dates, then a fuzzy scan for a year plus a
/// month name or number. A token with no recognizable year AND month is
/// unparseable.
pub fn parse_period(token: &str) -> Option<(i32, u32)> {
    let trimmed = token.trim();
    if trimmed.len() <= 7 {
        if let Ok(date) = NaiveDate::parse_from_str(&format!("{trimmed}-01"), "%Y-%m-%d") {
            return Some((date.year(), date.month()));
        }
    }
    for format in CALENDAR_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some((date.year(), date.month()));
        }
    }
    fuzzy_year_month(trimmed)
}

fn fuzzy_year_month(token: &str) -> Option<(i32, u32)> {
    let lowered = token.to_lowercase();
    let year: i32 = YEAR_RE.find(&lowered)?.as_str().parse().ok()?;
    if let Some(caps) = MONTH_NAME_RE.captures(&lowered) {
        let month = match &caps[1] {
            "jan" => 1,
            "feb" => 2,
            "mar" => 3,
            "apr" => 4,
            "may" => 5,
            "jun" => 6,
            "jul" => 7,
            "aug" => 8,
            "sep" => 9,
            "oct" => 10,
            "nov" => 11,
            "dec" => 12,
            _ => return None,
        };
        return Some((year, month));
    }
    for candidate in MONTH_NUMBER_RE.find_iter(&lowered) {
        if let Ok(month) = candidate.as_str().parse::<u32>() {
            if (1..=12).contains(&month) {
                return Some((year, month));
            }
        }
    }
    None
}

/// Whether a `Last Updated` token is old enough to archive.
///
/// Sentinels ("unknown", "n/a", empty) are stale outright. A token no
/// parser understands keeps its row: deleting data over a date we cannot
/// read is worse than carrying it another pass.
pub fn is_stale(token: &str, today: NaiveDate, threshold_months: i32) -> bool {
    let trimmed = token.trim();
    if STALE_SENTINELS.contains(&trimmed.to_lowercase().as_str()) {
        return true;
    }
    match parse_period(trimmed) {
        Some((year, month)) => {
            let elapsed = (today.year() - year) * 12 + (today.month() as i32 - month as i32);
            elapsed >= threshold_months
        }
        None => {
            warn!(token = trimmed, "unparseable period token; keeping the row");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata stamps
// ---------------------------------------------------------------------------

/// Rewrites the first `Last Updated:` line, or inserts one under the H1.
pub fn stamp_last_updated(document: &str, stamp: &str) -> String {
    stamp_metadata_line(document, "Last Updated:", stamp, None)
}

/// Rewrites the first `Last Archived:` line, or inserts one right below
/// `Last Updated:` so the two stamps stay together.
pub fn stamp_last_archived(document: &str, stamp: &str) -> String {
    stamp_metadata_line(document, "Last Archived:", stamp, Some("Last Updated:"))
}

fn stamp_metadata_line(document: &str, label: &str, stamp: &str, anchor: Option<&str>) -> String {
    let stamped = format!("{label} {stamp}");
    let mut lines: Vec<String> = document.lines().map(str::to_string).collect();

    if let Some(position) = lines.iter().position(|line| line.trim_start().starts_with(label)) {
        lines[position] = stamped;
    } else if let Some(position) = anchor
        .and_then(|anchor| lines.iter().position(|line| line.trim_start().starts_with(anchor)))
    {
        lines.insert(position + 1, stamped);
    } else if let Some(position) = lines.iter().position(|line| line.starts_with("# ")) {
        lines.insert(position + 1, String::new());
        lines.insert(position + 2, stamped);
    } else {
        lines.insert(0, stamped);
    }

    let mut result = lines.join("\n");
    if document.ends_with('\n') {
        result.push('\n');
    }
    result
}

// ---------------------------------------------------------------------------
// Pass computations (pure; the synchronizer wraps them in store I/O)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ArchiveComputation {
    pub content: String,
    pub jobs_removed: usize,
    pub internships_removed: usize,
    pub changed: bool,
}

/// Filters stale records out of both sections and re-renders them
/// canonically. A missing or malformed section is left untouched; the
/// archive pass never invents structure. `Last Archived` is stamped only
/// when the document actually changed.
pub fn compute_archive(
    document: &str,
    today: NaiveDate,
    threshold_months: i32,
    stamp: &str,
) -> ArchiveComputation {
    let mut content = document.to_string();
    let mut jobs_removed = 0;
    let mut internships_removed = 0;

    for kind in [SectionKind::Jobs, SectionKind::Internships] {
        let split = match split_section(&content, kind) {
            SectionLookup::Found(split) => split,
            SectionLookup::Missing => {
                warn!(section = kind.heading(), "section heading not found; skipping it");
                continue;
            }
        };
        let records = match parse_section_records(&split.body, kind) {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    section = kind.heading(),
                    error = %err,
                    "malformed section table; leaving it untouched"
                );
                continue;
            }
        };
        let kept: Vec<Record> = records
            .iter()
            .filter(|record| !is_stale(&record.last_updated, today, threshold_months))
            .cloned()
            .collect();
        let removed = records.len() - kept.len();
        match kind {
            SectionKind::Jobs => jobs_removed += removed,
            SectionKind::Internships => internships_removed += removed,
        }
        content = rebuild_document(&split, kind, &render_table(&kept, kind));
    }

    let changed = content != document;
    if changed {
        content = stamp_last_archived(&content, stamp);
    }
    ArchiveComputation {
        content,
        jobs_removed,
        internships_removed,
        changed,
    }
}

#[derive(Debug, Clone)]
pub struct UpdateComputation {
    pub content: String,
    pub jobs_added: usize,
    pub internships_added: usize,
    pub changed: bool,
    pub review_pairs: Vec<ReviewPair>,
}

/// Merges classified records into their sections append-only: existing
/// rows keep their position and their cell values, incoming records with
/// an unseen identity key are appended in arrival order. A malformed
/// section table is rebuilt from the incoming records alone; a missing
/// heading is skipped. `Last Updated` is stamped only on change.
pub fn compute_update(
    document: &str,
    jobs: &[Record],
    internships: &[Record],
    review_threshold: f64,
    stamp: &str,
) -> UpdateComputation {
    let mut content = document.to_string();
    let mut jobs_added = 0;
    let mut internships_added = 0;
    let mut review_pairs = Vec::new();

    for (kind, incoming) in [
        (SectionKind::Jobs, jobs),
        (SectionKind::Internships, internships),
    ] {
        let split = match split_section(&content, kind) {
            SectionLookup::Found(split) => split,
            SectionLookup::Missing => {
                warn!(section = kind.heading(), "section heading not found; skipping it");
                continue;
            }
        };
        let existing = match parse_section_records(&split.body, kind) {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    section = kind.heading(),
                    error = %err,
                    "malformed section table; rebuilding it from the incoming records"
                );
                Vec::new()
            }
        };

        let mut seen: HashSet<String> = existing.iter().map(Record::identity_key).collect();
        let mut merged = existing;
        let mut added = 0;
        for record in incoming {
            if seen.insert(record.identity_key()) {
                merged.push(record.clone());
                added += 1;
            }
        }
        match kind {
            SectionKind::Jobs => jobs_added = added,
            SectionKind::Internships => internships_added = added,
        }
        review_pairs.extend(near_duplicates(&merged, review_threshold));
        content = rebuild_document(&split, kind, &render_table(&merged, kind));
    }

    let changed = content != document;
    if changed {
        content = stamp_last_updated(&content, stamp);
    }
    UpdateComputation {
        content,
        jobs_added,
        internships_added,
        changed,
        review_pairs,
    }
}

/// Raw adapter output turned into validated, deduplicated records split
/// by section, plus the per-source and per-category tallies for the report.
#[derive(Debug, Default)]
pub struct ClassifiedBatch {
    pub jobs: Vec<Record>,
    pub internships: Vec<Record>,
    pub source_counts: BTreeMap<String, usize>,
    pub category_counts: BTreeMap<String, usize>,
}

impl ClassifiedBatch {
    pub fn total(&self) -> usize {
        self.jobs.len() + self.internships.len()
    }
}

pub fn classify_batch(
    batches: &[(String, Vec<RawRecord>)],
    period: &str,
    year: i32,
) -> ClassifiedBatch {
    let mut out = ClassifiedBatch::default();
    for (source_id, raw_records) in batches {
        for raw in raw_records {
            let hint = format!("{} {}", raw.raw_text, raw.location);
            let work_mode = classify_work_mode(&hint, WorkMode::Unknown);
            let internship = is_internship(&raw.role);
            let duration = internship.then(|| derive_duration(&raw.role, year));
            let record = match Record::new(
                raw.company.clone(),
                raw.role.clone(),
                work_mode,
                raw.location.clone(),
                raw.link.clone(),
                period,
                duration,
            ) {
                Ok(record) => record,
                Err(err) => {
                    warn!(source = source_id.as_str(), error = %err, "dropping invalid record");
                    continue;
                }
            };
            *out.source_counts.entry(source_id.clone()).or_default() += 1;
            let category = classify_role_category(&record.role);
            *out.category_counts.entry(category.label().to_string()).or_default() += 1;
            if internship {
                out.internships.push(record);
            } else {
                out.jobs.push(record);
            }
        }
    }
    out.jobs = dedupe(std::mem::take(&mut out.jobs));
    out.internships = dedupe(std::mem::take(&mut out.internships));
    out
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub repo: String,
    pub document_path: String,
    pub github_token: String,
    pub staleness_threshold_months: i32,
    pub review_threshold: f64,
    pub write_attempts: usize,
    pub scheduler_enabled: bool,
    pub update_cron: String,
    pub archive_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub keywords: Vec<String>,
    pub locations: Vec<String>,
    pub recency_window_days: u32,
    pub sources: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            repo: "jobtend/board".to_string(),
            document_path: "README.md".to_string(),
            github_token: String::new(),
            staleness_threshold_months: DEFAULT_STALENESS_MONTHS,
            review_threshold: DEFAULT_REVIEW_THRESHOLD,
            write_attempts: 3,
            scheduler_enabled: false,
            update_cron: "0 0 6 * * *".to_string(),
            archive_cron: "0 30 5 * * *".to_string(),
            user_agent: format!("jobtend/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 20,
            keywords: default_keywords(),
            locations: default_locations(),
            recency_window_days: 7,
            sources: vec!["linkedin".to_string(), "indeed".to_string()],
        }
    }
}

impl SyncConfig {
    /// Reads `JOBTEND_*` overrides (and `GITHUB_TOKEN`) from the
    /// environment, falling back to defaults field by field.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            repo: env_string("JOBTEND_REPO", &defaults.repo),
            document_path: env_string("JOBTEND_DOCUMENT_PATH", &defaults.document_path),
            github_token: std::env::var("GITHUB_TOKEN").unwrap_or_default(),
            staleness_threshold_months: env_parse(
                "JOBTEND_STALENESS_MONTHS",
                defaults.staleness_threshold_months,
            ),
            review_threshold: env_parse("JOBTEND_REVIEW_THRESHOLD", defaults.review_threshold),
            write_attempts: env_parse("JOBTEND_WRITE_ATTEMPTS", defaults.write_attempts),
            scheduler_enabled: env_parse("JOBTEND_SCHEDULER_ENABLED", defaults.scheduler_enabled),
            update_cron: env_string("JOBTEND_UPDATE_CRON", &defaults.update_cron),
            archive_cron: env_string("JOBTEND_ARCHIVE_CRON", &defaults.archive_cron),
            user_agent: env_string("JOBTEND_USER_AGENT", &defaults.user_agent),
            http_timeout_secs: env_parse("JOBTEND_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            keywords: env_list("JOBTEND_KEYWORDS").unwrap_or(defaults.keywords),
            locations: env_list("JOBTEND_LOCATIONS").unwrap_or(defaults.locations),
            recency_window_days: env_parse("JOBTEND_RECENCY_DAYS", defaults.recency_window_days),
            sources: env_list("JOBTEND_SOURCES").unwrap_or(defaults.sources),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

pub fn default_keywords() -> Vec<String> {
    [
        "software engineer",
        "backend developer",
        "frontend developer",
        "full stack developer",
        "python developer",
        "data scientist",
        "machine learning engineer",
        "devops engineer",
        "mobile app developer",
        "cloud engineer",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

pub fn default_locations() -> Vec<String> {
    [
        "Warsaw, Poland",
        "Berlin, Germany",
        "Amsterdam, Netherlands",
        "London, United Kingdom",
        "Dublin, Ireland",
        "Stockholm, Sweden",
        "Lisbon, Portugal",
        "Madrid, Spain",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

/// Runs archive and update passes against a [`DocumentStore`] with
/// optimistic-concurrency write-back: read a versioned snapshot, compute
/// the new document, write conditionally, and on a version conflict
/// re-read and recompute rather than clobbering someone else's edit.
pub struct SectionSynchronizer<S> {
    store: S,
    config: SyncConfig,
}

impl<S: DocumentStore> SectionSynchronizer<S> {
    pub fn new(store: S, config: SyncConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Archive pass: never panics out, never returns Err; failures become
    /// an `Error` report so a scheduler tick can log and move on.
    pub async fn archive_pass(&self) -> PassReport {
        match self.try_archive().await {
            Ok(report) => report,
            Err(err) => {
                error!(error = %err, "archive pass failed");
                PassReport::error(PassKind::Archive, format!("{err:#}"))
            }
        }
    }

    pub async fn update_pass(&self, batches: &[(String, Vec<RawRecord>)]) -> PassReport {
        match self.try_update(batches).await {
            Ok(report) => report,
            Err(err) => {
                error!(error = %err, "update pass failed");
                PassReport::error(PassKind::Update, format!("{err:#}"))
            }
        }
    }

    async fn try_archive(&self) -> Result<PassReport> {
        let now = Utc::now();
        let today = now.date_naive();
        let stamp = now.format(STAMP_FORMAT).to_string();
        let message = format!("Archive outdated job listings - {stamp}");

        let mut snapshot = self.store.read().await.context("reading document")?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let computation = compute_archive(
                &snapshot.content,
                today,
                self.config.staleness_threshold_months,
                &stamp,
            );
            let mut report = PassReport::new(PassKind::Archive, PassStatus::Success);
            report.counts_mut(SectionKind::Jobs).removed = computation.jobs_removed;
            report.counts_mut(SectionKind::Internships).removed = computation.internships_removed;

            if !computation.changed {
                info!("archive pass found nothing to remove; skipping write");
                return Ok(report);
            }
            match self
                .store
                .write(&computation.content, &snapshot.version, &message)
                .await
                .context("writing archived document")?
            {
                WriteOutcome::Committed(_) => {
                    info!(
                        jobs_removed = computation.jobs_removed,
                        internships_removed = computation.internships_removed,
                        "archive pass committed"
                    );
                    return Ok(report);
                }
                WriteOutcome::Conflict => {
                    if attempt >= self.config.write_attempts {
                        bail!("document version conflicted {attempt} times; giving up");
                    }
                    warn!(attempt, "document changed underneath us; re-reading and retrying");
                    snapshot = self
                        .store
                        .read()
                        .await
                        .context("re-reading document after conflict")?;
                }
            }
        }
    }

    async fn try_update(&self, batches: &[(String, Vec<RawRecord>)]) -> Result<PassReport> {
        if batches.iter().all(|(_, records)| records.is_empty()) {
            info!("no records fetched; leaving the document untouched");
            return Ok(PassReport::skipped(PassKind::Update, "no records fetched"));
        }

        let now = Utc::now();
        let period = now.format(PERIOD_FORMAT).to_string();
        let stamp = now.format(STAMP_FORMAT).to_string();
        let message = format!("Update job listings - {stamp}");

        let classified = classify_batch(batches, &period, now.year());
        if classified.total() == 0 {
            info!("every fetched record failed validation; leaving the document untouched");
            return Ok(PassReport::skipped(
                PassKind::Update,
                "no valid records after classification",
            ));
        }

        let mut snapshot = self.store.read().await.context("reading document")?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let computation = compute_update(
                &snapshot.content,
                &classified.jobs,
                &classified.internships,
                self.config.review_threshold,
                &stamp,
            );
            let mut report = PassReport::new(PassKind::Update, PassStatus::Success);
            report.counts_mut(SectionKind::Jobs).added = computation.jobs_added;
            report.counts_mut(SectionKind::Internships).added = computation.internships_added;
            report.source_counts = classified.source_counts.clone();
            report.category_counts = classified.category_counts.clone();
            report.review_pairs = computation.review_pairs.clone();

            if !computation.changed {
                info!("document already carries every fetched record; skipping write");
                return Ok(report);
            }
            match self
                .store
                .write(&computation.content, &snapshot.version, &message)
                .await
                .context("writing updated document")?
            {
                WriteOutcome::Committed(_) => {
                    info!(
                        jobs_added = computation.jobs_added,
                        internships_added = computation.internships_added,
                        review_pairs = computation.review_pairs.len(),
                        "update pass committed"
                    );
                    return Ok(report);
                }
                WriteOutcome::Conflict => {
                    if attempt >= self.config.write_attempts {
                        bail!("document version conflicted {attempt} times; giving up");
                    }
                    warn!(attempt, "document changed underneath us; re-reading and retrying");
                    snapshot = self
                        .store
                        .read()
                        .await
                        .context("re-reading document after conflict")?;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Source fan-out and wiring
// ---------------------------------------------------------------------------

/// Fetches every adapter concurrently. One source failing (or panicking)
/// costs only that source's batch; the rest still land. Batches come back
/// sorted by source id so append order is deterministic.
pub async fn fetch_all_sources(
    http: Arc<HttpFetcher>,
    adapters: Vec<Box<dyn SourceAdapter>>,
    query: &FetchQuery,
) -> Vec<(String, Vec<RawRecord>)> {
    let mut join_set = JoinSet::new();
    for adapter in adapters {
        let http = Arc::clone(&http);
        let query = query.clone();
        join_set.spawn(async move {
            let source_id = adapter.source_id();
            let result = adapter.fetch(http.as_ref(), &query).await;
            (source_id, result)
        });
    }

    let mut batches = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((source_id, Ok(records))) => {
                info!(source = source_id, count = records.len(), "source fetch finished");
                batches.push((source_id.to_string(), records));
            }
            Ok((source_id, Err(err))) => {
                warn!(source = source_id, error = %err, "source fetch failed; continuing without it");
            }
            Err(err) => {
                warn!(error = %err, "source task aborted; continuing without it");
            }
        }
    }
    batches.sort_by(|a, b| a.0.cmp(&b.0));
    batches
}

pub fn resolve_adapters(sources: &[String]) -> Vec<Box<dyn SourceAdapter>> {
    let mut adapters = Vec::new();
    for source in sources {
        match adapter_for_source(source) {
            Some(adapter) => adapters.push(adapter),
            None => warn!(source = source.as_str(), "unknown source id; skipping"),
        }
    }
    adapters
}

/// Full update cycle: resolve adapters from config, fan out the fetch,
/// then run the update pass over whatever came back.
pub async fn run_update_from_sources<S: DocumentStore>(
    synchronizer: &SectionSynchronizer<S>,
    http: Arc<HttpFetcher>,
) -> PassReport {
    let config = synchronizer.config();
    let query = FetchQuery::new(
        config.keywords.clone(),
        config.locations.clone(),
        config.recency_window_days,
    );
    let adapters = resolve_adapters(&config.sources);
    if adapters.is_empty() {
        warn!("no usable source adapters configured");
        return PassReport::skipped(PassKind::Update, "no usable source adapters configured");
    }
    let batches = fetch_all_sources(http, adapters, &query).await;
    synchronizer.update_pass(&batches).await
}

pub fn github_synchronizer(config: SyncConfig) -> Result<SectionSynchronizer<GithubDocumentStore>> {
    ensure!(
        !config.github_token.trim().is_empty(),
        "GITHUB_TOKEN is required for the github document store"
    );
    let mut store_config = GithubStoreConfig::new(
        config.repo.clone(),
        config.document_path.clone(),
        config.github_token.clone(),
    );
    store_config.timeout = Duration::from_secs(config.http_timeout_secs);
    store_config.user_agent = config.user_agent.clone();
    let store = GithubDocumentStore::new(store_config).context("building github document store")?;
    Ok(SectionSynchronizer::new(store, config))
}

pub fn shared_fetcher(config: &SyncConfig) -> Result<Arc<HttpFetcher>> {
    let http_config = HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..HttpClientConfig::default()
    };
    Ok(Arc::new(HttpFetcher::new(http_config)?))
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub fn log_report(report: &PassReport) {
    match report.status {
        PassStatus::Success => info!(
            pass = ?report.pass,
            jobs_added = report.jobs.added,
            jobs_removed = report.jobs.removed,
            internships_added = report.internships.added,
            internships_removed = report.internships.removed,
            review_pairs = report.review_pairs.len(),
            "pass finished"
        ),
        PassStatus::Skipped => info!(
            pass = ?report.pass,
            reason = report.message.as_deref().unwrap_or(""),
            "pass skipped"
        ),
        PassStatus::Error => error!(
            pass = ?report.pass,
            reason = report.message.as_deref().unwrap_or(""),
            "pass failed"
        ),
    }
}

/// Cron-driven passes: update and archive each on their own schedule.
pub async fn build_scheduler(
    synchronizer: Arc<SectionSynchronizer<GithubDocumentStore>>,
    http: Arc<HttpFetcher>,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;
    let update_cron = synchronizer.config().update_cron.clone();
    let archive_cron = synchronizer.config().archive_cron.clone();

    let update_synchronizer = Arc::clone(&synchronizer);
    let update_job = Job::new_async(update_cron.as_str(), move |_id, _scheduler| {
        let synchronizer = Arc::clone(&update_synchronizer);
        let http = Arc::clone(&http);
        Box::pin(async move {
            let report = run_update_from_sources(synchronizer.as_ref(), http).await;
            log_report(&report);
        })
    })
    .context("building update job")?;
    scheduler.add(update_job).await?;

    let archive_synchronizer = Arc::clone(&synchronizer);
    let archive_job = Job::new_async(archive_cron.as_str(), move |_id, _scheduler| {
        let synchronizer = Arc::clone(&archive_synchronizer);
        Box::pin(async move {
            let report = synchronizer.archive_pass().await;
            log_report(&report);
        })
    })
    .context("building archive job")?;
    scheduler.add(archive_job).await?;

    Ok(scheduler)
}

pub async fn maybe_build_scheduler(
    synchronizer: Arc<SectionSynchronizer<GithubDocumentStore>>,
    http: Arc<HttpFetcher>,
) -> Result<Option<JobScheduler>> {
    if !synchronizer.config().scheduler_enabled {
        info!("scheduler disabled; passes run on demand only");
        return Ok(None);
    }
    build_scheduler(synchronizer, http).await.map(Some)
}
