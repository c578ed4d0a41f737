//! Core domain model and pass-report types for jobtend.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "jobtend-core";

/// How a posting expects people to work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkMode {
    Remote,
    OnSite,
    Hybrid,
    Unknown,
}

impl WorkMode {
    /// Human label as it appears inside the document's table cells.
    pub fn label(self) -> &'static str {
        match self {
            WorkMode::Remote => "Remote",
            WorkMode::OnSite => "On-site",
            WorkMode::Hybrid => "Hybrid",
            WorkMode::Unknown => "Unknown",
        }
    }

    /// Tolerant inverse of [`label`](Self::label); any unrecognized cell
    /// value maps to `Unknown` rather than failing the row.
    pub fn from_label(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "remote" => WorkMode::Remote,
            "on-site" | "onsite" | "on site" | "in-office" | "in office" => WorkMode::OnSite,
            "hybrid" => WorkMode::Hybrid,
            _ => WorkMode::Unknown,
        }
    }
}

impl fmt::Display for WorkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Coarse role bucket derived from the posting title, reported per pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoleCategory {
    Frontend,
    Backend,
    FullStack,
    Mobile,
    Data,
    DevOps,
    Qa,
    Security,
    Other,
}

impl RoleCategory {
    pub fn label(self) -> &'static str {
        match self {
            RoleCategory::Frontend => "frontend",
            RoleCategory::Backend => "backend",
            RoleCategory::FullStack => "full-stack",
            RoleCategory::Mobile => "mobile",
            RoleCategory::Data => "data",
            RoleCategory::DevOps => "devops",
            RoleCategory::Qa => "qa",
            RoleCategory::Security => "security",
            RoleCategory::Other => "other",
        }
    }
}

/// The two synchronized sections of the board document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectionKind {
    Jobs,
    Internships,
}

impl SectionKind {
    /// Exact level-2 heading line that opens the section in the document.
    pub fn heading(self) -> &'static str {
        match self {
            SectionKind::Jobs => "## 💼 Full-Time Jobs",
            SectionKind::Internships => "## 🚀 Internships",
        }
    }

    /// Canonical column order for rendering this section's table.
    pub fn columns(self) -> &'static [&'static str] {
        const JOBS: &[&str] = &[
            "Company",
            "Role",
            "Work Mode",
            "Location",
            "Link to Application",
            "Last Updated",
        ];
        const INTERNSHIPS: &[&str] = &[
            "Company",
            "Role",
            "Work Mode",
            "Location",
            "Link to Application",
            "Last Updated",
            "Duration",
        ];
        match self {
            SectionKind::Jobs => JOBS,
            SectionKind::Internships => INTERNSHIPS,
        }
    }
}

/// Raw handoff contract from a source adapter into the sync pipeline.
///
/// `raw_text` is whatever free text the source exposed next to the posting
/// (card metadata, snippet, the title itself) and is only inspected for
/// work-mode hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub company: String,
    pub role: String,
    pub raw_text: String,
    pub location: String,
    pub link: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("field '{0}' is empty after trimming")]
    EmptyField(&'static str),
    #[error("apply link '{link}' is not a valid URL: {reason}")]
    InvalidLink { link: String, reason: String },
}

/// One curated posting as stored in a document section.
///
/// `last_updated` stays a free-form period token ("2024-06", "March 2024",
/// "unknown"); interpreting it is the staleness policy's job, not the
/// record's. `duration` is populated for internships only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub company: String,
    pub role: String,
    pub work_mode: WorkMode,
    pub location: String,
    pub apply_link: String,
    pub last_updated: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration: Option<String>,
}

impl Record {
    /// Builds a record, enforcing the storage invariants: company, role and
    /// location must be non-empty after trimming and the apply link must be
    /// a syntactically valid URL.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        company: impl Into<String>,
        role: impl Into<String>,
        work_mode: WorkMode,
        location: impl Into<String>,
        apply_link: impl Into<String>,
        last_updated: impl Into<String>,
        duration: Option<String>,
    ) -> Result<Self, RecordError> {
        let company = required("company", company.into())?;
        let role = required("role", role.into())?;
        let location = required("location", location.into())?;
        let apply_link = apply_link.into().trim().to_string();
        if let Err(err) = Url::parse(&apply_link) {
            return Err(RecordError::InvalidLink {
                link: apply_link,
                reason: err.to_string(),
            });
        }
        Ok(Self {
            company,
            role,
            work_mode,
            location,
            apply_link,
            last_updated: last_updated.into().trim().to_string(),
            duration: duration.map(|d| d.trim().to_string()),
        })
    }

    /// Stable identity of the logical posting: two records with the same
    /// key are the same posting regardless of source or scrape time.
    pub fn identity_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.company.to_lowercase(),
            self.role.to_lowercase(),
            self.location.to_lowercase()
        )
    }
}

fn required(name: &'static str, value: String) -> Result<String, RecordError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(RecordError::EmptyField(name));
    }
    Ok(trimmed.to_string())
}

/// Outcome class of one archive-or-update pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    Success,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    Update,
    Archive,
}

/// Per-section record movement for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionCounts {
    pub added: usize,
    pub removed: usize,
}

/// Advisory near-duplicate candidate surfaced for human review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewPair {
    pub key_a: String,
    pub key_b: String,
    pub confidence: f64,
}

/// Structured result of one pass. Every pass returns one of these; `Error`
/// status replaces thrown errors at the pass boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassReport {
    pub pass: PassKind,
    pub status: PassStatus,
    pub finished_at: DateTime<Utc>,
    pub jobs: SectionCounts,
    pub internships: SectionCounts,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub source_counts: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub category_counts: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub review_pairs: Vec<ReviewPair>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

impl PassReport {
    pub fn new(pass: PassKind, status: PassStatus) -> Self {
        Self {
            pass,
            status,
            finished_at: Utc::now(),
            jobs: SectionCounts::default(),
            internships: SectionCounts::default(),
            source_counts: BTreeMap::new(),
            category_counts: BTreeMap::new(),
            review_pairs: Vec::new(),
            message: None,
        }
    }

    pub fn skipped(pass: PassKind, reason: impl Into<String>) -> Self {
        let mut report = Self::new(pass, PassStatus::Skipped);
        report.message = Some(reason.into());
        report
    }

    pub fn error(pass: PassKind, message: impl Into<String>) -> Self {
        let mut report = Self::new(pass, PassStatus::Error);
        report.message = Some(message.into());
        report
    }

    pub fn counts_mut(&mut self, kind: SectionKind) -> &mut SectionCounts {
        match kind {
            SectionKind::Jobs => &mut self.jobs,
            SectionKind::Internships => &mut self.internships,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_trims_and_validates_required_fields() {
        let record = Record::new(
            "  Acme  ",
            "Engineer",
            WorkMode::Remote,
            " Berlin ",
            "https://acme.example/jobs/1",
            "2024-06",
            None,
        )
        .unwrap();
        assert_eq!(record.company, "Acme");
        assert_eq!(record.location, "Berlin");

        let err = Record::new(
            "   ",
            "Engineer",
            WorkMode::Remote,
            "Berlin",
            "https://acme.example/jobs/1",
            "2024-06",
            None,
        )
        .unwrap_err();
        assert_eq!(err, RecordError::EmptyField("company"));
    }

    #[test]
    fn record_rejects_unparseable_apply_link() {
        let err = Record::new(
            "Acme",
            "Engineer",
            WorkMode::Remote,
            "Berlin",
            "not a url",
            "2024-06",
            None,
        )
        .unwrap_err();
        assert!(matches!(err, RecordError::InvalidLink { .. }));
    }

    #[test]
    fn identity_key_is_case_insensitive_over_company_role_location() {
        let a = Record::new(
            "Acme",
            "Engineer",
            WorkMode::Remote,
            "Berlin",
            "https://acme.example/jobs/1",
            "2024-06",
            None,
        )
        .unwrap();
        let b = Record::new(
            "ACME",
            "engineer",
            WorkMode::OnSite,
            "BERLIN",
            "https://elsewhere.example/2",
            "2023-01",
            None,
        )
        .unwrap();
        assert_eq!(a.identity_key(), b.identity_key());
        assert_eq!(a.identity_key(), "acme|engineer|berlin");
    }

    #[test]
    fn work_mode_labels_round_trip_and_tolerate_variants() {
        for mode in [
            WorkMode::Remote,
            WorkMode::OnSite,
            WorkMode::Hybrid,
            WorkMode::Unknown,
        ] {
            assert_eq!(WorkMode::from_label(mode.label()), mode);
        }
        assert_eq!(WorkMode::from_label("  onsite "), WorkMode::OnSite);
        assert_eq!(WorkMode::from_label("In Office"), WorkMode::OnSite);
        assert_eq!(WorkMode::from_label("anywhere"), WorkMode::Unknown);
    }

    #[test]
    fn internships_schema_extends_jobs_schema_with_duration() {
        let jobs = SectionKind::Jobs.columns();
        let internships = SectionKind::Internships.columns();
        assert_eq!(&internships[..jobs.len()], jobs);
        assert_eq!(internships.last(), Some(&"Duration"));
    }
}
