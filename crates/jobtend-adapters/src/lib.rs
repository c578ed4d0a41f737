//! Source adapter contracts + listing-page adapter implementations.
//!
//! Adapters turn one external job source into a batch of [`RawRecord`]s.
//! Each adapter owns its URL construction and markup parsing; the parsing
//! halves are plain functions over strings so tests drive them with inline
//! fixtures instead of the network.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jobtend_core::RawRecord;
use jobtend_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;
use url::Url;

pub const CRATE_NAME: &str = "jobtend-adapters";

/// Search matrix a fetch pass walks: every keyword is queried in every
/// location, limited to postings from the last `recency_window_days`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchQuery {
    pub keywords: Vec<String>,
    pub locations: Vec<String>,
    pub recency_window_days: u32,
}

impl FetchQuery {
    pub fn new(keywords: Vec<String>, locations: Vec<String>, recency_window_days: u32) -> Self {
        Self {
            keywords,
            locations,
            recency_window_days,
        }
    }

    /// Single keyword/location pair, handy in tests.
    pub fn single(
        keyword: impl Into<String>,
        location: impl Into<String>,
        recency_window_days: u32,
    ) -> Self {
        Self {
            keywords: vec![keyword.into()],
            locations: vec![location.into()],
            recency_window_days,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] jobtend_storage::FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One external job source.
///
/// A failed page inside `fetch` is logged and skipped; the adapter only
/// errors when it cannot produce anything at all. Whole-adapter failures are
/// the caller's business: other sources keep contributing.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        query: &FetchQuery,
    ) -> Result<Vec<RawRecord>, AdapterError>;
}

fn selector(input: &str) -> Result<Selector, AdapterError> {
    Selector::parse(input).map_err(|e| AdapterError::Message(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn first_attr(scope: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

fn all_texts(scope: ElementRef<'_>, sel: &Selector) -> Vec<String> {
    scope
        .select(sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect()
}

/// LinkedIn public job search pages.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkedInAdapter;

impl LinkedInAdapter {
    pub fn search_url(keyword: &str, location: &str, days: u32) -> Result<String, AdapterError> {
        let mut url = Url::parse("https://www.linkedin.com/jobs/search/")
            .map_err(|e| AdapterError::Message(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("keywords", keyword)
            .append_pair("location", location)
            .append_pair("f_TPR", &format!("r{days}d"));
        Ok(url.into())
    }
}

/// Extract postings from a LinkedIn search results page. Cards missing any
/// of the four required elements are logged and dropped, never guessed at.
pub fn parse_linkedin_listing(html: &str) -> Result<Vec<RawRecord>, AdapterError> {
    let document = Html::parse_document(html);
    let card_sel = selector(".job-search-card")?;
    let title_sel = selector(".base-search-card__title")?;
    let company_sel = selector(".base-search-card__subtitle")?;
    let location_sel = selector(".job-search-card__location")?;
    let link_sel = selector("a.base-card__full-link")?;

    let mut records = Vec::new();
    for card in document.select(&card_sel) {
        let role = first_text(card, &title_sel);
        let company = first_text(card, &company_sel);
        let location = first_text(card, &location_sel);
        let link = first_attr(card, &link_sel, "href");

        match (role, company, location, link) {
            (Some(role), Some(company), Some(location), Some(link)) => {
                records.push(RawRecord {
                    company,
                    raw_text: role.clone(),
                    role,
                    location,
                    link,
                });
            }
            _ => {
                warn!(source_id = "linkedin", "job card missing required fields; skipping");
            }
        }
    }
    Ok(records)
}

#[async_trait]
impl SourceAdapter for LinkedInAdapter {
    fn source_id(&self) -> &'static str {
        "linkedin"
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        query: &FetchQuery,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let mut records = Vec::new();
        for location in &query.locations {
            for keyword in &query.keywords {
                let url = Self::search_url(keyword, location, query.recency_window_days)?;
                match http.fetch_bytes(self.source_id(), &url).await {
                    Ok(page) => {
                        let html = String::from_utf8_lossy(&page.body);
                        records.extend(parse_linkedin_listing(&html)?);
                    }
                    Err(err) => {
                        warn!(
                            source_id = self.source_id(),
                            url,
                            error = %err,
                            "search page fetch failed; skipping"
                        );
                    }
                }
            }
        }
        Ok(records)
    }
}

/// Indeed job search pages.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndeedAdapter;

impl IndeedAdapter {
    pub fn search_url(keyword: &str, location: &str, days: u32) -> Result<String, AdapterError> {
        let mut url = Url::parse("https://www.indeed.com/jobs")
            .map_err(|e| AdapterError::Message(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("q", keyword)
            .append_pair("l", location)
            .append_pair("fromage", &days.to_string());
        Ok(url.into())
    }
}

/// Extract postings from an Indeed results page. The apply link is derived
/// from the card's `data-jk` attribute; cards without one are dropped. Work
/// mode hints come from the card's metadata spans when present, otherwise
/// from the title.
pub fn parse_indeed_listing(html: &str) -> Result<Vec<RawRecord>, AdapterError> {
    let document = Html::parse_document(html);
    let card_sel = selector(".job_seen_beacon")?;
    let title_sel = selector(".jobTitle span")?;
    let company_sel = selector(".companyName")?;
    let location_sel = selector(".companyLocation")?;
    let metadata_sel = selector(".metadata span")?;

    let mut records = Vec::new();
    for card in document.select(&card_sel) {
        let role = first_text(card, &title_sel);
        let company = first_text(card, &company_sel);
        let location = first_text(card, &location_sel);
        let job_id = card
            .value()
            .attr("data-jk")
            .and_then(|s| text_or_none(s.to_string()));

        match (role, company, location, job_id) {
            (Some(role), Some(company), Some(location), Some(job_id)) => {
                let metadata = all_texts(card, &metadata_sel);
                let raw_text = if metadata.is_empty() {
                    role.clone()
                } else {
                    metadata.join(" ")
                };
                records.push(RawRecord {
                    company,
                    role,
                    raw_text,
                    location,
                    link: format!("https://www.indeed.com/viewjob?jk={job_id}"),
                });
            }
            _ => {
                warn!(source_id = "indeed", "job card missing required fields; skipping");
            }
        }
    }
    Ok(records)
}

#[async_trait]
impl SourceAdapter for IndeedAdapter {
    fn source_id(&self) -> &'static str {
        "indeed"
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        query: &FetchQuery,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let mut records = Vec::new();
        for location in &query.locations {
            for keyword in &query.keywords {
                let url = Self::search_url(keyword, location, query.recency_window_days)?;
                match http.fetch_bytes(self.source_id(), &url).await {
                    Ok(page) => {
                        let html = String::from_utf8_lossy(&page.body);
                        records.extend(parse_indeed_listing(&html)?);
                    }
                    Err(err) => {
                        warn!(
                            source_id = self.source_id(),
                            url,
                            error = %err,
                            "search page fetch failed; skipping"
                        );
                    }
                }
            }
        }
        Ok(records)
    }
}

/// A company board on the Greenhouse job-board API.
///
/// The feed has no server-side search, so the whole board is fetched and
/// filtered client-side against the query: keywords against titles,
/// locations against the posting's location name, and the recency window
/// against `updated_at`.
#[derive(Debug, Clone)]
pub struct GreenhouseAdapter {
    board: String,
    company: String,
}

impl GreenhouseAdapter {
    pub fn new(board: impl Into<String>, company: impl Into<String>) -> Self {
        Self {
            board: board.into(),
            company: company.into(),
        }
    }

    pub fn feed_url(&self) -> String {
        format!(
            "https://boards-api.greenhouse.io/v1/boards/{}/jobs",
            self.board
        )
    }
}

#[derive(Debug, Deserialize)]
struct GreenhouseFeed {
    jobs: Vec<GreenhouseJob>,
}

#[derive(Debug, Deserialize)]
struct GreenhouseJob {
    title: String,
    absolute_url: String,
    #[serde(default)]
    location: Option<GreenhouseLocation>,
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GreenhouseLocation {
    name: String,
}

fn within_recency_window(updated_at: Option<&str>, now: DateTime<Utc>, days: u32) -> bool {
    let Some(raw) = updated_at else {
        // No timestamp on the posting: keep it rather than silently lose it.
        return true;
    };
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => now.signed_duration_since(ts.with_timezone(&Utc)) <= Duration::days(days as i64),
        Err(_) => true,
    }
}

pub fn parse_greenhouse_feed(
    json: &str,
    company: &str,
    query: &FetchQuery,
    now: DateTime<Utc>,
) -> Result<Vec<RawRecord>, AdapterError> {
    let feed: GreenhouseFeed = serde_json::from_str(json)
        .map_err(|e| AdapterError::Message(format!("invalid board feed: {e}")))?;

    let mut records = Vec::new();
    for job in feed.jobs {
        if !within_recency_window(job.updated_at.as_deref(), now, query.recency_window_days) {
            continue;
        }

        let title_lower = job.title.to_lowercase();
        if !query.keywords.is_empty()
            && !query
                .keywords
                .iter()
                .any(|kw| title_lower.contains(&kw.to_lowercase()))
        {
            continue;
        }

        let location = job
            .location
            .map(|l| l.name)
            .unwrap_or_else(|| "Unspecified".to_string());
        let location_lower = location.to_lowercase();
        if !query.locations.is_empty()
            && !query
                .locations
                .iter()
                .any(|loc| location_lower.contains(&loc.to_lowercase()))
        {
            continue;
        }

        records.push(RawRecord {
            company: company.to_string(),
            raw_text: format!("{} {}", job.title, location),
            role: job.title,
            location,
            link: job.absolute_url,
        });
    }
    Ok(records)
}

#[async_trait]
impl SourceAdapter for GreenhouseAdapter {
    fn source_id(&self) -> &'static str {
        "greenhouse"
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        query: &FetchQuery,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let url = self.feed_url();
        let page = http.fetch_bytes(self.source_id(), &url).await?;
        let body = String::from_utf8_lossy(&page.body);
        parse_greenhouse_feed(&body, &self.company, query, Utc::now())
    }
}

pub fn linkedin_adapter() -> impl SourceAdapter {
    LinkedInAdapter
}

pub fn indeed_adapter() -> impl SourceAdapter {
    IndeedAdapter
}

pub fn greenhouse_adapter(
    board: impl Into<String>,
    company: impl Into<String>,
) -> impl SourceAdapter {
    GreenhouseAdapter::new(board, company)
}

/// Resolve a configured source id to its adapter. Greenhouse boards use the
/// form `greenhouse:<board-slug>`; the slug doubles as the company label
/// until the curator edits it in place.
pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        "linkedin" => Some(Box::new(LinkedInAdapter)),
        "indeed" => Some(Box::new(IndeedAdapter)),
        other => other
            .strip_prefix("greenhouse:")
            .filter(|board| !board.is_empty())
            .map(|board| Box::new(GreenhouseAdapter::new(board, board)) as Box<dyn SourceAdapter>),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const LINKEDIN_PAGE: &str = r#"
        <html><body>
          <div class="job-search-card">
            <h3 class="base-search-card__title">Backend Engineer (Remote)</h3>
            <h4 class="base-search-card__subtitle">Acme GmbH</h4>
            <span class="job-search-card__location">Berlin, Germany</span>
            <a class="base-card__full-link" href="https://www.linkedin.com/jobs/view/123">view</a>
          </div>
          <div class="job-search-card">
            <h3 class="base-search-card__title">Frontend Developer</h3>
            <h4 class="base-search-card__subtitle">No Link Ltd</h4>
            <span class="job-search-card__location">Warsaw, Poland</span>
          </div>
        </body></html>
    "#;

    const INDEED_PAGE: &str = r#"
        <html><body>
          <div class="job_seen_beacon" data-jk="abc123">
            <h2 class="jobTitle"><span>Software Engineer</span></h2>
            <span class="companyName">Widget Co</span>
            <div class="companyLocation">Amsterdam, Netherlands</div>
            <div class="metadata"><span>Hybrid</span><span>Full-time</span></div>
          </div>
          <div class="job_seen_beacon">
            <h2 class="jobTitle"><span>Orphan Card</span></h2>
            <span class="companyName">Widget Co</span>
            <div class="companyLocation">Amsterdam, Netherlands</div>
          </div>
        </body></html>
    "#;

    const GREENHOUSE_FEED: &str = r#"{
        "jobs": [
            {
                "title": "Senior Backend Engineer",
                "absolute_url": "https://boards.greenhouse.io/acme/jobs/1",
                "location": {"name": "Berlin, Germany"},
                "updated_at": "2024-06-10T08:00:00+00:00"
            },
            {
                "title": "Backend Engineer",
                "absolute_url": "https://boards.greenhouse.io/acme/jobs/2",
                "location": {"name": "Remote - Europe"},
                "updated_at": "2024-01-05T08:00:00+00:00"
            },
            {
                "title": "Account Executive",
                "absolute_url": "https://boards.greenhouse.io/acme/jobs/3",
                "location": {"name": "Berlin, Germany"},
                "updated_at": "2024-06-10T08:00:00+00:00"
            }
        ]
    }"#;

    #[test]
    fn linkedin_parse_drops_cards_without_links() {
        let records = parse_linkedin_listing(LINKEDIN_PAGE).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].company, "Acme GmbH");
        assert_eq!(records[0].role, "Backend Engineer (Remote)");
        assert_eq!(records[0].location, "Berlin, Germany");
        assert_eq!(records[0].link, "https://www.linkedin.com/jobs/view/123");
        assert_eq!(records[0].raw_text, records[0].role);
    }

    #[test]
    fn linkedin_search_url_encodes_query_and_recency() {
        let url = LinkedInAdapter::search_url("software engineer", "Berlin, Germany", 7).unwrap();
        assert!(url.starts_with("https://www.linkedin.com/jobs/search/?"));
        assert!(url.contains("keywords=software+engineer"));
        assert!(url.contains("location=Berlin%2C+Germany"));
        assert!(url.contains("f_TPR=r7d"));
    }

    #[test]
    fn indeed_parse_builds_view_url_and_metadata_text() {
        let records = parse_indeed_listing(INDEED_PAGE).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].link, "https://www.indeed.com/viewjob?jk=abc123");
        assert_eq!(records[0].raw_text, "Hybrid Full-time");
        assert_eq!(records[0].role, "Software Engineer");
    }

    #[test]
    fn indeed_search_url_uses_fromage_window() {
        let url = IndeedAdapter::search_url("backend developer", "Warsaw, Poland", 3).unwrap();
        assert!(url.contains("q=backend+developer"));
        assert!(url.contains("l=Warsaw%2C+Poland"));
        assert!(url.contains("fromage=3"));
    }

    #[test]
    fn greenhouse_feed_filters_by_keyword_recency_and_location() {
        let now = Utc.with_ymd_and_hms(2024, 6, 14, 12, 0, 0).unwrap();
        let query = FetchQuery::new(
            vec!["backend".to_string()],
            vec!["Berlin".to_string(), "Remote".to_string()],
            30,
        );

        let records = parse_greenhouse_feed(GREENHOUSE_FEED, "Acme", &query, now).unwrap();

        // Job 2 is outside the 30 day window, job 3 misses the keyword.
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].company, "Acme");
        assert_eq!(records[0].role, "Senior Backend Engineer");
        assert_eq!(records[0].raw_text, "Senior Backend Engineer Berlin, Germany");
    }

    #[test]
    fn greenhouse_keeps_postings_without_timestamps() {
        let now = Utc.with_ymd_and_hms(2024, 6, 14, 12, 0, 0).unwrap();
        assert!(within_recency_window(None, now, 7));
        assert!(within_recency_window(Some("not a date"), now, 7));
        assert!(!within_recency_window(
            Some("2024-01-05T08:00:00+00:00"),
            now,
            7
        ));
    }

    #[test]
    fn registry_resolves_known_sources() {
        assert_eq!(
            adapter_for_source("linkedin").map(|a| a.source_id()),
            Some("linkedin")
        );
        assert_eq!(
            adapter_for_source("indeed").map(|a| a.source_id()),
            Some("indeed")
        );
        assert_eq!(
            adapter_for_source("greenhouse:acme").map(|a| a.source_id()),
            Some("greenhouse")
        );
        assert!(adapter_for_source("glassdoor").is_none());
        assert!(adapter_for_source("greenhouse:").is_none());
    }

    #[tokio::test]
    async fn fetch_with_empty_search_matrix_is_a_clean_noop() {
        let http = HttpFetcher::new(jobtend_storage::HttpClientConfig::default()).unwrap();
        let query = FetchQuery::new(Vec::new(), Vec::new(), 7);

        let linkedin = LinkedInAdapter.fetch(&http, &query).await.unwrap();
        assert!(linkedin.is_empty());

        let indeed = IndeedAdapter.fetch(&http, &query).await.unwrap();
        assert!(indeed.is_empty());
    }
}
