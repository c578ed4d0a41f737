//! End-to-end parses of captured listing markup through the public API.

use chrono::{TimeZone, Utc};
use jobtend_adapters::{parse_greenhouse_feed, parse_indeed_listing, parse_linkedin_listing, FetchQuery};

const LINKEDIN_CAPTURE: &str = r#"
<html><body>
  <ul>
    <li>
      <div class="base-card job-search-card">
        <a class="base-card__full-link" href="https://www.linkedin.com/jobs/view/3912345678">
          Backend Engineer
        </a>
        <div class="base-search-card__info">
          <h3 class="base-search-card__title"> Backend Engineer </h3>
          <h4 class="base-search-card__subtitle"> Nord Systems </h4>
          <div class="base-search-card__metadata">
            <span class="job-search-card__location"> Stockholm, Sweden </span>
          </div>
        </div>
      </div>
    </li>
    <li>
      <div class="base-card job-search-card">
        <a class="base-card__full-link" href="https://www.linkedin.com/jobs/view/3912345999">
          DevOps Intern
        </a>
        <div class="base-search-card__info">
          <h3 class="base-search-card__title"> DevOps Intern (Hybrid) </h3>
          <h4 class="base-search-card__subtitle"> CloudFjord </h4>
          <div class="base-search-card__metadata">
            <span class="job-search-card__location"> Oslo, Norway </span>
          </div>
        </div>
      </div>
    </li>
  </ul>
</body></html>
"#;

#[test]
fn linkedin_capture_parses_every_complete_card() {
    let records = parse_linkedin_listing(LINKEDIN_CAPTURE).unwrap();
    assert_eq!(records.len(), 2);

    assert_eq!(records[0].company, "Nord Systems");
    assert_eq!(records[0].role, "Backend Engineer");
    assert_eq!(records[0].location, "Stockholm, Sweden");
    assert_eq!(
        records[0].link,
        "https://www.linkedin.com/jobs/view/3912345678"
    );

    assert_eq!(records[1].role, "DevOps Intern (Hybrid)");
    assert_eq!(records[1].raw_text, "DevOps Intern (Hybrid)");
}

#[test]
fn indeed_capture_keeps_card_scoped_fields_separate() {
    let page = r#"
    <html><body>
      <div class="job_seen_beacon" data-jk="a1b2c3">
        <h2 class="jobTitle"><span>Data Engineer</span></h2>
        <span class="companyName">Lakehouse BV</span>
        <div class="companyLocation">Amsterdam, Netherlands</div>
        <div class="metadata"><span>Remote</span></div>
      </div>
      <div class="job_seen_beacon" data-jk="d4e5f6">
        <h2 class="jobTitle"><span>QA Engineer</span></h2>
        <span class="companyName">Testable Oy</span>
        <div class="companyLocation">Helsinki, Finland</div>
      </div>
    </body></html>
    "#;

    let records = parse_indeed_listing(page).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].raw_text, "Remote");
    assert_eq!(records[1].raw_text, "QA Engineer");
    assert_eq!(records[0].link, "https://www.indeed.com/viewjob?jk=a1b2c3");
    assert_eq!(records[1].link, "https://www.indeed.com/viewjob?jk=d4e5f6");
}

#[test]
fn greenhouse_capture_respects_empty_filters() {
    let feed = r#"{
        "jobs": [
            {
                "title": "Platform Engineer",
                "absolute_url": "https://boards.greenhouse.io/nord/jobs/42",
                "location": {"name": "Copenhagen, Denmark"},
                "updated_at": "2024-06-12T09:30:00+00:00"
            }
        ]
    }"#;
    let now = Utc.with_ymd_and_hms(2024, 6, 14, 0, 0, 0).unwrap();

    // Empty keyword/location lists mean "no filter", not "match nothing".
    let query = FetchQuery::new(Vec::new(), Vec::new(), 30);
    let records = parse_greenhouse_feed(feed, "Nord", &query, now).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].company, "Nord");
    assert_eq!(records[0].location, "Copenhagen, Denmark");
}
