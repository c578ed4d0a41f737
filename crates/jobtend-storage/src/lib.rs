//! Versioned document storage + HTTP fetch utilities for jobtend.
//!
//! The curated board lives in a single markdown document hosted in a GitHub
//! repository. Every mutation goes through [`DocumentStore`], which exposes a
//! compare-and-swap style write: callers read a [`DocumentSnapshot`], derive a
//! new body, and hand the snapshot's [`VersionToken`] back with the write. A
//! concurrent editor surfaces as [`WriteOutcome::Conflict`] instead of a lost
//! update.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use base64::prelude::*;
use reqwest::header;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, Instrument};

pub const CRATE_NAME: &str = "jobtend-storage";

/// Opaque revision marker for one document state.
///
/// For the GitHub backend this is the blob sha returned by the contents API;
/// the in-memory backend derives it from a content hash. Tokens only support
/// equality, never ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One consistent read of the hosted document.
#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
    pub content: String,
    pub version: VersionToken,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The store accepted the new body and now reports this version.
    Committed(VersionToken),
    /// The expected version was no longer current; nothing was written.
    Conflict,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store returned http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("document payload could not be decoded: {0}")]
    Decode(String),
}

/// Read/write access to the single hosted markdown document.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn read(&self) -> Result<DocumentSnapshot, StoreError>;

    /// Replace the document body iff `expected` is still the current version.
    async fn write(
        &self,
        content: &str,
        expected: &VersionToken,
        message: &str,
    ) -> Result<WriteOutcome, StoreError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Connection settings for [`GithubDocumentStore`].
#[derive(Debug, Clone)]
pub struct GithubStoreConfig {
    /// `owner/name` slug of the hosting repository.
    pub repo: String,
    /// Path of the document inside the repository, e.g. `README.md`.
    pub path: String,
    /// Personal access token with contents write permission.
    pub token: String,
    pub api_base: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl GithubStoreConfig {
    pub fn new(repo: impl Into<String>, path: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            path: path.into(),
            token: token.into(),
            api_base: "https://api.github.com".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: format!("jobtend/{}", env!("CARGO_PKG_VERSION")),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// [`DocumentStore`] backed by the GitHub repository contents API.
///
/// Writes carry the blob sha observed at read time; GitHub answers a stale
/// sha with `409 Conflict`, which maps onto [`WriteOutcome::Conflict`] so the
/// caller can re-read and retry with fresh state.
#[derive(Debug)]
pub struct GithubDocumentStore {
    client: reqwest::Client,
    repo: String,
    path: String,
    token: String,
    api_base: String,
    backoff: BackoffPolicy,
}

#[derive(Debug, Deserialize)]
struct ContentsPayload {
    content: String,
    sha: String,
    encoding: String,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    message: &'a str,
    content: String,
    sha: &'a str,
}

#[derive(Debug, Deserialize)]
struct UpdatePayload {
    content: UpdatedBlob,
}

#[derive(Debug, Deserialize)]
struct UpdatedBlob {
    sha: String,
}

impl GithubDocumentStore {
    pub fn new(config: GithubStoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            repo: config.repo,
            path: config.path,
            token: config.token,
            api_base: config.api_base,
            backoff: config.backoff,
        })
    }

    pub fn contents_url(&self) -> String {
        format!(
            "{}/repos/{}/contents/{}",
            self.api_base.trim_end_matches('/'),
            self.repo,
            self.path
        )
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.token)
            .header(header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    /// Send a request, retrying transport failures and 5xx/429 responses.
    /// Non-retryable statuses are returned to the caller for inspection.
    async fn send_with_retry<F>(&self, request: F) -> Result<reqwest::Response, StoreError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match request().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(StoreError::Request(err));
                }
            }
        }

        Err(StoreError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[async_trait]
impl DocumentStore for GithubDocumentStore {
    async fn read(&self) -> Result<DocumentSnapshot, StoreError> {
        let url = self.contents_url();
        let span = info_span!("document_read", repo = %self.repo, path = %self.path);
        async move {
            let resp = self
                .send_with_retry(|| self.authorized(self.client.get(&url)))
                .await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(StoreError::Status {
                    status: status.as_u16(),
                    url,
                });
            }

            let payload: ContentsPayload = resp.json().await?;
            if !payload.encoding.eq_ignore_ascii_case("base64") {
                return Err(StoreError::Decode(format!(
                    "unexpected contents encoding {:?}",
                    payload.encoding
                )));
            }

            // The API wraps base64 at 60 columns; strip the line breaks first.
            let packed: String = payload
                .content
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            let bytes = BASE64_STANDARD
                .decode(packed.as_bytes())
                .map_err(|err| StoreError::Decode(err.to_string()))?;
            let content =
                String::from_utf8(bytes).map_err(|err| StoreError::Decode(err.to_string()))?;

            Ok(DocumentSnapshot {
                content,
                version: VersionToken::new(payload.sha),
            })
        }
        .instrument(span)
        .await
    }

    async fn write(
        &self,
        content: &str,
        expected: &VersionToken,
        message: &str,
    ) -> Result<WriteOutcome, StoreError> {
        let url = self.contents_url();
        let span = info_span!("document_write", repo = %self.repo, path = %self.path);
        let body = UpdateRequest {
            message,
            content: BASE64_STANDARD.encode(content.as_bytes()),
            sha: expected.as_str(),
        };

        async move {
            let resp = self
                .send_with_retry(|| self.authorized(self.client.put(&url)).json(&body))
                .await?;
            let status = resp.status();
            if status == StatusCode::CONFLICT {
                return Ok(WriteOutcome::Conflict);
            }
            if !status.is_success() {
                return Err(StoreError::Status {
                    status: status.as_u16(),
                    url,
                });
            }

            let payload: UpdatePayload = resp.json().await?;
            Ok(WriteOutcome::Committed(VersionToken::new(
                payload.content.sha,
            )))
        }
        .instrument(span)
        .await
    }
}

/// [`DocumentStore`] holding the document in process memory.
///
/// Versions are content hashes, so the conflict semantics mirror the GitHub
/// backend without any network involvement. Tests simulate a concurrent
/// editor by calling [`InMemoryDocumentStore::overwrite`] between a read and
/// the matching write.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    state: Mutex<InMemoryDocument>,
}

#[derive(Debug, Default)]
struct InMemoryDocument {
    content: String,
    writes: usize,
}

impl InMemoryDocumentStore {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(InMemoryDocument {
                content: content.into(),
                writes: 0,
            }),
        }
    }

    /// Replace the document unconditionally, as an out-of-band editor would.
    pub async fn overwrite(&self, content: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.content = content.into();
    }

    pub async fn content(&self) -> String {
        self.state.lock().await.content.clone()
    }

    /// Number of conditional writes that committed.
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn read(&self) -> Result<DocumentSnapshot, StoreError> {
        let state = self.state.lock().await;
        Ok(DocumentSnapshot {
            content: state.content.clone(),
            version: VersionToken::new(sha256_hex(state.content.as_bytes())),
        })
    }

    async fn write(
        &self,
        content: &str,
        expected: &VersionToken,
        _message: &str,
    ) -> Result<WriteOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let current = VersionToken::new(sha256_hex(state.content.as_bytes()));
        if &current != expected {
            return Ok(WriteOutcome::Conflict);
        }

        state.content = content.to_string();
        state.writes += 1;
        Ok(WriteOutcome::Committed(VersionToken::new(sha256_hex(
            state.content.as_bytes(),
        ))))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    fn bucket(self) -> SimpleTokenBucket {
        SimpleTokenBucket::new(self.capacity, self.refill_every)
    }
}

/// Paces request starts: `capacity` tokens are granted up front and one
/// token is restored per `refill_every` interval. Intervals under a
/// millisecond disable pacing.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        let interval_ms = self.refill_every.as_millis();
        if interval_ms == 0 {
            return;
        }
        loop {
            let mut state = self.state.lock().await;
            let refills = state.last_refill.elapsed().as_millis() / interval_ms;
            if refills > 0 {
                let credit = u32::try_from(refills).unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(credit).min(self.capacity);
                if state.tokens == self.capacity {
                    state.last_refill = Instant::now();
                } else {
                    // Advance by whole intervals so the fractional
                    // remainder keeps counting toward the next token.
                    state.last_refill += self.refill_every * credit;
                }
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let wait = self.refill_every.saturating_sub(state.last_refill.elapsed());
            drop(state);
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

/// Shared outbound HTTP client for source adapters.
///
/// Concurrency is limited globally and per source so a slow site cannot
/// monopolize the pool, and an optional token bucket paces request starts.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config.token_bucket.map(|c| Arc::new(c.bucket()));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", source_id, url);
        async move {
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..=self.backoff.max_retries {
                let resp_result = self.client.get(url).send().await;

                match resp_result {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }

                        let disposition = classify_status(status);
                        if disposition == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }

                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        let disposition = classify_reqwest_error(&err);
                        if disposition == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            last_request_error = Some(err);
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }

            Err(FetchError::Request(
                last_request_error.expect("retry loop should capture a request error"),
            ))
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn in_memory_write_commits_when_version_matches() {
        let store = InMemoryDocumentStore::new("# Board\n");

        let snapshot = store.read().await.expect("read");
        assert_eq!(snapshot.content, "# Board\n");

        let outcome = store
            .write("# Board\nupdated\n", &snapshot.version, "Update job listings")
            .await
            .expect("write");
        assert!(matches!(outcome, WriteOutcome::Committed(_)));
        assert_eq!(store.content().await, "# Board\nupdated\n");
        assert_eq!(store.write_count().await, 1);
    }

    #[tokio::test]
    async fn in_memory_write_conflicts_on_stale_version() {
        let store = InMemoryDocumentStore::new("original");

        let snapshot = store.read().await.expect("read");
        store.overwrite("changed behind our back").await;

        let outcome = store
            .write("our edit", &snapshot.version, "Update job listings")
            .await
            .expect("write");
        assert_eq!(outcome, WriteOutcome::Conflict);
        assert_eq!(store.content().await, "changed behind our back");
        assert_eq!(store.write_count().await, 0);
    }

    #[tokio::test]
    async fn in_memory_retry_succeeds_after_rereading() {
        let store = InMemoryDocumentStore::new("v1");

        let stale = store.read().await.expect("read");
        store.overwrite("v2").await;
        assert_eq!(
            store
                .write("ours", &stale.version, "msg")
                .await
                .expect("write"),
            WriteOutcome::Conflict
        );

        let fresh = store.read().await.expect("re-read");
        let outcome = store
            .write("ours", &fresh.version, "msg")
            .await
            .expect("write");
        assert!(matches!(outcome, WriteOutcome::Committed(_)));
        assert_eq!(store.content().await, "ours");
    }

    #[test]
    fn identical_content_yields_identical_versions() {
        let a = VersionToken::new(sha256_hex(b"same body"));
        let b = VersionToken::new(sha256_hex(b"same body"));
        assert_eq!(a, b);
    }

    #[test]
    fn contents_url_joins_api_base_repo_and_path() {
        let mut config = GithubStoreConfig::new("acme/jobs-board", "README.md", "token");
        config.api_base = "https://api.github.com/".to_string();
        let store = GithubDocumentStore::new(config).expect("store");
        assert_eq!(
            store.contents_url(),
            "https://api.github.com/repos/acme/jobs-board/contents/README.md"
        );
    }

    #[test]
    fn status_classification_spares_conflicts_from_retry() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::CONFLICT),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn token_bucket_delays_takes_beyond_capacity() {
        let started = Instant::now();
        let bucket = SimpleTokenBucket::new(2, Duration::from_millis(200));

        bucket.take().await;
        bucket.take().await;
        assert!(started.elapsed() < Duration::from_millis(150));

        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_millis(190));
    }

    #[tokio::test]
    async fn token_bucket_with_sub_millisecond_interval_never_blocks() {
        let bucket = SimpleTokenBucket::new(1, Duration::ZERO);
        for _ in 0..5 {
            bucket.take().await;
        }
    }

    #[test]
    fn fetcher_builds_with_token_bucket_pacing_enabled() {
        let config = HttpClientConfig {
            token_bucket: Some(TokenBucketConfig {
                capacity: 2,
                refill_every: Duration::from_millis(500),
            }),
            ..HttpClientConfig::default()
        };
        assert!(HttpFetcher::new(config).is_ok());
    }
}
