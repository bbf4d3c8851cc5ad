//! Deadline entity store contract + bounded HTTP fetch utilities for AXIS.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use axis_core::{Deadline, DeadlinePatch, NewDeadline};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "axis-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Per-user deadline persistence. `update` returns `Ok(None)` for a missing
/// id; callers treat that as a normal skip, never a failure.
#[async_trait]
pub trait DeadlineStore: Send + Sync {
    /// Flat, unpaginated listing. `now` drives ordering (soonest due first);
    /// it never filters records out.
    async fn list(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        include_completed: bool,
    ) -> Result<Vec<Deadline>, StoreError>;

    async fn create(&self, user_id: &str, new: NewDeadline) -> Result<Deadline, StoreError>;

    async fn update(
        &self,
        user_id: &str,
        id: &str,
        patch: DeadlinePatch,
    ) -> Result<Option<Deadline>, StoreError>;
}

/// In-memory store used by tests, the CLI, and the review API. Each write
/// holds the map lock for its full duration, which is the per-write
/// atomicity the reconciliation bridges assume.
#[derive(Debug, Default)]
pub struct MemoryDeadlineStore {
    records: Mutex<HashMap<String, Vec<Deadline>>>,
}

impl MemoryDeadlineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user's deadlines wholesale, replacing anything present.
    pub async fn seed(&self, user_id: &str, deadlines: Vec<Deadline>) {
        let mut records = self.records.lock().await;
        records.insert(user_id.to_string(), deadlines);
    }
}

fn apply_patch(deadline: &mut Deadline, patch: DeadlinePatch) {
    if let Some(course) = patch.course {
        deadline.course = course;
    }
    if let Some(task) = patch.task {
        deadline.task = task;
    }
    if let Some(due_date) = patch.due_date {
        deadline.due_date = due_date;
    }
    if let Some(source_due_date) = patch.source_due_date {
        deadline.source_due_date = source_due_date;
    }
    if let Some(priority) = patch.priority {
        deadline.priority = priority;
    }
    if let Some(completed) = patch.completed {
        deadline.completed = completed;
    }
}

#[async_trait]
impl DeadlineStore for MemoryDeadlineStore {
    async fn list(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        include_completed: bool,
    ) -> Result<Vec<Deadline>, StoreError> {
        let records = self.records.lock().await;
        let mut out: Vec<Deadline> = records
            .get(user_id)
            .map(|v| v.as_slice())
            .unwrap_or_default()
            .iter()
            .filter(|d| include_completed || !d.completed)
            .cloned()
            .collect();
        out.sort_by_key(|d| ((d.due_date - now).num_seconds(), d.id.clone()));
        Ok(out)
    }

    async fn create(&self, user_id: &str, new: NewDeadline) -> Result<Deadline, StoreError> {
        let deadline = Deadline {
            id: new.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            course: new.course,
            task: new.task,
            due_date: new.due_date,
            source_due_date: new.source_due_date,
            priority: new.priority,
            completed: new.completed,
            canvas_assignment_id: new.canvas_assignment_id,
        };
        let mut records = self.records.lock().await;
        records
            .entry(user_id.to_string())
            .or_default()
            .push(deadline.clone());
        Ok(deadline)
    }

    async fn update(
        &self,
        user_id: &str,
        id: &str,
        patch: DeadlinePatch,
    ) -> Result<Option<Deadline>, StoreError> {
        let mut records = self.records.lock().await;
        let Some(user_records) = records.get_mut(user_id) else {
            return Ok(None);
        };
        let Some(deadline) = user_records.iter_mut().find(|d| d.id == id) else {
            return Ok(None);
        };
        apply_patch(deadline, patch);
        Ok(Some(deadline.clone()))
    }
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

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_host_concurrency: 2,
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

/// Coarse rate limiter for API hosts that throttle (the GitHub search API
/// allows only a handful of requests per minute unauthenticated).
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
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
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
    #[error("decoding response from {url}: {message}")]
    Decode { url: String, message: String },
}

/// Bounded GET client for source integrations: global + per-host concurrency
/// caps, optional token bucket, and retry with exponential backoff for
/// retryable statuses and transport errors.
#[derive(Debug)]
pub struct ApiFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl ApiFetcher {
    pub fn new(config: ApiClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    fn host_of(url: &str) -> String {
        url.strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .unwrap_or(url)
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }

    /// GET `url`, optionally with an `Accept` header (GitHub's raw-content
    /// endpoints key on it).
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        url: &str,
        accept: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let host = Self::host_of(url);
        let per_host = self.per_host_semaphore(&host).await;
        let _host_permit = per_host.acquire().await.expect("semaphore not closed");

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("api_fetch", %run_id, host, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.get(url);
            if let Some(accept) = accept {
                request = request.header(reqwest::header::ACCEPT, accept);
            }

            match request.send().await {
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

    /// GET + JSON-decode in one step.
    pub async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        run_id: Uuid,
        url: &str,
    ) -> Result<T, FetchError> {
        let resp = self
            .fetch_bytes(run_id, url, Some("application/json"))
            .await?;
        serde_json::from_slice(&resp.body).map_err(|e| FetchError::Decode {
            url: resp.final_url,
            message: e.to_string(),
        })
    }
}
