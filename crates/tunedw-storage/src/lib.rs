//! Rate-limited HTTP fetch utilities and the warehouse reconciler.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod memory;
mod warehouse;

pub use memory::MemoryWarehouse;
pub use warehouse::{
    dedupe_keep_last, validate_identifier, PgWarehouse, QueryResult, ReconcileOutcome, SqlValue,
    Warehouse, WarehouseConfig, WarehouseError, WarehouseTables, MAX_VARCHAR_LEN,
};

pub const CRATE_NAME: &str = "tunedw-storage";

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
            max_retries: 0,
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
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    /// Token buckets keyed by source id. Sources without an entry are unthrottled.
    pub rate_limits: BTreeMap<String, TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 4,
            per_source_concurrency: 1,
            backoff: BackoffPolicy::default(),
            rate_limits: BTreeMap::new(),
        }
    }
}

impl HttpClientConfig {
    pub fn with_rate_limit(
        mut self,
        source_id: impl Into<String>,
        limit: TokenBucketConfig,
    ) -> Self {
        self.rate_limits.insert(source_id.into(), limit);
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// One request per `interval`, no bursting.
    pub fn one_per(interval: Duration) -> Self {
        Self {
            capacity: 1,
            refill_every: interval,
        }
    }
}

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

    /// Waits until a token is available and consumes it.
    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                self.refill_every.saturating_sub(state.last_refill.elapsed())
            };
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn available(&self) -> u32 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }

    /// Credits one token per whole `refill_every` elapsed, up to capacity. A full
    /// bucket restarts its clock so idle time never banks extra tokens.
    fn refill(&self, state: &mut TokenBucketState) {
        if self.refill_every.is_zero() {
            state.tokens = self.capacity;
            return;
        }
        let intervals = state.last_refill.elapsed().as_nanos() / self.refill_every.as_nanos();
        let earned = intervals.min(u128::from(self.capacity)) as u32;
        if earned > 0 {
            state.tokens = state.tokens.saturating_add(earned).min(self.capacity);
            if state.tokens == self.capacity {
                state.last_refill = Instant::now();
            } else {
                state.last_refill += self.refill_every * earned;
            }
        }
    }
}

/// Shared HTTP client for the external connectors.
///
/// Every request goes through a global semaphore, a per-source semaphore and the
/// source's token bucket (if one is configured). Retries follow `BackoffPolicy`
/// and only apply to statuses and transport errors classified as retryable.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_buckets: HashMap<String, Arc<SimpleTokenBucket>>,
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
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }
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
        let token_buckets = config
            .rate_limits
            .iter()
            .map(|(source_id, c)| {
                (
                    source_id.clone(),
                    Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)),
                )
            })
            .collect();

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_buckets,
            backoff: config.backoff,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// Sends a prepared request, returning the body of a 2xx response.
    ///
    /// Non-2xx statuses come back as `FetchError::HttpStatus`. Requests whose body
    /// cannot be cloned are never retried.
    pub async fn send(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, source_id);
        self.send_with_retries(source_id, request).instrument(span).await
    }

    async fn send_with_retries(
        &self,
        source_id: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let mut request = request;
        let mut attempt = 0usize;

        loop {
            let retry_copy = if attempt < self.backoff.max_retries {
                request.try_clone()
            } else {
                None
            };

            if let Some(bucket) = self.token_buckets.get(source_id) {
                bucket.take().await;
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

                    match retry_copy {
                        Some(next) if classify_status(status) == RetryDisposition::Retryable => {
                            debug!(status = status.as_u16(), attempt, "retrying after status");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            request = next;
                            attempt += 1;
                        }
                        _ => {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                            })
                        }
                    }
                }
                Err(err) => match retry_copy {
                    Some(next) if classify_reqwest_error(&err) == RetryDisposition::Retryable => {
                        debug!(error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        request = next;
                        attempt += 1;
                    }
                    _ => return Err(FetchError::Request(err)),
                },
            }
        }
    }
}
