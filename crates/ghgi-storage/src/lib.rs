//! Persistence ports + rate-limited HTTP access for GHG inventory reconciliation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

mod memory;
mod pg;
mod store;

pub use memory::MemoryStore;
pub use pg::{PgStore, MIGRATOR};
pub use store::{EmissionsStore, InventoryStore, PopulationStore, StoreError, WriteOutcome};

pub const CRATE_NAME: &str = "ghgi-storage";

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
    if err.is_timeout() || err.is_connect() {
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
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Allow `rate` requests per second, bursting up to `rate`.
    pub fn per_second(rate: u32) -> Self {
        let rate = rate.max(1);
        Self {
            capacity: rate,
            refill_every: (Duration::from_secs(1) / rate).max(Duration::from_millis(1)),
        }
    }
}

/// Request budget shared by every source hitting the same upstream API.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<(u32, Instant)>,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new((config.capacity.max(1), Instant::now())),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut guard = self.state.lock().await;
            let (tokens, last_refill) = &mut *guard;
            let refill_ms = self.refill_every.as_millis();
            if refill_ms > 0 {
                let refills = last_refill.elapsed().as_millis() / refill_ms;
                if refills > 0 {
                    let refills = u32::try_from(refills).unwrap_or(u32::MAX);
                    *tokens = tokens.saturating_add(refills).min(self.capacity);
                    *last_refill = Instant::now();
                }
            }
            if *tokens > 0 {
                *tokens -= 1;
                return;
            }
            drop(guard);
            tokio::time::sleep(self.refill_every).await;
        }
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
            global_concurrency: 8,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpBody {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
}

/// GET client with a global limit, a per-source limit and retry on transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<TokenBucket>,
    backoff: BackoffPolicy,
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

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket: config.token_bucket.map(TokenBucket::new),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// Fetch `url` on behalf of `source_id`. Non-2xx responses surface as
    /// [`HttpError::Status`] after retryable statuses are exhausted.
    pub async fn get(&self, source_id: &str, url: &str) -> Result<HttpBody, HttpError> {
        // Semaphores are never closed, so acquire only fails on a bug.
        let _global = self.global_limit.acquire().await.ok();
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.ok();

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", source_id, url);
        self.get_with_retries(url).instrument(span).await
    }

    async fn get_with_retries(&self, url: &str) -> Result<HttpBody, HttpError> {
        let mut attempt = 0usize;
        loop {
            let outcome = self.client.get(url).send().await;
            let can_retry = attempt < self.backoff.max_retries;

            match outcome {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp
                        .bytes()
                        .await
                        .map_err(|source| HttpError::Request {
                            url: final_url.clone(),
                            source,
                        })?
                        .to_vec();

                    if status.is_success() {
                        return Ok(HttpBody {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(%status, attempt, "retrying after transient status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(HttpError::Status {
                        status: status.as_u16(),
                        url: final_url,
                        body: String::from_utf8_lossy(&body).chars().take(512).collect(),
                    });
                }
                Err(source) => {
                    if classify_reqwest_error(&source) == RetryDisposition::Retryable && can_retry {
                        debug!(error = %source, attempt, "retrying after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(HttpError::Request {
                        url: url.to_string(),
                        source,
                    });
                }
            }
        }
    }
}
