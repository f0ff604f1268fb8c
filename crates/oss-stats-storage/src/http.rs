//! Rate-limited HTTP fetching shared by every source adapter.
//!
//! All GitHub and npm traffic goes through one [`HttpFetcher`]. A request
//! holds a global permit and a permit for its source id, optionally waits on
//! a token bucket, and is retried on throttling and server errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 429 and 5xx are retried, and so is GitHub's 403 once the quota is spent.
pub fn classify_status(status: StatusCode, headers: &HeaderMap) -> RetryDisposition {
    let quota_spent = status == StatusCode::FORBIDDEN
        && headers
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim() == "0");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || quota_spent {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_transport_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Delay requested by a `retry-after: <seconds>` header.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs = headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    Some(Duration::from_secs(secs))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: usize,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            first_delay: Duration::from_millis(500),
            ceiling: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Doubles from `first_delay` per attempt unless the server named a delay;
    /// either way capped at `ceiling`.
    pub fn delay_for(&self, attempt: usize, server_hint: Option<Duration>) -> Duration {
        let doubled = u32::try_from(attempt)
            .ok()
            .and_then(|a| 2u32.checked_pow(a))
            .and_then(|factor| self.first_delay.checked_mul(factor))
            .unwrap_or(self.ceiling);
        server_hint.unwrap_or(doubled).min(self.ceiling)
    }
}

/// Permit counts. Sources without an entry in `per_source` get `default_per_source`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyLimits {
    pub global: usize,
    pub default_per_source: usize,
    pub per_source: HashMap<String, usize>,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            global: 32,
            default_per_source: 8,
            per_source: HashMap::new(),
        }
    }
}

impl ConcurrencyLimits {
    fn for_source(&self, source_id: &str) -> usize {
        self.per_source
            .get(source_id)
            .copied()
            .unwrap_or(self.default_per_source)
            .max(1)
    }
}

/// Steady request rate: `burst` requests up front, then one per `refill_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub burst: u32,
    pub refill_every: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: ConcurrencyLimits,
    pub retry: RetryPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: ConcurrencyLimits::default(),
            retry: RetryPolicy::default(),
            rate_limit: None,
        }
    }
}

impl HttpClientConfig {
    pub fn with_source_limit(mut self, source_id: &str, limit: usize) -> Self {
        self.concurrency
            .per_source
            .insert(source_id.to_string(), limit);
        self
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    limit: RateLimit,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    refilled_at: Instant,
}

impl BucketState {
    fn refill(&mut self, limit: RateLimit) {
        if limit.refill_every.is_zero() {
            self.tokens = limit.burst;
            return;
        }
        let earned = self.refilled_at.elapsed().as_nanos() / limit.refill_every.as_nanos();
        if earned == 0 {
            return;
        }
        let earned = u32::try_from(earned).unwrap_or(u32::MAX);
        self.tokens = self.tokens.saturating_add(earned).min(limit.burst);
        // Keep the partial progress toward the next token unless the bucket is full.
        self.refilled_at = if self.tokens == limit.burst {
            Instant::now()
        } else {
            self.refilled_at + limit.refill_every * earned
        };
    }
}

impl TokenBucket {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            state: Mutex::new(BucketState {
                tokens: limit.burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Waits until a token is available and consumes it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                state.refill(self.limit);
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                self.limit
                    .refill_every
                    .saturating_sub(state.refilled_at.elapsed())
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub status: StatusCode,
    /// URL after redirects.
    pub url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{url} answered {status}")]
    Status { status: u16, url: String },
    #[error("invalid header {name}: {message}")]
    InvalidHeader { name: String, message: String },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND.as_u16())
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global: Arc<Semaphore>,
    limits: ConcurrencyLimits,
    sources: Mutex<HashMap<String, Arc<Semaphore>>>,
    bucket: Option<TokenBucket>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(agent) = config.user_agent.as_deref() {
            builder = builder.user_agent(agent.to_string());
        }
        let client = builder.build().context("building http client")?;

        Ok(Self {
            client,
            global: Arc::new(Semaphore::new(config.concurrency.global.max(1))),
            limits: config.concurrency,
            sources: Mutex::new(HashMap::new()),
            bucket: config.rate_limit.map(TokenBucket::new),
            retry: config.retry,
        })
    }

    async fn source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut sources = self.sources.lock().await;
        sources
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.limits.for_source(source_id))))
            .clone()
    }

    /// GET `url` under the concurrency cap of `source_id`, retrying transient
    /// failures.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchedBody, FetchError> {
        let headers = build_headers(headers)?;
        let _global = self.global.acquire().await.map_err(|_| FetchError::Closed)?;
        let source = self.source_semaphore(source_id).await;
        let _source = source.acquire().await.map_err(|_| FetchError::Closed)?;
        if let Some(bucket) = &self.bucket {
            bucket.acquire().await;
        }

        self.send_with_retries(url, headers)
            .instrument(info_span!("http_fetch", %run_id, source_id, url))
            .await
    }

    async fn send_with_retries(
        &self,
        url: &str,
        headers: HeaderMap,
    ) -> Result<FetchedBody, FetchError> {
        let mut attempt = 0;
        loop {
            let sent = self.client.get(url).headers(headers.clone()).send().await;
            let (error, retry_hint) = match sent {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(FetchedBody {
                        status: resp.status(),
                        url: resp.url().to_string(),
                        body: resp.bytes().await?.to_vec(),
                    });
                }
                Ok(resp) => {
                    let retryable =
                        classify_status(resp.status(), resp.headers()) == RetryDisposition::Retryable;
                    let hint = retry_after(resp.headers());
                    let error = FetchError::Status {
                        status: resp.status().as_u16(),
                        url: resp.url().to_string(),
                    };
                    (error, retryable.then_some(hint))
                }
                Err(err) => {
                    let retryable = classify_transport_error(&err) == RetryDisposition::Retryable;
                    (FetchError::Transport(err), retryable.then_some(None))
                }
            };

            match retry_hint {
                Some(hint) if attempt < self.retry.retries => {
                    let delay = self.retry.delay_for(attempt, hint);
                    debug!(attempt, error = %error, delay_ms = delay.as_millis() as u64, "retrying fetch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                _ => return Err(error),
            }
        }
    }
}

fn build_headers(pairs: &[(&str, &str)]) -> Result<HeaderMap, FetchError> {
    let invalid = |name: &str, err: &dyn std::fmt::Display| FetchError::InvalidHeader {
        name: name.to_string(),
        message: err.to_string(),
    };
    let mut map = HeaderMap::with_capacity(pairs.len());
    for (name, value) in pairs {
        let key = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(name, &e))?;
        let value = HeaderValue::from_str(value).map_err(|e| invalid(name, &e))?;
        map.insert(key, value);
    }
    Ok(map)
}
