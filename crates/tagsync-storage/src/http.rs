use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::ACCEPT;
use reqwest::{RequestBuilder, StatusCode};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

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
        let factor = u32::try_from(attempt_index)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 4,
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
                let refills = u32::try_from(elapsed.as_millis() / self.refill_every.as_millis())
                    .unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
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

/// Credentials attached to one request. `Debug` never prints the secret.
#[derive(Clone)]
pub enum RequestAuth {
    None,
    Bearer(String),
    Basic { username: String, password: String },
}

impl fmt::Debug for RequestAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestAuth::None => f.write_str("None"),
            RequestAuth::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            RequestAuth::Basic { username, .. } => {
                write!(f, "Basic {{ username: {username:?}, password: <redacted> }}")
            }
        }
    }
}

impl RequestAuth {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            RequestAuth::None => request,
            RequestAuth::Bearer(token) => request.bearer_auth(token),
            RequestAuth::Basic { username, password } => request.basic_auth(username, Some(password)),
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
    #[error("retries exhausted for {url}")]
    RetriesExhausted { url: String },
    #[error("request limiter closed")]
    LimiterClosed,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Shared HTTP client: bounded timeout, global concurrency cap, optional
/// token bucket, and capped exponential backoff on retryable failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
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
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub async fn get(&self, url: &str, auth: &RequestAuth) -> Result<FetchedResponse, FetchError> {
        self.send_with_retry("GET", url, || {
            auth.apply(self.client.get(url).header(ACCEPT, "application/json"))
        })
        .await
    }

    pub async fn post_form(
        &self,
        url: &str,
        auth: &RequestAuth,
        form: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        self.send_with_retry("POST", url, || {
            auth.apply(self.client.post(url).header(ACCEPT, "application/json").form(form))
        })
        .await
    }

    async fn send_with_retry<F>(
        &self,
        method: &'static str,
        url: &str,
        build: F,
    ) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> RequestBuilder,
    {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let request_id = Uuid::new_v4();
        let span = info_span!("http_fetch", %request_id, method, url);
        async {
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..=self.backoff.max_retries {
                if let Some(bucket) = &self.token_bucket {
                    bucket.take().await;
                }

                match build().send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(status = status.as_u16(), attempt, "retryable status; backing off");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }

                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(error = %err, attempt, "request failed; backing off");
                            last_request_error = Some(err);
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }

            Err(match last_request_error {
                Some(err) => FetchError::Request(err),
                None => FetchError::RetriesExhausted {
                    url: url.to_string(),
                },
            })
        }
        .instrument(span)
        .await
    }
}
