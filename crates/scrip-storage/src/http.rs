use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, COOKIE, USER_AGENT};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::RetryPolicy;

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Pre-rendered `Cookie` header sent with every request.
    pub cookie_header: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            cookie_header: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Shared request pacing (generic cell rate): at most `burst` requests in any
/// `period`, spread evenly once the burst is spent.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    tolerance: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(burst: u32, period: Duration) -> Self {
        let burst = burst.max(1);
        let interval = period / burst;
        Self {
            interval,
            tolerance: interval * (burst - 1),
            next_slot: Mutex::new(None),
        }
    }

    /// Wait for a free slot. A slot is only claimed once no wait remains, so a
    /// caller dropped while sleeping leaves the schedule untouched.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut next_slot = self.next_slot.lock().await;
                let now = Instant::now();
                let slot = next_slot.map_or(now, |t| t.max(now));
                let wait = (slot - now).saturating_sub(self.tolerance);
                if wait.is_zero() {
                    *next_slot = Some(slot + self.interval);
                    return;
                }
                wait
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl Fetched {
    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.trim_start().to_ascii_lowercase().starts_with("image/"))
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{url} answered {status}")]
    Status { status: u16, url: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Transport(err) if err.is_timeout())
    }

    /// Worth another attempt: throttling, server errors, dropped connections.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            FetchError::Status { status, .. } => *status == 429 || (500..600).contains(status),
        }
    }
}

/// One `reqwest` client plus its retry schedule.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(agent) = &config.user_agent {
            headers.insert(USER_AGENT, HeaderValue::from_str(agent).context("user agent is not a valid header")?);
        }
        if let Some(cookie) = &config.cookie_header {
            let mut value = HeaderValue::from_str(cookie).context("cookie header is not a valid header")?;
            value.set_sensitive(true);
            headers.insert(COOKIE, value);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true)
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    /// GET `url`, retrying transient failures on the configured schedule.
    pub async fn get(&self, url: &str) -> Result<Fetched, FetchError> {
        let mut retry = 0usize;
        loop {
            let err = match self.get_once(url).await {
                Ok(fetched) => return Ok(fetched),
                Err(err) => err,
            };
            if retry >= self.retry.max_retries || !err.is_transient() {
                return Err(err);
            }
            let delay = self.retry.delay(retry);
            debug!(url, retry, delay_ms = delay.as_millis() as u64, error = %err, "transient fetch failure");
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }

    async fn get_once(&self, url: &str) -> Result<Fetched, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?.to_vec();
        debug!(url = %final_url, status = status.as_u16(), bytes = bytes.len(), "fetched");
        Ok(Fetched {
            url: final_url,
            status: status.as_u16(),
            content_type,
            bytes,
        })
    }
}
