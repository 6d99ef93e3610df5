use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scrip_core::RawPayload;
use scrip_storage::{FetchError, FetcherConfig, HttpFetcher, RequestPacer, RetryPolicy};
use tokio::time::Instant;
use tracing::debug;

use crate::{ExtractorChain, RetrievalError, RetrievalSession, Retriever};

#[derive(Debug, Clone, Default)]
pub struct HttpRetrieverConfig {
    pub user_agent: Option<String>,
    pub cookie_header: Option<String>,
    /// Pause between polls while the page has not yet produced enough values.
    /// Zero disables polling: one fetch per attempt.
    pub settle_delay: Duration,
    /// Shared by every session so the whole pool respects one rate.
    pub pacer: Option<Arc<RequestPacer>>,
}

/// Fetches the target over plain HTTP and runs the extraction chain on the
/// body. Image responses are passed through untouched.
pub struct HttpPageRetriever {
    config: HttpRetrieverConfig,
    chain: Arc<ExtractorChain>,
}

impl HttpPageRetriever {
    pub fn new(config: HttpRetrieverConfig, chain: ExtractorChain) -> Self {
        Self {
            config,
            chain: Arc::new(chain),
        }
    }
}

#[async_trait]
impl Retriever for HttpPageRetriever {
    fn name(&self) -> &'static str {
        "http-page"
    }

    async fn open_session(&self, worker_id: usize) -> Result<Box<dyn RetrievalSession>, RetrievalError> {
        // The session's deadline governs; the client timeout is only a backstop.
        let fetcher = HttpFetcher::new(FetcherConfig {
            timeout: Duration::from_secs(300),
            user_agent: self.config.user_agent.clone(),
            cookie_header: self.config.cookie_header.clone(),
            retry: RetryPolicy::none(),
        })
        .map_err(|e| RetrievalError::Session(format!("{e:#}")))?;
        debug!(worker_id, "http page session ready");
        Ok(Box::new(HttpPageSession {
            fetcher,
            chain: self.chain.clone(),
            settle_delay: self.config.settle_delay,
            pacer: self.config.pacer.clone(),
        }))
    }
}

struct HttpPageSession {
    fetcher: HttpFetcher,
    chain: Arc<ExtractorChain>,
    settle_delay: Duration,
    pacer: Option<Arc<RequestPacer>>,
}

fn map_fetch_error(err: FetchError, timeout: Duration) -> RetrievalError {
    if err.is_timeout() {
        RetrievalError::Timeout(timeout)
    } else {
        RetrievalError::Navigation(err.to_string())
    }
}

#[async_trait]
impl RetrievalSession for HttpPageSession {
    async fn pace(&mut self) {
        if let Some(pacer) = &self.pacer {
            pacer.acquire().await;
        }
    }

    async fn retrieve(&mut self, target: &str, timeout: Duration) -> Result<RawPayload, RetrievalError> {
        let deadline = Instant::now() + timeout;
        let mut polls = 0u32;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RetrievalError::Timeout(timeout));
            }
            let response = match tokio::time::timeout(remaining, self.fetcher.get(target)).await {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => return Err(map_fetch_error(err, timeout)),
                Err(_) => return Err(RetrievalError::Timeout(timeout)),
            };
            polls += 1;

            if response.is_image() {
                return Ok(RawPayload::Image(response.bytes));
            }

            let html = String::from_utf8_lossy(&response.bytes);
            match self.chain.extract(&html) {
                Ok(extracted) => {
                    debug!(url = target, polls, strategy = %extracted.strategy, values = extracted.values.len(), "extracted");
                    return Ok(RawPayload::Values(extracted.values));
                }
                Err(missing) => {
                    if self.settle_delay.is_zero() || Instant::now() + self.settle_delay >= deadline {
                        return Err(missing);
                    }
                    tokio::time::sleep(self.settle_delay).await;
                }
            }
        }
    }
}
