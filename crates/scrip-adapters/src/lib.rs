//! Retrieval port contracts, the per-worker session slot, and the bundled
//! HTTP page retriever with its selector-based extraction chain.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scrip_core::RawPayload;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

mod extract;
mod http_page;

pub use extract::{Extracted, Extractor, ExtractorChain, ExtractorSpec};
pub use http_page::{HttpPageRetriever, HttpRetrieverConfig};

pub const CRATE_NAME: &str = "scrip-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalErrorKind {
    Timeout,
    Navigation,
    MissingContent,
    Session,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetrievalError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("expected content missing: {0}")]
    MissingContent(String),
    #[error("session unusable: {0}")]
    Session(String),
}

impl RetrievalError {
    pub fn kind(&self) -> RetrievalErrorKind {
        match self {
            RetrievalError::Timeout(_) => RetrievalErrorKind::Timeout,
            RetrievalError::Navigation(_) => RetrievalErrorKind::Navigation,
            RetrievalError::MissingContent(_) => RetrievalErrorKind::MissingContent,
            RetrievalError::Session(_) => RetrievalErrorKind::Session,
        }
    }

    /// Whether the session that produced this error must be discarded.
    /// A page that loaded but lacked content leaves the session usable.
    pub fn poisons_session(&self) -> bool {
        !matches!(self, RetrievalError::MissingContent(_))
    }
}

/// Factory for worker-owned retrieval sessions (browser handle, HTTP client, ...).
#[async_trait]
pub trait Retriever: Send + Sync {
    fn name(&self) -> &'static str;

    async fn open_session(&self, worker_id: usize) -> Result<Box<dyn RetrievalSession>, RetrievalError>;
}

#[async_trait]
pub trait RetrievalSession: Send {
    /// Wait for permission to start the next retrieval. Time spent here is
    /// not charged to the retrieval timeout.
    async fn pace(&mut self) {}

    async fn retrieve(&mut self, target: &str, timeout: Duration) -> Result<RawPayload, RetrievalError>;

    async fn close(&mut self) {}
}

/// A pool of size one: the session is opened on first use, dropped after a
/// poisoning error, reopened on the next call, and closed on shutdown.
pub struct SessionSlot {
    retriever: Arc<dyn Retriever>,
    worker_id: usize,
    session: Option<Box<dyn RetrievalSession>>,
    opened: u32,
}

impl SessionSlot {
    pub fn new(retriever: Arc<dyn Retriever>, worker_id: usize) -> Self {
        Self {
            retriever,
            worker_id,
            session: None,
            opened: 0,
        }
    }

    pub fn sessions_opened(&self) -> u32 {
        self.opened
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Retrieve with a hard upper bound of `timeout`, whatever the session does.
    /// Pacing happens first and is outside that bound.
    pub async fn retrieve(&mut self, target: &str, timeout: Duration) -> Result<RawPayload, RetrievalError> {
        let session = match self.session.take() {
            Some(session) => session,
            None => {
                let session = self.retriever.open_session(self.worker_id).await?;
                self.opened += 1;
                debug!(worker = self.worker_id, retriever = self.retriever.name(), "retrieval session opened");
                session
            }
        };
        let session = self.session.insert(session);
        session.pace().await;

        let outcome = match tokio::time::timeout(timeout, session.retrieve(target, timeout)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RetrievalError::Timeout(timeout)),
        };

        if let Err(err) = &outcome {
            if err.poisons_session() {
                warn!(worker = self.worker_id, error = %err, "discarding retrieval session");
                self.shutdown().await;
            }
        }
        outcome
    }

    pub async fn shutdown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct CookieEntry {
    name: String,
    value: String,
}

/// Turn a browser-export cookie list (`[{"name": .., "value": ..}, ..]`) into a
/// `Cookie` header value. Extra fields such as domain or expiry are ignored.
pub fn cookie_header_from_json(json: &str) -> Result<Option<String>, AdapterError> {
    let entries: Vec<CookieEntry> = serde_json::from_str(json)
        .map_err(|e| AdapterError::Message(format!("invalid cookie JSON: {e}")))?;
    let pairs = entries
        .iter()
        .filter(|c| !c.name.trim().is_empty())
        .map(|c| format!("{}={}", c.name.trim(), c.value.trim()))
        .collect::<Vec<_>>();
    if pairs.is_empty() {
        Ok(None)
    } else {
        Ok(Some(pairs.join("; ")))
    }
}
