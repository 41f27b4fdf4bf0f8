//! Retrieval client for the vector-search backend.
//!
//! The backend answers `POST /search {query, topK}` with an envelope
//! `{code, message: {data: {query, topK, hits}}}` where `code == 0` means
//! success.

use crate::error::RetrievalError;
use crate::types::SearchResult;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// A search backend returning ranked passages.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Retrieve up to `top_k` passages for `query`, best first.
    async fn search(&self, query: &str, top_k: usize) -> Result<SearchResult, RetrievalError>;
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: EnvelopeMessage,
}

#[derive(Debug, Default, Deserialize)]
struct EnvelopeMessage {
    #[serde(default)]
    data: Option<SearchResult>,
}

/// HTTP client for the search backend.
#[derive(Debug, Clone)]
pub struct HttpSearchClient {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpSearchClient {
    /// Create a client for `base_url` posting to `search_path`.
    pub fn new(base_url: &str, search_path: &str, timeout: Duration) -> Self {
        Self::with_client(Client::new(), base_url, search_path, timeout)
    }

    /// Create a client that reuses an existing connection pool.
    pub fn with_client(
        client: Client,
        base_url: &str,
        search_path: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            endpoint: join_url(base_url, search_path),
            timeout,
        }
    }

    /// Fully resolved search URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn decode(status: reqwest::StatusCode, body: &str) -> Result<SearchResult, RetrievalError> {
        if !status.is_success() {
            return Err(RetrievalError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }
        let envelope: Envelope =
            serde_json::from_str(body).map_err(|e| RetrievalError::Decode {
                message: e.to_string(),
            })?;
        if envelope.code != 0 {
            return Err(RetrievalError::Envelope {
                code: envelope.code,
            });
        }
        let mut result = envelope.message.data.ok_or_else(|| RetrievalError::Decode {
            message: "envelope has no message.data".to_string(),
        })?;
        for hit in &mut result.hits {
            hit.fill_text_from_metadata();
        }
        Ok(result)
    }
}

#[async_trait]
impl SearchBackend for HttpSearchClient {
    async fn search(&self, query: &str, top_k: usize) -> Result<SearchResult, RetrievalError> {
        debug!(url = %self.endpoint, top_k, "Sending search request");

        let response = self
            .client
            .post(&self.endpoint)
            .header("User-Agent", "ragway")
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .json(&json!({ "query": query, "topK": top_k }))
            .send()
            .await
            .map_err(|e| RetrievalError::Request {
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| RetrievalError::Request {
            message: format!("failed to read response body: {e}"),
        })?;

        let result = Self::decode(status, &body)?;
        debug!(hits = result.hits.len(), "Search completed");
        Ok(result)
    }
}

/// Join a base URL and a path with exactly one `/` between them.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}
