//! Answer pipeline: retrieval, routing, prompt assembly, streamed generation.
//!
//! [`RagService`] is built once at startup from its collaborators and shared
//! by every session. It holds no per-request mutable state.

use crate::config::RagwayConfig;
use crate::error::{ConfigError, RagError, ValidationError};
use crate::prompt::build_messages;
use crate::providers::{ChatCompletion, FragmentSink, create_completion_client};
use crate::retrieval::{HttpSearchClient, SearchBackend};
use crate::types::{ChatOptions, Hit, SearchResult};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Stage label emitted before retrieval.
pub const STAGE_SEARCH: &str = "search";

/// Receives pipeline status events in order.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn on_status(&self, stage: &str, msg: &str);
}

/// Status sink that discards every event.
pub struct NoOpStatus;

#[async_trait]
impl StatusSink for NoOpStatus {
    async fn on_status(&self, _stage: &str, _msg: &str) {}
}

/// Generation mode chosen from the retrieval result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMode {
    /// Evidence is strong enough to ground the answer.
    Grounded,
    /// No hits, or the best hit scored under the threshold.
    Fallback,
}

impl RouteMode {
    /// Stage label announced for this mode.
    pub fn stage(&self) -> &'static str {
        match self {
            RouteMode::Grounded => "llm",
            RouteMode::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for RouteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteMode::Grounded => write!(f, "grounded"),
            RouteMode::Fallback => write!(f, "fallback"),
        }
    }
}

/// Pick the generation mode. A top score equal to `threshold` is grounded.
pub fn route(hits: &[Hit], threshold: f64) -> RouteMode {
    match hits.first() {
        Some(top) if top.score >= threshold => RouteMode::Grounded,
        _ => RouteMode::Fallback,
    }
}

/// Static knobs of the pipeline.
#[derive(Debug, Clone)]
pub struct RagSettings {
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub threshold: f64,
    pub persona: String,
    /// Model for grounded answers.
    pub model: String,
    /// Model for fallback answers; `model` when unset.
    pub fallback_model: Option<String>,
    pub chat_options: ChatOptions,
}

impl Default for RagSettings {
    fn default() -> Self {
        Self::from_config(&RagwayConfig::default())
    }
}

impl RagSettings {
    pub fn from_config(config: &RagwayConfig) -> Self {
        let mut chat_options = ChatOptions::default();
        chat_options.temperature = config.llm.temperature;
        chat_options.top_p = config.llm.top_p;
        chat_options.max_tokens = config.llm.max_tokens;

        Self {
            default_top_k: config.default_top_k(),
            max_top_k: config.rag.max_top_k,
            threshold: config.rag.threshold,
            persona: config.rag.persona.clone(),
            model: config.llm.model.clone(),
            fallback_model: config.llm.fallback_model.clone(),
            chat_options,
        }
    }
}

/// The answer pipeline.
pub struct RagService {
    search: Arc<dyn SearchBackend>,
    llm: Arc<dyn ChatCompletion>,
    settings: RagSettings,
}

impl std::fmt::Debug for RagService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RagService")
            .field("settings", &self.settings)
            .finish()
    }
}

impl RagService {
    pub fn new(
        search: Arc<dyn SearchBackend>,
        llm: Arc<dyn ChatCompletion>,
        settings: RagSettings,
    ) -> Self {
        Self {
            search,
            llm,
            settings,
        }
    }

    /// Wire the HTTP clients described by the configuration. Both clients
    /// share one connection pool. Only the retrieval URL is required.
    pub fn from_config(config: &RagwayConfig) -> Result<Self, ConfigError> {
        let base_url = config
            .retrieval
            .base_url
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid {
                message: "retrieval.base_url is required".to_string(),
            })?;
        let http = reqwest::Client::new();
        let search = HttpSearchClient::with_client(
            http.clone(),
            base_url,
            &config.retrieval.search_path,
            config.retrieval.timeout(),
        );
        let llm = create_completion_client(&config.llm, http);
        Ok(Self::new(Arc::new(search), llm, RagSettings::from_config(config)))
    }

    pub fn settings(&self) -> &RagSettings {
        &self.settings
    }

    /// Resolve a caller-supplied top-k: `<= 0` selects the default, values
    /// above the configured maximum are rejected.
    pub fn effective_top_k(&self, requested: i64) -> Result<usize, ValidationError> {
        if requested <= 0 {
            return Ok(self.settings.default_top_k);
        }
        let max = self.settings.max_top_k;
        if requested as u64 > max as u64 {
            return Err(ValidationError::OutOfRange {
                field: "top_k".to_string(),
                value: requested,
                max,
            });
        }
        Ok(requested as usize)
    }

    /// Model used for a given mode.
    pub fn model_for(&self, mode: RouteMode) -> &str {
        match mode {
            RouteMode::Grounded => &self.settings.model,
            RouteMode::Fallback => self
                .settings
                .fallback_model
                .as_deref()
                .unwrap_or(&self.settings.model),
        }
    }

    /// Plain retrieval with the same top-k rules as the streaming pipeline.
    pub async fn search(&self, query: &str, top_k: i64) -> Result<SearchResult, RagError> {
        let query = validate_query(query)?;
        let top_k = self.effective_top_k(top_k)?;
        debug!(query_len = query.len(), top_k, "Plain search");
        Ok(self.search.search(query, top_k).await?)
    }

    /// Run the full pipeline, streaming fragments and statuses to the sinks.
    ///
    /// Returns the retrieved hits once generation has finished.
    pub async fn answer_stream(
        &self,
        query: &str,
        top_k: i64,
        fragments: &dyn FragmentSink,
        status: &dyn StatusSink,
    ) -> Result<Vec<Hit>, RagError> {
        let never = CancellationToken::new();
        self.answer_stream_until(query, top_k, fragments, status, &never)
            .await
    }

    /// [`answer_stream`](Self::answer_stream) that gives up with
    /// `RagError::Cancelled` when `stop` is triggered.
    ///
    /// `stop` is checked before retrieval and before generation. Once
    /// generation has started the stream runs to completion and its hits are
    /// returned.
    pub async fn answer_stream_until(
        &self,
        query: &str,
        top_k: i64,
        fragments: &dyn FragmentSink,
        status: &dyn StatusSink,
        stop: &CancellationToken,
    ) -> Result<Vec<Hit>, RagError> {
        let query = validate_query(query)?;
        let top_k = self.effective_top_k(top_k)?;
        check_stop(stop)?;

        status.on_status(STAGE_SEARCH, "query vector index").await;
        let result = self.search.search(query, top_k).await?;
        let hits = result.hits;

        let mode = route(&hits, self.settings.threshold);
        let model = self.model_for(mode);
        info!(
            query_len = query.len(),
            top_k,
            hits = hits.len(),
            top_score = hits.first().map(|h| h.score),
            mode = %mode,
            model,
            "Routed answer"
        );
        status.on_status(mode.stage(), model).await;

        let messages = build_messages(&self.settings.persona, query, &hits);
        check_stop(stop)?;

        let full = self
            .llm
            .complete_streaming(model, &messages, &self.settings.chat_options, fragments)
            .await?;
        debug!(chars = full.chars().count(), "Generation finished");

        Ok(hits)
    }
}

/// Reject blank queries. The query itself is forwarded unchanged.
fn validate_query(query: &str) -> Result<&str, ValidationError> {
    if query.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: "query".to_string(),
        });
    }
    Ok(query)
}

fn check_stop(stop: &CancellationToken) -> Result<(), RagError> {
    if stop.is_cancelled() {
        return Err(RagError::Cancelled);
    }
    Ok(())
}
