//! Chat-completion provider abstraction.
//!
//! Defines the `ChatCompletion` trait for one-shot and incremental
//! completions and the `FragmentSink` that receives streamed text. The HTTP
//! implementation for OpenAI-compatible APIs lives in [`openai_compat`].

pub mod openai_compat;

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::types::{ChatMessage, ChatOptions};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

pub use openai_compat::OpenAiCompatibleClient;

/// Receives generated text fragments in arrival order.
///
/// Called synchronously from the stream reader: the next line is not
/// processed until `on_fragment` returns.
#[async_trait]
pub trait FragmentSink: Send + Sync {
    async fn on_fragment(&self, text: &str);
}

/// Sink that discards every fragment.
pub struct NoOpSink;

#[async_trait]
impl FragmentSink for NoOpSink {
    async fn on_fragment(&self, _text: &str) {}
}

#[async_trait]
impl FragmentSink for mpsc::UnboundedSender<String> {
    async fn on_fragment(&self, text: &str) {
        let _ = self.send(text.to_string());
    }
}

/// A chat-completion backend.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    /// Perform a full completion and return the text of the first choice.
    ///
    /// A response with zero choices yields an empty string.
    async fn complete_once(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<String, LlmError>;

    /// Perform a streaming completion, forwarding every fragment to
    /// `on_fragment`, and return the concatenated text.
    async fn complete_streaming(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
        on_fragment: &dyn FragmentSink,
    ) -> Result<String, LlmError>;
}

/// Create the completion client described by the configuration.
///
/// `http` is shared with the other upstream clients. Without an API key the
/// client sends no `Authorization` header and the upstream decides.
pub fn create_completion_client(
    config: &LlmConfig,
    http: reqwest::Client,
) -> Arc<dyn ChatCompletion> {
    let api_key = config.resolve_api_key().unwrap_or_else(|| {
        warn!(
            env = %config.api_key_env,
            "No LLM API key configured, completion requests are unauthenticated"
        );
        String::new()
    });
    let client = OpenAiCompatibleClient::new_with_key(config, api_key).with_http_client(http);
    Arc::new(client)
}
