//! OpenAI-compatible chat-completion client.
//!
//! Works against DeepSeek, OpenAI, vLLM, Ollama and any endpoint that follows
//! the chat completions API. Streaming responses are event-stream bodies:
//! `data: <json>` lines terminated by `data: [DONE]`.

use super::{ChatCompletion, FragmentSink};
use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::retrieval::join_url;
use crate::types::{ChatMessage, ChatOptions};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::ops::ControlFlow;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Reserved data payload that ends a stream.
const DONE_SENTINEL: &str = "[DONE]";

/// OpenAI-compatible chat-completion client.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient {
    client: Client,
    base_url: String,
    chat_path: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiCompatibleClient {
    /// Create a client with an explicitly provided API key.
    pub fn new_with_key(config: &LlmConfig, api_key: String) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.clone(),
            chat_path: config.chat_path.clone(),
            api_key,
            timeout: config.timeout(),
        }
    }

    /// Reuse an existing connection pool.
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Override the chat completions path.
    pub fn with_chat_path(mut self, path: impl Into<String>) -> Self {
        self.chat_path = path.into();
        self
    }

    /// Fully resolved chat completions URL.
    pub fn endpoint(&self) -> String {
        join_url(&self.base_url, &self.chat_path)
    }

    /// Build the JSON request body. Unset options are omitted.
    fn build_body(
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
        stream: bool,
    ) -> Value {
        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });

        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = options.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if !options.stop.is_empty() {
            body["stop"] = json!(options.stop);
        }
        for (key, value) in &options.extra {
            body[key.as_str()] = value.clone();
        }
        body
    }

    fn build_request(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
        stream: bool,
    ) -> reqwest::RequestBuilder {
        let accept = if stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        let mut request = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .header("Accept", accept)
            .timeout(options.timeout.unwrap_or(self.timeout))
            .json(&Self::build_body(model, messages, options, stream));
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }

    /// Decode a non-streaming response body into the first choice's text.
    fn parse_response(body: &str) -> Result<String, LlmError> {
        let response: ChatResponse =
            serde_json::from_str(body).map_err(|e| LlmError::ResponseParse {
                message: format!("Invalid JSON: {}", e),
            })?;
        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default())
    }

    async fn upstream_error(response: reqwest::Response) -> LlmError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        warn!(status, "Completion backend returned an error status");
        LlmError::Upstream {
            status,
            body: body.trim().to_string(),
        }
    }
}

#[async_trait]
impl ChatCompletion for OpenAiCompatibleClient {
    async fn complete_once(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<String, LlmError> {
        debug!(url = %self.endpoint(), model, "Sending completion request");

        let response = self
            .build_request(model, messages, options, false)
            .send()
            .await
            .map_err(|e| LlmError::Request {
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Self::upstream_error(response).await);
        }

        let body = response.text().await.map_err(|e| LlmError::Request {
            message: format!("Failed to read response body: {}", e),
        })?;
        Self::parse_response(&body)
    }

    async fn complete_streaming(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
        on_fragment: &dyn FragmentSink,
    ) -> Result<String, LlmError> {
        debug!(url = %self.endpoint(), model, "Sending streaming completion request");

        let response = self
            .build_request(model, messages, options, true)
            .send()
            .await
            .map_err(|e| LlmError::Request {
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Self::upstream_error(response).await);
        }

        let body = std::pin::pin!(response.bytes_stream());
        let full = consume_event_stream(body, on_fragment).await?;
        debug!(chars = full.chars().count(), "Streaming completion finished");
        Ok(full)
    }
}

// Non-streaming response
#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

// Streaming chunk (one `data:` line)
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Meaning of one line of an event-stream body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    /// A non-empty piece of generated text.
    Fragment(String),
    /// The `[DONE]` sentinel.
    Done,
    /// Blank lines, comments, other fields, empty or malformed payloads.
    Skip,
}

/// Classify one event-stream line.
///
/// Malformed JSON payloads are skipped, not reported: one bad chunk must not
/// abort an otherwise healthy generation.
pub fn parse_stream_line(line: &str) -> StreamLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return StreamLine::Skip;
    };
    let data = data.trim();
    if data == DONE_SENTINEL {
        return StreamLine::Done;
    }
    if data.is_empty() {
        return StreamLine::Skip;
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty())
            .map(StreamLine::Fragment)
            .unwrap_or(StreamLine::Skip),
        Err(e) => {
            trace!(error = %e, "Skipping malformed stream chunk");
            StreamLine::Skip
        }
    }
}

/// Longest event-stream line kept by default. Longer lines are dropped like
/// any other malformed chunk.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits a byte stream into `\n`-terminated lines across arbitrary chunk
/// boundaries.
#[derive(Debug)]
pub struct LineDecoder {
    buf: Vec<u8>,
    /// Prefix of `buf` already searched for a terminator.
    scanned: usize,
    max_line: usize,
    /// Set while the rest of an oversized line is being thrown away.
    discarding: bool,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineDecoder {
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line,
            discarding: false,
        }
    }

    /// Feed a chunk and return every line it completed, without terminators.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buf[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            if self.discarding {
                self.discarding = false;
            } else {
                lines.push(String::from_utf8_lossy(&self.buf[start..end]).into_owned());
            }
            start = end + 1;
            from = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();

        if self.buf.len() > self.max_line {
            warn!(
                bytes = self.buf.len(),
                max = self.max_line,
                "Dropping oversized stream line"
            );
            self.buf.clear();
            self.scanned = 0;
            self.discarding = true;
        }
        lines
    }

    /// The trailing unterminated line, if any.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) {
            self.buf.clear();
            return None;
        }
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Read an event-stream body to completion.
///
/// Ends successfully on the `[DONE]` sentinel or at end of input. A transport
/// error mid-stream returns `LlmError::Streaming` carrying the text received
/// so far.
pub async fn consume_event_stream<S, E>(
    mut body: S,
    on_fragment: &dyn FragmentSink,
) -> Result<String, LlmError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut decoder = LineDecoder::default();
    let mut full = String::new();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                return Err(LlmError::Streaming {
                    message: e.to_string(),
                    partial: full,
                });
            }
        };
        for line in decoder.push(&chunk) {
            if apply_line(&line, &mut full, on_fragment).await.is_break() {
                return Ok(full);
            }
        }
    }

    if let Some(line) = decoder.finish() {
        let _ = apply_line(&line, &mut full, on_fragment).await;
    }
    Ok(full)
}

async fn apply_line(
    line: &str,
    full: &mut String,
    on_fragment: &dyn FragmentSink,
) -> ControlFlow<()> {
    match parse_stream_line(line) {
        StreamLine::Done => ControlFlow::Break(()),
        StreamLine::Fragment(text) => {
            full.push_str(&text);
            on_fragment.on_fragment(&text).await;
            ControlFlow::Continue(())
        }
        StreamLine::Skip => ControlFlow::Continue(()),
    }
}
