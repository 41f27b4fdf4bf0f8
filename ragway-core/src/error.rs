//! Error types for the ragway core.
//!
//! Uses `thiserror` for public API error types. Each upstream gets its own
//! enum so callers can tell a retrieval failure from a generation failure
//! and tag client-visible errors accordingly.

/// Top-level error type for the ragway core library.
#[derive(Debug, thiserror::Error)]
pub enum RagwayError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Pipeline error: {0}")]
    Rag(#[from] RagError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Malformed inbound requests. Never attributed to an upstream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("{field} out of range: {value} (max {max})")]
    OutOfRange { field: String, value: i64, max: usize },

    #[error("malformed request: {message}")]
    Malformed { message: String },
}

/// Errors from the search backend.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("search request failed: {message}")]
    Request { message: String },

    #[error("search backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("search backend error code={code}")]
    Envelope { code: i64 },

    #[error("search response decode failed: {message}")]
    Decode { message: String },
}

impl RetrievalError {
    /// Upstream tag used in client-visible error payloads.
    pub const UPSTREAM: &'static str = "retrieval";
}

/// Errors from the chat-completion backend.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("completion backend returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("completion request failed: {message}")]
    Request { message: String },

    #[error("completion stream failed: {message}")]
    Streaming { message: String, partial: String },

    #[error("completion response parse error: {message}")]
    ResponseParse { message: String },
}

impl LlmError {
    /// Upstream tag used in client-visible error payloads.
    pub const UPSTREAM: &'static str = "llm";

    /// Text generated before a mid-stream failure, if any was received.
    pub fn partial_text(&self) -> Option<&str> {
        match self {
            LlmError::Streaming { partial, .. } if !partial.is_empty() => Some(partial),
            _ => None,
        }
    }

    /// HTTP status reported by the completion backend, if the failure carried one.
    pub fn status(&self) -> Option<u16> {
        match self {
            LlmError::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Connection-level failures on a duplex session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("no ask frame received before the deadline")]
    AskTimeout,

    #[error("peer silent past the read deadline")]
    ReadDeadline,

    #[error("write to peer failed: {message}")]
    WriteFailed { message: String },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("malformed frame: {message}")]
    MalformedFrame { message: String },
}

/// Errors from the answer pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("cancelled")]
    Cancelled,
}

impl RagError {
    /// Which upstream produced this failure, if any.
    pub fn upstream(&self) -> Option<&'static str> {
        match self {
            RagError::Retrieval(_) => Some(RetrievalError::UPSTREAM),
            RagError::Llm(_) => Some(LlmError::UPSTREAM),
            RagError::Validation(_) | RagError::Cancelled => None,
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration load error: {message}")]
    Load { message: String },
}

/// A type alias for results using the top-level `RagwayError`.
pub type Result<T> = std::result::Result<T, RagwayError>;
