//! # Ragway Core
//!
//! Core library for the ragway answer gateway.
//! Provides the retrieval client, the streaming chat-completion client, the
//! RAG orchestrator, the WebSocket session protocol, configuration and the
//! shared data types.

pub mod config;
pub mod error;
pub mod gateway;
pub mod prompt;
pub mod providers;
pub mod rag;
pub mod retrieval;
pub mod types;

// Re-export commonly used types at the crate root.
pub use config::{RagwayConfig, load_config};
pub use error::{
    ConfigError, LlmError, ProtocolError, RagError, RagwayError, Result, RetrievalError,
    ValidationError,
};
pub use gateway::{AppState, ClientMessage, GatewayConfig, ServerMessage, SessionTimings};
pub use providers::{
    ChatCompletion, FragmentSink, NoOpSink, OpenAiCompatibleClient, create_completion_client,
};
pub use rag::{NoOpStatus, RagService, RagSettings, RouteMode, StatusSink, route};
pub use retrieval::{HttpSearchClient, SearchBackend};
pub use types::{ChatMessage, ChatOptions, Hit, Role, SearchResult};
