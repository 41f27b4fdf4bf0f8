//! Configuration system for ragway.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! local config file -> environment -> explicit overrides.

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of passages retrieved per query.
pub const DEFAULT_TOP_K: usize = 5;

/// Default relevance threshold below which generation falls back.
pub const DEFAULT_THRESHOLD: f64 = 0.35;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RagwayConfig {
    pub server: ServerConfig,
    pub rag: RagConfig,
    pub retrieval: RetrievalConfig,
    pub llm: LlmConfig,
    pub gateway: crate::gateway::GatewayConfig,
}

/// HTTP listener and process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Default log filter when neither `RUST_LOG` nor `-v` is given.
    pub log_level: String,
    /// Directory for the JSON log file. No file log when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    /// Directory of static assets served as the router fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_level: "info".to_string(),
            log_dir: None,
            static_dir: None,
        }
    }
}

/// Retrieval and routing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    /// Passages retrieved when the caller asks for `<= 0`.
    pub top_k: i64,
    /// Largest top-k a caller may request.
    pub max_top_k: usize,
    /// Top-hit score below which the answer is generated in fallback mode.
    pub threshold: f64,
    /// Persona line that opens the system prompt.
    pub persona: String,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K as i64,
            max_top_k: 50,
            threshold: DEFAULT_THRESHOLD,
            persona: crate::prompt::DEFAULT_PERSONA.to_string(),
        }
    }
}

/// Search backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Base URL of the search service, e.g. `https://search.example.workers.dev`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Path of the search endpoint.
    pub search_path: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            search_path: "/search".to_string(),
            timeout_secs: 10,
        }
    }
}

impl RetrievalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Chat-completion backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of the OpenAI-compatible API.
    pub base_url: String,
    /// Path of the chat completions endpoint, appended to `base_url`.
    pub chat_path: String,
    /// Inline API key. Prefer `api_key_env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Model used for grounded answers.
    pub model: String,
    /// Model used in fallback mode. Same as `model` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
    /// Default request timeout in seconds, streaming included.
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com".to_string(),
            chat_path: "/chat/completions".to_string(),
            api_key: None,
            api_key_env: "DEEPSEEK_API_KEY".to_string(),
            model: "deepseek-chat".to_string(),
            fallback_model: None,
            timeout_secs: 60,
            temperature: None,
            top_p: None,
            max_tokens: None,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Resolve the API key: inline value first, then the environment variable.
    /// `None` when neither is set; the key is optional.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }
}

impl RagwayConfig {
    /// Normalise defaults and reject values the gateway cannot run with.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.rag.top_k <= 0 {
            self.rag.top_k = DEFAULT_TOP_K as i64;
        }
        if self.rag.threshold <= 0.0 {
            self.rag.threshold = DEFAULT_THRESHOLD;
        }
        let top_k = self.rag.top_k as usize;
        if self.rag.max_top_k < top_k {
            self.rag.max_top_k = top_k;
        }

        if let Some(base) = &self.retrieval.base_url {
            let parsed = url::Url::parse(base).map_err(|e| ConfigError::Invalid {
                message: format!("retrieval.base_url invalid: {e}"),
            })?;
            if parsed.cannot_be_a_base() {
                return Err(ConfigError::Invalid {
                    message: "retrieval.base_url must be an absolute http(s) URL".to_string(),
                });
            }
        }
        url::Url::parse(&self.llm.base_url).map_err(|e| ConfigError::Invalid {
            message: format!("llm.base_url invalid: {e}"),
        })?;

        if self.retrieval.timeout_secs == 0 || self.llm.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "upstream timeouts must be at least one second".to_string(),
            });
        }
        self.gateway.validate()
    }

    /// Effective default top-k after validation.
    pub fn default_top_k(&self) -> usize {
        if self.rag.top_k <= 0 {
            DEFAULT_TOP_K
        } else {
            self.rag.top_k as usize
        }
    }

    /// Render as TOML with secrets blanked out.
    pub fn to_redacted_toml(&self) -> Result<String, ConfigError> {
        let mut copy = self.clone();
        if copy.llm.api_key.is_some() {
            copy.llm.api_key = Some("***".to_string());
        }
        toml::to_string_pretty(&copy).map_err(|e| ConfigError::Load {
            message: e.to_string(),
        })
    }
}

/// Path of the user-level config file, e.g. `~/.config/ragway/config.toml`.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "ragway", "ragway")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `RAGWAY_`)
/// 3. The explicit `path`, else `$RAGWAY_CONFIG`, else `./config.toml`
/// 4. User config (`~/.config/ragway/config.toml`)
/// 5. Built-in defaults
///
/// The result is validated before it is returned.
pub fn load_config(
    path: Option<&Path>,
    overrides: Option<&RagwayConfig>,
) -> Result<RagwayConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(RagwayConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    let local = match path {
        Some(p) => {
            if !p.exists() {
                return Err(ConfigError::Load {
                    message: format!("config file not found: {}", p.display()),
                });
            }
            p.to_path_buf()
        }
        None => std::env::var("RAGWAY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml")),
    };
    if local.exists() {
        figment = figment.merge(Toml::file(&local));
    }

    // RAGWAY_LLM__MODEL, RAGWAY_RAG__THRESHOLD, ...
    figment = figment.merge(Env::prefixed("RAGWAY_").ignore(&["CONFIG"]).split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let mut config: RagwayConfig = figment.extract().map_err(|e| ConfigError::Load {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}
