//! HTTP surface built on axum: the WebSocket answer session, the plain
//! search endpoint and a health probe.

use super::SessionTimings;
use super::session::{Session, run_session};
use crate::config::ServerConfig;
use crate::error::RagError;
use crate::rag::RagService;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

/// Shared state handed to every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub rag: Arc<RagService>,
    pub timings: SessionTimings,
    /// Directory served as the router fallback, if any.
    pub static_dir: Option<PathBuf>,
    pub started_at: chrono::DateTime<Utc>,
}

impl AppState {
    pub fn new(rag: Arc<RagService>, timings: SessionTimings) -> Self {
        Self {
            rag,
            timings,
            static_dir: None,
            started_at: Utc::now(),
        }
    }

    pub fn with_static_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.static_dir = dir;
        self
    }

    /// Uptime in seconds since the state was created.
    pub fn uptime_secs(&self) -> u64 {
        let elapsed = Utc::now() - self.started_at;
        elapsed.num_seconds().max(0) as u64
    }
}

/// Build the router with `/ws/answer`, `/search` and `/health`.
pub fn router(state: AppState) -> Router {
    let static_dir = state.static_dir.clone();
    let app = Router::new()
        .route("/ws/answer", get(ws_handler))
        .route("/search", post(search_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state));

    let app = match static_dir {
        Some(dir) => {
            let index_file = dir.join("index.html");
            app.fallback_service(ServeDir::new(&dir).not_found_service(ServeFile::new(index_file)))
        }
        None => app,
    };

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    let span = info_span!("ws_session", %connection_id);
    async move {
        info!("Session opened");
        let (sink, stream) = socket.split();
        let session = run_session(
            Session::new(connection_id),
            sink,
            stream,
            &state.rag,
            state.timings,
        )
        .await;
        info!(received_ask = session.has_received_ask, "Session closed");
    }
    .instrument(span)
    .await
}

/// Health check endpoint.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.uptime_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default, rename = "topK", alias = "top_k")]
    top_k: i64,
}

/// Plain search. Always HTTP 200; `code` tells success from failure.
async fn search_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Json<Value> {
    let request: SearchRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return Json(error_envelope("BAD_REQUEST", &e.to_string(), None)),
    };

    match state.rag.search(&request.query, request.top_k).await {
        Ok(data) => Json(json!({ "code": 0, "message": { "data": data } })),
        Err(e @ RagError::Validation(_)) => {
            Json(error_envelope("BAD_REQUEST", &e.to_string(), None))
        }
        Err(e) => {
            warn!(error = %e, "Search failed");
            Json(error_envelope("SEARCH_FAILED", &e.to_string(), e.upstream()))
        }
    }
}

fn error_envelope(code: &str, message: &str, upstream: Option<&str>) -> Value {
    let mut error = json!({ "code": code, "message": message });
    if let Some(upstream) = upstream {
        error["upstream"] = json!(upstream);
    }
    json!({ "code": 1, "message": { "error": error } })
}

/// Bind the configured address and serve until Ctrl-C.
pub async fn run(config: &ServerConfig, state: AppState) -> Result<(), std::io::Error> {
    let app = router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %listener.local_addr()?, "Gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
}
