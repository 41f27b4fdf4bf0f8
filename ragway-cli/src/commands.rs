//! CLI subcommand handlers.

use crate::{Commands, ConfigAction};
use async_trait::async_trait;
use ragway_core::gateway::run_gateway;
use ragway_core::{AppState, FragmentSink, Hit, RagService, RagwayConfig, StatusSink};
use std::io::Write;
use std::sync::Arc;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, config: RagwayConfig) -> anyhow::Result<()> {
    match command {
        Commands::Serve { host, port } => handle_serve(config, host, port).await,
        Commands::Search { query, top_k } => handle_search(&config, &query, top_k).await,
        Commands::Ask { query, top_k } => handle_ask(&config, &query, top_k).await,
        Commands::Config { action } => handle_config(action, &config),
    }
}

fn build_service(config: &RagwayConfig) -> anyhow::Result<RagService> {
    RagService::from_config(config).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

async fn handle_serve(
    mut config: RagwayConfig,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    // Apply CLI overrides
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let rag = build_service(&config)?;
    tracing::info!(
        model = %config.llm.model,
        threshold = config.rag.threshold,
        top_k = config.default_top_k(),
        "Answer pipeline ready"
    );

    let state = AppState::new(Arc::new(rag), config.gateway.timings())
        .with_static_dir(config.server.static_dir.clone());
    run_gateway(&config.server, state).await?;
    Ok(())
}

async fn handle_search(config: &RagwayConfig, query: &str, top_k: i64) -> anyhow::Result<()> {
    let rag = build_service(config)?;
    let result = rag.search(query, top_k).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Pipeline statuses go to stderr so stdout carries only the answer.
struct TerminalStatus;

#[async_trait]
impl StatusSink for TerminalStatus {
    async fn on_status(&self, stage: &str, msg: &str) {
        eprintln!("[{stage}] {msg}");
    }
}

struct StdoutFragments;

#[async_trait]
impl FragmentSink for StdoutFragments {
    async fn on_fragment(&self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }
}

async fn handle_ask(config: &RagwayConfig, query: &str, top_k: i64) -> anyhow::Result<()> {
    let rag = build_service(config)?;
    let hits = rag
        .answer_stream(query, top_k, &StdoutFragments, &TerminalStatus)
        .await?;
    println!();
    if !hits.is_empty() {
        println!("\n{}", format_sources(&hits));
    }
    Ok(())
}

/// Numbered source list matching the citation numbers in the prompt.
fn format_sources(hits: &[Hit]) -> String {
    let mut out = String::from("Sources:");
    for (i, hit) in hits.iter().enumerate() {
        let preview: String = hit.text.chars().take(80).collect();
        out.push_str(&format!(
            "\n[{}] {} (score {:.2}) {}",
            i + 1,
            hit.id,
            hit.score,
            preview
        ));
    }
    out
}

fn handle_config(action: ConfigAction, config: &RagwayConfig) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let rendered = config
                .to_redacted_toml()
                .map_err(|e| anyhow::anyhow!("Failed to render config: {}", e))?;
            println!("{}", rendered);
            Ok(())
        }
    }
}
