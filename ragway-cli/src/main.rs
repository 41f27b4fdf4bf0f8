//! Ragway CLI: runs the answer gateway and queries it from the terminal.

mod commands;

use clap::Parser;
use ragway_core::config::ServerConfig;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Ragway: streaming retrieval-augmented answers over WebSocket
#[derive(Parser, Debug)]
#[command(name = "ragway", version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Subcommand (defaults to `serve`)
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug, PartialEq)]
enum Commands {
    /// Run the HTTP/WebSocket gateway
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Query the search backend once and print the result as JSON
    Search {
        query: String,
        /// Number of passages (0 = configured default)
        #[arg(short = 'k', long, default_value_t = 0)]
        top_k: i64,
    },
    /// Answer a question in the terminal, streaming the response
    Ask {
        query: String,
        /// Number of passages (0 = configured default)
        #[arg(short = 'k', long, default_value_t = 0)]
        top_k: i64,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug, PartialEq)]
enum ConfigAction {
    /// Print the effective configuration (API key redacted)
    Show,
}

/// Pick the stderr filter: `-v`/`-q` first, then `RUST_LOG`, then the
/// configured level.
fn stderr_filter(verbose: u8, quiet: bool, configured: &str) -> EnvFilter {
    let forced = match verbose {
        0 if quiet => Some("error"),
        0 => None,
        1 => Some("debug"),
        _ => Some("trace"),
    };
    match forced {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(configured)),
    }
}

/// Human-readable stderr logging plus, when `log_dir` is set, a daily JSON
/// log file. The returned guard must live until exit.
fn init_logging(cli: &Cli, server: &ServerConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter(cli.verbose, cli.quiet, &server.log_level));

    let (json_layer, guard) = match &server.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "ragway.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config = ragway_core::load_config(cli.config.as_deref(), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let _guard = init_logging(&cli, &config.server)?;

    let command = cli.command.unwrap_or(Commands::Serve {
        host: None,
        port: None,
    });
    commands::handle_command(command, config).await
}
