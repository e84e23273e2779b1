//! Canopy CLI — the main entry point.
//!
//! Commands:
//! - `serve`   — Start the HTTP gateway
//! - `config`  — Print the effective configuration

use canopy_archive::{HashEmbedder, ProviderEmbedder, SqliteArchive};
use canopy_chat::{ChatOrchestrator, OrchestratorOptions};
use canopy_config::AppConfig;
use canopy_core::{Archive, Embedder, Provider};
use canopy_forest::Forest;
use canopy_gateway::AppState;
use canopy_providers::{EchoProvider, OpenAiCompatProvider};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "canopy",
    about = "Canopy — hierarchical conversation context manager",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file
    #[arg(short, long, default_value = "canopy.toml", global = true)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print the effective configuration (secrets redacted)
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = AppConfig::load(&cli.config)?;
    for warning in config.warnings() {
        warn!("{warning}");
    }

    match cli.command {
        Commands::Serve { port } => serve(config, port).await?,
        Commands::Config => println!("{config:#?}"),
    }

    Ok(())
}

async fn serve(config: AppConfig, port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let provider: Arc<dyn Provider> = match &config.lm.api_key {
        Some(api_key) => Arc::new(OpenAiCompatProvider::new(
            "openai-compat",
            config.lm.base_url.clone(),
            api_key.clone(),
        )),
        None => Arc::new(EchoProvider::new()),
    };
    info!(provider = provider.name(), "LM provider ready");

    let embedder: Arc<dyn Embedder> = if config.archive.embedding_model.starts_with("hash-embed") {
        Arc::new(HashEmbedder::new())
    } else {
        Arc::new(ProviderEmbedder::new(
            provider.clone(),
            config.archive.embedding_model.clone(),
            config.archive.embedding_dimensions,
        ))
    };

    if let Some(parent) = std::path::Path::new(&config.archive.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let archive: Arc<dyn Archive> = Arc::new(
        SqliteArchive::new(
            &config.archive.path,
            embedder.name(),
            embedder.dimensions(),
        )
        .await?,
    );

    let forest = Arc::new(Forest::new(config.buffer.max_turns));

    let options = OrchestratorOptions {
        model_primary: config.lm.model_primary.clone(),
        model_decomposition: config.lm.model_decomposition.clone(),
        temperature: config.lm.temperature,
        max_tokens: config.lm.max_tokens,
        lm_timeout: Duration::from_secs(config.lm.timeout_secs),
        index_timeout: Duration::from_secs(config.archive.index_timeout_secs),
        summarization_start_threshold: config.summarization.start_threshold,
        summarization_interval: config.summarization.interval,
        retrieval_window_seconds: config.retrieval.window_seconds,
        retrieval_top_k: config.retrieval.top_k,
        retrieval_top_k_per_subquery: config.retrieval.top_k_per_subquery,
        retrieval_enabled_default: config.retrieval.enabled_default,
        max_concurrency: config.lm.max_concurrency,
    };

    let orchestrator = ChatOrchestrator::new(forest, provider, archive, embedder, options);
    let state = Arc::new(AppState { orchestrator });

    let port = port.unwrap_or(config.gateway.port);
    canopy_gateway::serve(state, &config.gateway.host, port).await?;
    Ok(())
}
