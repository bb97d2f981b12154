use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use callcoach::config::Config;
use callcoach::gateway::{router, AppState};
use callcoach::transcription::ProviderRegistry;

#[derive(Parser)]
#[command(name = "callcoach", version, about = "Real-time sales-call coaching server")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "callcoach=debug"
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway server (default)
    Serve {
        /// Override the bind address from the config
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Show which transcription providers are configured and available
    CheckProviders,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log)),
        )
        .init();

    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("CALLCOACH_CONFIG").ok().map(PathBuf::from));
    let config = Config::load_or_default(config_path.as_deref())?;

    match cli.command {
        None | Some(Commands::Serve { bind: None }) => serve(config, None).await,
        Some(Commands::Serve { bind }) => serve(config, bind).await,
        Some(Commands::CheckProviders) => {
            check_providers(&config);
            Ok(())
        }
    }
}

async fn serve(config: Config, bind_override: Option<String>) -> Result<()> {
    let bind = bind_override.unwrap_or_else(|| config.server.bind.clone());
    let state = Arc::new(AppState::from_config(&config));

    if let Some(backend) = state.providers.selected_name() {
        tracing::info!(backend, "Transcription backend selected");
    }

    let app = router(state, &config.server.cors_origins);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    tracing::info!(%bind, version = env!("CARGO_PKG_VERSION"), "callcoach listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "Failed to install shutdown handler");
        return;
    }
    tracing::info!("Shutdown signal received");
}

fn check_providers(config: &Config) {
    let registry = ProviderRegistry::from_config(config);

    println!("Transcription providers (priority order):");
    for status in registry.status() {
        let state = if status.available { "available" } else { "not configured" };
        let extra = if status.diarization { ", diarization" } else { "" };
        println!("  {:<12} {}{}", status.name, state, extra);
    }
    match registry.selected_name() {
        Some(name) => println!("Selected: {name}"),
        None => println!("Selected: none"),
    }

    println!(
        "Inference: {}",
        if config.llm.api_key.is_some() {
            "configured"
        } else {
            "disabled (no API key; transcript-only mode)"
        }
    );
}
