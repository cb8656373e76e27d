use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

mod api;
mod config;
mod middleware;

use config::{AppState, ConfigOverrides, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "dealgate")]
#[command(about = "JSON-RPC tool gateway for the Dealpath API", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "DEALGATE_CONFIG", default_value = "dealgate.toml")]
    config: PathBuf,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dealgate=info,tower_http=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Starting Dealgate");

    // Load configuration
    let config = ServerConfig::load(&args.config)?
        .with_overrides(args.overrides)
        .context("Invalid configuration")?;
    tracing::info!(
        strategy = %config.gateway.files.strategy,
        upstream = %config.gateway.upstream.base_url,
        token_required = config.auth.token.is_some(),
        "Configuration loaded"
    );

    let state = Arc::new(AppState::build(&config).await?);

    // Background maintenance
    let _reaper = state
        .sessions
        .clone()
        .spawn_reaper(config.gateway.sessions.sweep_interval());
    let _sweeper = state
        .delivery
        .clone()
        .spawn_sweeper(config.gateway.files.sweep_interval());

    // Start API server
    let addr = config.http.bind_addr();
    tracing::info!("Starting API server on {}", addr);

    api::serve(&addr, state).await?;

    Ok(())
}
