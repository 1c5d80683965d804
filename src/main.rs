use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use stagegate::{router, AppState};
use stagegate_config::Config;
use tracing::info;

/// Orchestration and gate-evaluation daemon for HITL validation pipelines.
#[derive(Parser, Debug)]
#[command(name = "stagegate", version, about)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured bind address.
    #[arg(long)]
    bind: Option<String>,

    /// Verbose structured logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    stagegate::logging::init_tracing(cli.verbose)
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    let bind = cli.bind.clone().unwrap_or_else(|| config.server.bind.clone());

    let state = AppState::from_config(&config);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(addr = %bind, "stagegate listening");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
