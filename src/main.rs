use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use scalpbot::config::AppConfig;
use scalpbot::engine::Engine;
use scalpbot::gateway::PaperGateway;

/// Paper margin balance for dry runs (USDT)
const PAPER_MARGIN: f64 = 10_000.0;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cfg = AppConfig::load()?;
    info!(config = %cfg, "starting scalpbot");

    if !cfg.bot.dry_run {
        bail!("only dry_run mode is supported; no live venue adapter is configured");
    }
    let gateway = Arc::new(PaperGateway::new(PAPER_MARGIN));

    let engine = Engine::start(cfg, gateway).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, closing positions");
    engine.shutdown().await;
    Ok(())
}
