use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use duet_relay::telemetry::Telemetry;
use duet_relay::{Cli, RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        channel_depth = config.channel_depth,
        "starting duet-relay"
    );

    let server = RelayServer::bind(&config, Some(telemetry.metrics_handle()))
        .await
        .context("failed to bind listener")?;
    server
        .run_until(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
