use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use duet_session::config::DEFAULT_STUN_SERVER;
use duet_session::CallConfig;

mod app;

#[derive(Debug, Parser)]
#[command(
    name = "duet-call",
    author,
    version,
    about = "Place or answer a duet call. Type `call`, `hangup` or `quit`."
)]
struct Cli {
    /// Relay websocket url.
    #[arg(long, env = "DUET_RELAY_URL", default_value = "ws://127.0.0.1:8080")]
    relay_url: String,

    /// ICE server url; repeat the flag or comma-separate for several.
    #[arg(
        long = "ice-server",
        env = "DUET_ICE_SERVERS",
        value_delimiter = ',',
        default_value = DEFAULT_STUN_SERVER
    )]
    ice_servers: Vec<String>,

    /// Place a call as soon as the relay connection is up.
    #[arg(long, env = "DUET_AUTO_CALL", default_value_t = false)]
    auto_call: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    let cli = Cli::parse();
    let config = CallConfig::default().with_ice_servers(&cli.ice_servers);
    info!(
        relay_url = %cli.relay_url,
        ice_servers = ?config.ice_servers,
        "starting duet-call"
    );

    app::run(&cli.relay_url, config, cli.auto_call).await
}
