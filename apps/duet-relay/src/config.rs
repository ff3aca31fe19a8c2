use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

pub const DEFAULT_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// Frames buffered per connection before the relay gives up on it.
    pub channel_depth: usize,
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            channel_depth: DEFAULT_CHANNEL_DEPTH,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "duet-relay",
    author,
    version,
    about = "Broadcast relay for duet call signaling"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "DUET_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Outbound frames buffered per connection; a peer that falls this far
    /// behind is disconnected.
    #[arg(long, env = "DUET_RELAY_CHANNEL_DEPTH", default_value_t = DEFAULT_CHANNEL_DEPTH)]
    pub channel_depth: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "DUET_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.channel_depth == 0 {
            bail!("channel depth must be at least 1");
        }
        Ok(RelayConfig {
            listen_addr,
            channel_depth: cli.channel_depth,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
