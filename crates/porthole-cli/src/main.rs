//! Porthole CLI - expose local servers under a path-prefixed public URL

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use porthole_agent::{AgentConfig, TunnelAgent};
use porthole_relay::{RelayConfig, RelayServer};

/// Porthole - path-prefixed reverse tunnels
#[derive(Parser, Debug)]
#[command(name = "porthole")]
#[command(about = "Expose local servers through a path-prefixed relay", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public relay server
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:3001", env = "PORTHOLE_BIND")]
        bind: SocketAddr,
    },

    /// Expose a local port through a relay server
    Expose {
        /// Local port to expose
        #[arg(short, long)]
        port: u16,

        /// Relay tunnel endpoint (ws:// or wss://)
        #[arg(short, long, env = "PORTHOLE_RELAY")]
        relay: String,

        /// Public client identifier (the URL path prefix)
        #[arg(short, long)]
        id: String,

        /// Local host to forward to
        #[arg(long, default_value = "localhost")]
        host: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Serve { bind } => {
            let server = RelayServer::new(RelayConfig { bind_addr: bind });
            server.start().await.context("Relay server failed")?;
        }
        Commands::Expose {
            port,
            relay,
            id,
            host,
        } => {
            let mut config = AgentConfig::new(relay, id, port);
            config.local_host = host;
            let agent = TunnelAgent::new(config);
            agent.run().await.context("Tunnel ended")?;
        }
    }

    Ok(())
}

fn init_logging(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
