use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use freight_endpoint::commands;
use freight_sdk::config;

/// Freight endpoint: local object store plus peer fabric.
#[derive(Debug, Parser)]
#[command(name = "freight-endpoint")]
struct Cli {
    /// Freight home directory (default: ~/.freight).
    #[arg(long, global = true, value_name = "DIR")]
    freight_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Configure a new endpoint.
    Configure {
        name: String,
        /// HTTP gateway port.
        #[arg(long, default_value_t = 8770)]
        port: u16,
        /// Peer data-channel port (0 = OS-assigned per start).
        #[arg(long, default_value_t = 0)]
        peer_port: u16,
        /// Signaling relay address (host:port).
        #[arg(long)]
        relay: Option<String>,
    },
    /// List configured endpoints.
    List,
    /// Remove a stopped endpoint.
    Remove { name: String },
    /// Start an endpoint.
    Start {
        name: String,
        /// Run in the background as a detached process.
        #[arg(long)]
        detach: bool,
    },
    /// Stop a running endpoint.
    Stop { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (FREIGHT_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("FREIGHT_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("freight_endpoint=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let cli = Cli::parse();
    let freight_dir = cli.freight_dir.unwrap_or_else(config::home_dir);

    match cli.command {
        Commands::Configure {
            name,
            port,
            peer_port,
            relay,
        } => {
            commands::configure_endpoint(&name, port, peer_port, relay, &freight_dir)?;
        }
        Commands::List => commands::list_endpoints(&freight_dir)?,
        Commands::Remove { name } => commands::remove_endpoint(&name, &freight_dir)?,
        Commands::Start { name, detach } => {
            commands::start_endpoint(&name, detach, &freight_dir).await?;
        }
        Commands::Stop { name } => commands::stop_endpoint(&name, &freight_dir)?,
    }
    Ok(())
}
