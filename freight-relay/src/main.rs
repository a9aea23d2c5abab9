use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// WebSocket-based signaling relay for freight endpoints.
#[derive(Debug, Parser)]
#[command(name = "freight-relay")]
struct Args {
    /// Host to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8765)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (FREIGHT_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("FREIGHT_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("freight_relay=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let args = Args::parse();
    let (addr, handle) = freight_relay::server::start(&format!("{}:{}", args.host, args.port)).await?;
    tracing::info!("serving signaling relay on {addr}");
    handle.await?;
    Ok(())
}
