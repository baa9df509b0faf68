use anyhow::{Context, Result};
use clap::Parser;
use doipd_lib::{DoipServer, EntityIdentity, ServerConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// A DoIP (ISO 13400-2) entity with a UDS (ISO 14229-1) service handler.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the ECU identity file (YAML, or JSON with a .json extension).
    #[arg(short, long, default_value = "ecu.yaml")]
    config: PathBuf,

    /// UDP/TCP port to serve on.
    #[arg(short, long, default_value_t = doipd_lib::constants::DOIP_PORT)]
    port: u16,

    /// Interval between vehicle announcements, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    announce_interval_ms: u64,

    /// Maximum number of concurrently open diagnostic sockets.
    #[arg(long, default_value_t = doipd_lib::constants::MAX_CONCURRENT_SOCKETS)]
    max_sockets: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let identity = EntityIdentity::load(&cli.config)
        .with_context(|| format!("loading ECU identity from {}", cli.config.display()))?;
    info!(
        "ECU identity loaded: VIN {}, logical address 0x{:04X}",
        String::from_utf8_lossy(&identity.vin),
        identity.logical_address
    );

    let config = ServerConfig {
        port: cli.port,
        max_sockets: cli.max_sockets,
        announce_interval: Duration::from_millis(cli.announce_interval_ms),
        ..ServerConfig::default()
    };

    DoipServer::new(identity, config)
        .run()
        .await
        .context("DoIP server failed")?;
    Ok(())
}
