//! `nepenthe-server`: runs a server from a JSON configuration file until Ctrl-C.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use nepenthe::config::ServerConfig;
use nepenthe::{logging, NepentheServer};

#[derive(Parser, Debug)]
#[command(name = "nepenthe-server")]
#[command(about = "GDTMP-compatible multiplayer server")]
#[command(version)]
struct Args {
    /// Configuration file path. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level used when RUST_LOG is unset
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level, args.json_logs).context("failed to initialise logging")?;

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_path(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(port) = args.port {
        config.origin.port = port;
    }

    let server = NepentheServer::builder().config(config).build();
    let addr = server.start().await?;
    tracing::info!(%addr, "press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    server.stop().await;
    Ok(())
}
