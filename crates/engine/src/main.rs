//! cpx-engine binary

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cpx_engine::{CpxServer, EngineConfig};

#[derive(Parser, Debug)]
#[command(name = "cpx-engine", about = "CPX call-center engine node")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address from the config.
    #[arg(short, long)]
    listen: Option<std::net::SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.general.listen_addr = listen;
    }

    info!("🚀 starting cpx-engine node {}", config.general.node);
    let server = CpxServer::new(config).await?;
    server.run().await?;
    Ok(())
}
