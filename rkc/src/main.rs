use clap::Parser;
use rkc::cli::{Cli, Commands};
use rkc::server::{serve, shutdown_signal};
use rkc::{LocalCluster, load_config};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Start { config } => {
            let cfg = load_config(config)?;
            let cluster = LocalCluster::new(&cfg)?;
            let listener = TcpListener::bind(&cfg.addr).await?;
            serve(listener, cluster.tunnel_router(), shutdown_signal()).await?;
            cluster.shutdown().await?;
        }
    }

    Ok(())
}
