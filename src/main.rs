//! Photon - unified CLI entrypoint.
//!
//! Usage:
//!   photon start --config photon.toml
//!   photon subscribe --topic 'sensors/#'
//!   photon publish --topic sensors/temp --message 21.5

use anyhow::Result;
use clap::Parser;
use photon::cli::commands::{run_publish, run_start, run_subscribe};
use photon::cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Subscribe(args) => run_subscribe(args).await,
        Commands::Publish(args) => run_publish(args).await,
    }
}
