//! `photon start` - run the broker until interrupted.

use crate::broker::Broker;
use crate::cli::args::StartArgs;
use crate::core::config::BrokerConfig;
use anyhow::Result;
use tracing::info;

pub async fn run_start(args: StartArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => BrokerConfig::from_path(path)?,
        None => BrokerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let handle = Broker::new(config).start().await?;
    info!("photon broker running on {}", handle.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown();
    Ok(())
}
