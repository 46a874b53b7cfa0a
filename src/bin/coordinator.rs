#[macro_use]
extern crate log;

use std::{num::NonZeroUsize, process, sync::Arc};

use clap::Parser;
use tokio::signal::ctrl_c;

use round_coordinator::{
    aggregator::AggregatorClient,
    coordinator::Coordinator,
    settings::Settings,
    storage::FsStore,
};

#[derive(Debug, Parser)]
#[command(name = "coordinator", version, about = "Federated learning round coordinator")]
struct Args {
    /// Number of models aggregated per round
    cohort_size: NonZeroUsize,

    /// Path to the config file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let settings = Settings::new(args.config.as_deref()).unwrap_or_else(|err| {
        eprintln!("Problem parsing configuration file: {}", err);
        process::exit(1);
    });
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.logging.filter.as_str()),
    )
    .init();

    if let Err(e) = _main(settings, args.cohort_size).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn _main(settings: Settings, cohort_size: NonZeroUsize) -> anyhow::Result<()> {
    let store = Arc::new(FsStore::new(&settings.storage));
    let aggregator = Arc::new(AggregatorClient::new(&settings.aggregator));
    let coordinator = Coordinator::bind(&settings, cohort_size, store, aggregator).await?;

    tokio::select! {
        _ = coordinator.run() => {
            info!("shutting down: coordinator terminated");
        }
        result = ctrl_c() => {
            match result {
                Ok(()) => info!("shutting down: received SIGINT"),
                Err(e) => error!("shutting down: error while waiting for SIGINT: {}", e),
            }
        }
    }
    Ok(())
}
