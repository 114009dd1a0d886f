use anyhow::Result;
use clap::Args;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::agents::decision::DecisionSources;
use crate::config::AppConfig;
use crate::data_paths::DataPaths;
use crate::equity::EquityEngine;
use crate::markets::{assets, MarketDataClient};
use crate::orchestrator::{CycleScheduler, InstanceStore, MarketCycle};
use crate::portfolio::PortfolioLedger;
use crate::store::TypedStore;

#[derive(Args, Clone)]
pub struct RunArgs {
    /// Log to file only (no console output)
    #[arg(long)]
    pub quiet: bool,
}

pub struct RunCommand {
    #[allow(dead_code)]
    args: RunArgs,
}

impl RunCommand {
    pub fn new(args: RunArgs) -> Self {
        Self { args }
    }

    /// Run the market-cycle scheduler until Ctrl-C.
    pub async fn execute(&self, data_paths: DataPaths) -> Result<()> {
        let config = AppConfig::from_env();
        let store = Arc::new(TypedStore::open(data_paths.db())?);

        if assets::enabled_assets(&store)?.is_empty() {
            warn!("No assets configured. Run `racebot seed` first.");
        }

        let market_client = Arc::new(MarketDataClient::new(config.market_data.clone())?);
        let ledger = Arc::new(PortfolioLedger::new(store.clone()));
        let equity = Arc::new(EquityEngine::new(store.clone()));
        let sources = Arc::new(DecisionSources::new(config.decision_endpoint.clone())?);
        let instances = Arc::new(InstanceStore::new(store.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let cycle = Arc::new(MarketCycle::new(
            store,
            config.clone(),
            market_client,
            ledger,
            equity,
            sources,
            shutdown_rx.clone(),
        ));

        let scheduler = CycleScheduler::new(cycle, instances, config.cycle, shutdown_rx);
        let scheduler_handle = tokio::spawn(scheduler.run());

        info!("Scheduler running. Press Ctrl-C to stop.");
        tokio::signal::ctrl_c().await?;

        info!("Shutdown requested, stopping scheduler");
        let _ = shutdown_tx.send(true);
        scheduler_handle.await?;

        Ok(())
    }
}
