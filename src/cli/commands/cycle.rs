use anyhow::Result;
use chrono::Utc;
use clap::Args;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::agents::decision::DecisionSources;
use crate::config::AppConfig;
use crate::data_paths::DataPaths;
use crate::equity::EquityEngine;
use crate::markets::MarketDataClient;
use crate::orchestrator::scheduler::run_instance;
use crate::orchestrator::{instance, InstanceStore, MarketCycle};
use crate::portfolio::PortfolioLedger;
use crate::store::tables::{CycleInstanceRecord, CycleStatus};
use crate::store::TypedStore;

#[derive(Args, Clone)]
pub struct CycleArgs {}

pub struct CycleCommand {
    #[allow(dead_code)]
    args: CycleArgs,
}

impl CycleCommand {
    pub fn new(args: CycleArgs) -> Self {
        Self { args }
    }

    /// Trigger one market cycle manually, outside the scheduled cadence.
    pub async fn execute(&self, data_paths: DataPaths) -> Result<()> {
        let config = AppConfig::from_env();
        let store = Arc::new(TypedStore::open(data_paths.db())?);

        let market_client = Arc::new(MarketDataClient::new(config.market_data.clone())?);
        let ledger = Arc::new(PortfolioLedger::new(store.clone()));
        let equity = Arc::new(EquityEngine::new(store.clone()));
        let sources = Arc::new(DecisionSources::new(config.decision_endpoint.clone())?);
        let instances = Arc::new(InstanceStore::new(store.clone()));

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let cycle = Arc::new(MarketCycle::new(
            store,
            config,
            market_client,
            ledger,
            equity,
            sources,
            shutdown_rx,
        ));

        let now = Utc::now();
        let key = instance::manual_key(now);
        if instances.try_begin(&key).await?.is_none() {
            println!("Instance {key} is already in flight");
            return Ok(());
        }

        println!("Instance: {key}");
        info!(key, "Running manual market cycle");

        run_instance(cycle, instances.clone(), key.clone(), now).await;

        match instances.get(&key)? {
            Some(CycleInstanceRecord {
                status: CycleStatus::Completed,
                summary: Some(summary),
                ..
            }) => {
                println!(
                    "Cycle completed in {}ms: {} snapshots, decision cycle: {}, \
                     agents run: {} ({} failed), trades executed: {}",
                    summary.duration_ms,
                    summary.snapshot_count,
                    summary.decision_cycle,
                    summary.agents_run,
                    summary.agents_failed,
                    summary.trades_executed,
                );
            }
            Some(record) => {
                println!(
                    "Cycle {} with status {:?}: {}",
                    key,
                    record.status,
                    record.error.unwrap_or_else(|| "no error recorded".into()),
                );
            }
            None => println!("Instance record for {key} disappeared"),
        }

        Ok(())
    }
}
