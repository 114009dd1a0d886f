use anyhow::{anyhow, Result};
use clap::Args;
use std::sync::Arc;

use crate::agents::registry;
use crate::data_paths::DataPaths;
use crate::equity::EquityEngine;
use crate::store::TypedStore;

#[derive(Args, Clone)]
pub struct PerformanceArgs {
    /// Agent name
    pub agent: String,
}

pub struct PerformanceCommand {
    args: PerformanceArgs,
}

impl PerformanceCommand {
    pub fn new(args: PerformanceArgs) -> Self {
        Self { args }
    }

    pub async fn execute(&self, data_paths: DataPaths) -> Result<()> {
        let store = Arc::new(TypedStore::open(data_paths.db())?);
        let agent = registry::find_by_name(&store, &self.args.agent)?
            .ok_or_else(|| anyhow!("no agent named '{}'", self.args.agent))?;

        let engine = EquityEngine::new(store);
        let metrics = engine.calculate_performance(agent.id)?;

        println!("Performance for {} ({})", agent.name, agent.id);
        println!("  Initial value: ${:.2}", metrics.initial_value);
        println!("  Current value: ${:.2}", metrics.current_value);
        println!(
            "  Return:        ${:.2} ({:.2}%)",
            metrics.total_return, metrics.percent_return
        );
        println!("  Max drawdown:  {:.2}%", metrics.max_drawdown);
        println!(
            "  Trades:        {} total, {} winning, {} losing ({:.1}% win rate)",
            metrics.total_trades,
            metrics.winning_trades,
            metrics.losing_trades,
            metrics.win_rate,
        );

        Ok(())
    }
}
