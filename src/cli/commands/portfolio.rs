use anyhow::{anyhow, Result};
use clap::Args;
use std::sync::Arc;

use crate::agents::registry;
use crate::data_paths::DataPaths;
use crate::portfolio::PortfolioLedger;
use crate::store::TypedStore;

#[derive(Args, Clone)]
pub struct PortfolioArgs {
    /// Agent name
    pub agent: String,
}

pub struct PortfolioCommand {
    args: PortfolioArgs,
}

impl PortfolioCommand {
    pub fn new(args: PortfolioArgs) -> Self {
        Self { args }
    }

    pub async fn execute(&self, data_paths: DataPaths) -> Result<()> {
        let store = Arc::new(TypedStore::open(data_paths.db())?);
        let agent = registry::find_by_name(&store, &self.args.agent)?
            .ok_or_else(|| anyhow!("no agent named '{}'", self.args.agent))?;

        let ledger = PortfolioLedger::new(store);
        let state = ledger.get_portfolio(agent.id)?;

        println!("Portfolio for {} ({})", agent.name, agent.id);
        println!("  Cash:        {:>14}", format!("${:.2}", state.cash));
        println!(
            "  Positions:   {:>14}",
            format!("${:.2}", state.positions_value())
        );
        println!(
            "  Total value: {:>14}",
            format!("${:.2}", state.total_value)
        );
        println!(
            "  Unrealized:  {:>14}",
            format!("${:.2}", state.unrealized_pnl())
        );

        if !state.positions.is_empty() {
            println!();
            println!(
                "  {:<8} {:>14} {:>14} {:>14}",
                "Asset", "Quantity", "Avg entry", "Price"
            );
            for position in &state.positions {
                println!(
                    "  {:<8} {:>14} {:>14} {:>14}",
                    position.asset_symbol,
                    position.quantity,
                    format!("${:.2}", position.avg_entry_price),
                    format!("${:.2}", position.current_price),
                );
            }
        }

        Ok(())
    }
}
