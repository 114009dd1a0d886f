use anyhow::Result;
use clap::Args;

use crate::data_paths::DataPaths;
use crate::store::tables::AgentsTable;
use crate::store::TypedStore;

#[derive(Args, Clone)]
pub struct AgentsArgs {}

pub struct AgentsCommand {
    #[allow(dead_code)]
    args: AgentsArgs,
}

impl AgentsCommand {
    pub fn new(args: AgentsArgs) -> Self {
        Self { args }
    }

    /// List every registered agent.
    pub async fn execute(&self, data_paths: DataPaths) -> Result<()> {
        let store = TypedStore::open(data_paths.db())?;
        let agents = store.scan::<AgentsTable>()?;

        if agents.is_empty() {
            println!("No agents registered. Run `racebot seed` first.");
            return Ok(());
        }

        println!("{:<12} {:<12} {:<8} Strategy", "Name", "Source", "Active");
        for (_, agent) in agents {
            println!(
                "{:<12} {:<12} {:<8} {}",
                agent.name,
                format!("{:?}", agent.source),
                agent.active,
                agent.strategy,
            );
        }

        Ok(())
    }
}
