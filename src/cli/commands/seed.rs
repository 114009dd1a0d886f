use anyhow::Result;
use clap::Args;

use crate::agents::registry;
use crate::data_paths::DataPaths;
use crate::markets::assets;
use crate::store::TypedStore;

#[derive(Args, Clone)]
pub struct SeedArgs {}

pub struct SeedCommand {
    #[allow(dead_code)]
    args: SeedArgs,
}

impl SeedCommand {
    pub fn new(args: SeedArgs) -> Self {
        Self { args }
    }

    /// Seed the default assets and agent roster. Safe to re-run.
    pub async fn execute(&self, data_paths: DataPaths) -> Result<()> {
        let store = TypedStore::open(data_paths.db())?;

        let assets_created = assets::seed_default_assets(&store)?;
        let agents_created = registry::seed_default_agents(&store)?;

        println!("Seeded {assets_created} assets and {agents_created} agents");
        Ok(())
    }
}
