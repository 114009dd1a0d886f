use anyhow::Result;
use clap::Args;

use crate::config::MarketDataConfig;
use crate::data_paths::DataPaths;
use crate::markets::{IngestionService, MarketDataClient};
use crate::store::TypedStore;

#[derive(Args, Clone)]
pub struct IngestArgs {
    /// Ingest a single asset symbol instead of all enabled assets
    #[arg(long)]
    pub symbol: Option<String>,
}

pub struct IngestCommand {
    args: IngestArgs,
}

impl IngestCommand {
    pub fn new(args: IngestArgs) -> Self {
        Self { args }
    }

    /// One-shot candle ingestion, outside any cycle.
    pub async fn execute(&self, data_paths: DataPaths) -> Result<()> {
        let store = TypedStore::open(data_paths.db())?;
        let client = MarketDataClient::new(MarketDataConfig::from_env())?;
        let service = IngestionService::new(&store, &client);

        match &self.args.symbol {
            Some(symbol) => {
                let inserted = service.ingest_symbol(symbol).await?;
                println!("Inserted {inserted} candles for {}", symbol.to_uppercase());
            }
            None => {
                let result = service.ingest_all().await?;
                println!(
                    "Inserted {} candles across {} priced assets",
                    result.inserted,
                    result.prices.len()
                );
            }
        }

        Ok(())
    }
}
