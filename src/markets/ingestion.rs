//! Market-data ingestion: pull candles from the external feed, dedup
//! against stored rows, persist the remainder.

use std::collections::HashMap;

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::markets::assets;
use crate::markets::client::{MarketDataClient, MarketDataError};
use crate::markets::oracle::PriceOracle;
use crate::store::codec::CandleKey;
use crate::store::tables::{CandleRecord, CandlesTable, MarketAssetRecord};
use crate::store::{StoreError, TypedStore};

/// Pause between per-asset feed requests, to stay inside free-tier rate
/// limits.
const PER_ASSET_DELAY: Duration = Duration::from_millis(2500);

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("market data fetch failed: {0}")]
    Fetch(#[from] MarketDataError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of one ingestion pass.
#[derive(Debug, Clone)]
pub struct IngestionResult {
    /// Newly inserted candle count across all assets.
    pub inserted: usize,
    /// Latest close per asset symbol, observed after the pass.
    pub prices: HashMap<String, Decimal>,
}

pub struct IngestionService<'a> {
    store: &'a TypedStore,
    client: &'a MarketDataClient,
}

impl<'a> IngestionService<'a> {
    pub fn new(store: &'a TypedStore, client: &'a MarketDataClient) -> Self {
        Self { store, client }
    }

    /// Ingest the latest candles for every enabled asset.
    ///
    /// Feed errors propagate: ingestion is a hard dependency of the market
    /// cycle, and a failed pass must fail the cycle rather than advance it
    /// on stale data. An asset with an empty response is only a warning.
    pub async fn ingest_all(&self) -> Result<IngestionResult, IngestionError> {
        let assets = assets::enabled_assets(self.store)?;
        info!(asset_count = assets.len(), "Starting ingestion pass");

        let mut inserted = 0;
        for (idx, asset) in assets.iter().enumerate() {
            if asset.external_id.is_empty() {
                warn!(symbol = %asset.symbol, "Asset has no external feed id, skipping");
                continue;
            }

            inserted += self.ingest_asset(asset).await?;

            if idx + 1 < assets.len() {
                sleep(PER_ASSET_DELAY).await;
            }
        }

        let prices = self.latest_prices_by_symbol(&assets)?;

        info!(
            inserted,
            priced_assets = prices.len(),
            "Ingestion pass complete"
        );

        Ok(IngestionResult { inserted, prices })
    }

    /// Ingest one asset by symbol. Returns the inserted candle count.
    pub async fn ingest_symbol(&self, symbol: &str) -> Result<usize, IngestionError> {
        match assets::find_enabled(self.store, symbol)? {
            Some(asset) if !asset.external_id.is_empty() => self.ingest_asset(&asset).await,
            Some(asset) => {
                warn!(symbol = %asset.symbol, "Asset has no external feed id");
                Ok(0)
            }
            None => {
                warn!(symbol, "Asset not found or not enabled");
                Ok(0)
            }
        }
    }

    async fn ingest_asset(&self, asset: &MarketAssetRecord) -> Result<usize, IngestionError> {
        let candles = self
            .client
            .fetch_ohlc(&asset.external_id, &asset.quote_currency)
            .await?;

        if candles.is_empty() {
            warn!(symbol = %asset.symbol, "Feed returned no candles");
            return Ok(0);
        }

        // Dedup on (asset, timestamp) before writing.
        let mut fresh = Vec::new();
        for candle in &candles {
            let key = CandleKey::new(asset.id, candle.timestamp);
            if !self.store.exists::<CandlesTable>(&key)? {
                fresh.push((key, candle));
            }
        }

        if fresh.is_empty() {
            debug!(
                symbol = %asset.symbol,
                skipped = candles.len(),
                "No new candles"
            );
            return Ok(0);
        }

        let inserted = fresh.len();
        self.store.batch_write(|batch| {
            for (key, candle) in &fresh {
                let record = CandleRecord {
                    asset_id: asset.id,
                    timestamp: candle.timestamp,
                    open: candle.open,
                    high: candle.high,
                    low: candle.low,
                    close: candle.close,
                    // The OHLC endpoint carries no volume.
                    volume: Decimal::ZERO,
                };
                batch.put::<CandlesTable>(key, &record)?;
            }
            Ok(())
        })?;

        info!(
            symbol = %asset.symbol,
            inserted,
            skipped = candles.len() - inserted,
            "Inserted candles"
        );

        Ok(inserted)
    }

    fn latest_prices_by_symbol(
        &self,
        assets: &[MarketAssetRecord],
    ) -> Result<HashMap<String, Decimal>, StoreError> {
        let by_id = PriceOracle::new(self.store).latest_prices()?;
        Ok(assets
            .iter()
            .filter_map(|asset| {
                by_id
                    .get(&asset.id)
                    .map(|price| (asset.symbol.clone(), *price))
            })
            .collect())
    }
}
