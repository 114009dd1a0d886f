//! Price oracle: latest known price per asset, read-only.

use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use crate::store::codec::CandleKey;
use crate::store::tables::CandlesTable;
use crate::store::{StoreError, TypedStore};

pub struct PriceOracle<'a> {
    store: &'a TypedStore,
}

impl<'a> PriceOracle<'a> {
    pub fn new(store: &'a TypedStore) -> Self {
        Self { store }
    }

    /// Latest close for one asset, or None if no candle exists.
    pub fn latest_price(&self, asset_id: Uuid) -> Result<Option<Decimal>, StoreError> {
        let last = self
            .store
            .last_in_prefix::<CandlesTable>(&CandleKey::asset_prefix(asset_id))?;
        Ok(last.map(|(_, candle)| candle.close))
    }

    /// Latest close for every asset with candle data, built from one scan of
    /// the candle table. Candles come back in (asset, timestamp) order, so
    /// the last row seen per asset is the most recent.
    pub fn latest_prices(&self) -> Result<HashMap<Uuid, Decimal>, StoreError> {
        let mut prices = HashMap::new();
        for (key, candle) in self.store.scan::<CandlesTable>()? {
            prices.insert(key.asset_id, candle.close);
        }
        Ok(prices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tables::CandleRecord;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn put_candle(store: &TypedStore, asset_id: Uuid, minutes_ago: i64, close: Decimal) {
        let timestamp = Utc::now() - Duration::minutes(minutes_ago);
        let record = CandleRecord {
            asset_id,
            timestamp,
            open: close,
            high: close,
            low: close,
            close,
            volume: Decimal::ZERO,
        };
        store
            .put::<CandlesTable>(&CandleKey::new(asset_id, timestamp), &record)
            .unwrap();
    }

    #[test]
    fn test_latest_price_picks_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = TypedStore::open(dir.path()).unwrap();
        let btc = Uuid::new_v4();

        put_candle(&store, btc, 10, dec!(41000));
        put_candle(&store, btc, 5, dec!(42000));
        put_candle(&store, btc, 20, dec!(40000));

        let oracle = PriceOracle::new(&store);
        assert_eq!(oracle.latest_price(btc).unwrap(), Some(dec!(42000)));
        assert_eq!(oracle.latest_price(Uuid::new_v4()).unwrap(), None);
    }

    #[test]
    fn test_latest_prices_covers_all_assets() {
        let dir = tempfile::tempdir().unwrap();
        let store = TypedStore::open(dir.path()).unwrap();
        let btc = Uuid::new_v4();
        let eth = Uuid::new_v4();

        put_candle(&store, btc, 10, dec!(41000));
        put_candle(&store, btc, 5, dec!(42000));
        put_candle(&store, eth, 5, dec!(2500));

        let oracle = PriceOracle::new(&store);
        let prices = oracle.latest_prices().unwrap();
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[&btc], dec!(42000));
        assert_eq!(prices[&eth], dec!(2500));
    }
}
