//! Asset registry helpers.

use std::collections::HashMap;
use uuid::Uuid;

use crate::store::tables::{AssetsTable, MarketAssetRecord};
use crate::store::{StoreError, TypedStore};

/// All enabled assets, in symbol order.
pub fn enabled_assets(store: &TypedStore) -> Result<Vec<MarketAssetRecord>, StoreError> {
    Ok(store
        .scan::<AssetsTable>()?
        .into_iter()
        .map(|(_, asset)| asset)
        .filter(|asset| asset.enabled)
        .collect())
}

/// Look up an enabled asset by (case-insensitive) symbol.
pub fn find_enabled(
    store: &TypedStore,
    symbol: &str,
) -> Result<Option<MarketAssetRecord>, StoreError> {
    let normalized = symbol.to_uppercase();
    Ok(store
        .get::<AssetsTable>(&normalized)?
        .filter(|asset| asset.enabled))
}

/// Map of asset id to symbol, for rendering positions and trades.
pub fn symbol_lookup(store: &TypedStore) -> Result<HashMap<Uuid, String>, StoreError> {
    Ok(store
        .scan::<AssetsTable>()?
        .into_iter()
        .map(|(_, asset)| (asset.id, asset.symbol))
        .collect())
}

/// Seed the default asset universe. Existing symbols are left untouched.
/// Returns how many assets were created.
pub fn seed_default_assets(store: &TypedStore) -> Result<usize, StoreError> {
    let defaults = [
        ("BTC", "Bitcoin", "bitcoin"),
        ("ETH", "Ethereum", "ethereum"),
    ];

    let mut created = 0;
    for (symbol, name, external_id) in defaults {
        if store.exists::<AssetsTable>(&symbol.to_string())? {
            continue;
        }
        let record = MarketAssetRecord {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            name: name.to_string(),
            quote_currency: "USD".to_string(),
            external_id: external_id.to_string(),
            enabled: true,
        };
        store.put::<AssetsTable>(&record.symbol, &record)?;
        created += 1;
    }

    Ok(created)
}
