//! Builds the context an agent decides on: portfolio state plus recent
//! market candles for every enabled asset.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::markets::assets;
use crate::portfolio::ledger::LedgerError;
use crate::portfolio::{PortfolioLedger, PortfolioState};
use crate::store::codec::CandleKey;
use crate::store::tables::CandlesTable;
use crate::store::{StoreError, TypedStore};

/// Candles included per asset by default. Enough history for a short-term
/// signal without flooding the decision endpoint.
pub const DEFAULT_CANDLE_COUNT: usize = 24;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("agent {0} not found")]
    AgentNotFound(Uuid),

    #[error("agent {0} is not active")]
    AgentInactive(Uuid),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// One candle as shipped to a decision source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleView {
    pub asset_symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Everything a decision source sees for one agent.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub agent_id: Uuid,
    pub agent_name: String,
    pub instructions: String,
    pub portfolio: PortfolioState,
    /// Most recent candles first, across all enabled assets.
    pub recent_candles: Vec<CandleView>,
}

pub struct ContextBuilder {
    store: Arc<TypedStore>,
    ledger: Arc<PortfolioLedger>,
}

impl ContextBuilder {
    pub fn new(store: Arc<TypedStore>, ledger: Arc<PortfolioLedger>) -> Self {
        Self { store, ledger }
    }

    pub fn build(
        &self,
        agent_id: Uuid,
        candle_count: usize,
    ) -> Result<AgentContext, ContextError> {
        let agent = self
            .store
            .get::<crate::store::tables::AgentsTable>(&agent_id)?
            .ok_or(ContextError::AgentNotFound(agent_id))?;
        if !agent.active {
            return Err(ContextError::AgentInactive(agent_id));
        }

        let portfolio = self.ledger.get_portfolio(agent_id)?;
        let recent_candles = self.recent_candles(candle_count)?;

        debug!(
            %agent_id,
            total_value = %portfolio.total_value,
            positions = portfolio.positions.len(),
            candles = recent_candles.len(),
            "Built agent context"
        );

        Ok(AgentContext {
            agent_id,
            agent_name: agent.name,
            instructions: agent.instructions,
            portfolio,
            recent_candles,
        })
    }

    /// The last `limit` candles of every enabled asset, merged and ordered
    /// most recent first.
    fn recent_candles(&self, limit: usize) -> Result<Vec<CandleView>, StoreError> {
        let mut all = Vec::new();

        for asset in assets::enabled_assets(&self.store)? {
            let candles = self
                .store
                .scan_prefix::<CandlesTable>(&CandleKey::asset_prefix(asset.id))?;
            let start = candles.len().saturating_sub(limit);
            for (_, candle) in &candles[start..] {
                all.push(CandleView {
                    asset_symbol: asset.symbol.clone(),
                    timestamp: candle.timestamp,
                    open: candle.open,
                    high: candle.high,
                    low: candle.low,
                    close: candle.close,
                    volume: candle.volume,
                });
            }
        }

        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::decision::DecisionSourceKind;
    use crate::agents::registry;
    use crate::store::tables::CandleRecord;
    use rust_decimal_macros::dec;

    fn setup() -> (Arc<TypedStore>, ContextBuilder, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TypedStore::open(dir.path()).unwrap());
        assets::seed_default_assets(&store).unwrap();
        let ledger = Arc::new(PortfolioLedger::new(store.clone()));
        let builder = ContextBuilder::new(store.clone(), ledger);
        (store, builder, dir)
    }

    fn put_candle(store: &TypedStore, symbol: &str, minutes_ago: i64, close: Decimal) {
        let asset = assets::find_enabled(store, symbol).unwrap().unwrap();
        let timestamp = Utc::now() - chrono::Duration::minutes(minutes_ago);
        let record = CandleRecord {
            asset_id: asset.id,
            timestamp,
            open: close,
            high: close,
            low: close,
            close,
            volume: Decimal::ZERO,
        };
        store
            .put::<CandlesTable>(&CandleKey::new(asset.id, timestamp), &record)
            .unwrap();
    }

    #[test]
    fn test_context_has_portfolio_and_candles_newest_first() {
        let (store, builder, _dir) = setup();
        let agent =
            registry::create_agent(&store, "alpha", "", "trade well", DecisionSourceKind::Mock)
                .unwrap();

        put_candle(&store, "BTC", 15, dec!(41000));
        put_candle(&store, "BTC", 5, dec!(42000));
        put_candle(&store, "ETH", 10, dec!(2500));

        let context = builder.build(agent.id, DEFAULT_CANDLE_COUNT).unwrap();

        assert_eq!(context.agent_name, "alpha");
        assert_eq!(context.instructions, "trade well");
        assert_eq!(context.portfolio.cash, dec!(100000));
        assert_eq!(context.recent_candles.len(), 3);
        assert!(context
            .recent_candles
            .windows(2)
            .all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[test]
    fn test_candle_limit_applies_per_asset() {
        let (store, builder, _dir) = setup();
        let agent =
            registry::create_agent(&store, "alpha", "", "", DecisionSourceKind::Mock).unwrap();

        for i in 0..10 {
            put_candle(&store, "BTC", i * 5, dec!(42000));
        }

        let context = builder.build(agent.id, 4).unwrap();
        assert_eq!(context.recent_candles.len(), 4);
    }

    #[test]
    fn test_unknown_or_inactive_agent_errors() {
        let (store, builder, _dir) = setup();

        let missing = builder.build(Uuid::new_v4(), 4);
        assert!(matches!(missing, Err(ContextError::AgentNotFound(_))));

        let agent =
            registry::create_agent(&store, "dormant", "", "", DecisionSourceKind::Mock).unwrap();
        registry::set_active(&store, agent.id, false).unwrap();
        let inactive = builder.build(agent.id, 4);
        assert!(matches!(inactive, Err(ContextError::AgentInactive(_))));
    }
}
