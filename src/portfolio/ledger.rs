//! Portfolio ledger: applies an agent's order batch atomically.
//!
//! Every effect of one `apply_decision` call (cash, positions, trades and
//! the post-trade equity snapshot) is staged into a single RocksDB write
//! batch, so either the whole order batch commits or none of it does.
//! Order-level failures therefore roll back every earlier order in the
//! same decision; there are no partial fills.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::markets::assets;
use crate::markets::oracle::PriceOracle;
use crate::portfolio::types::{
    PortfolioState, PositionView, TradeOrder, TradeSide, DEFAULT_STARTING_CASH,
};
use crate::store::codec::{PairKey, SeriesKey};
use crate::store::tables::{
    EquitySnapshotRecord, PortfolioRecord, PortfoliosTable, PositionRecord, PositionsTable,
    SnapshotsTable, TradeRecord, TradesTable,
};
use crate::store::{StoreError, TypedStore};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("asset '{0}' is not enabled or does not exist")]
    UnknownAsset(String),

    #[error("no price available for {0}; provide a limit price or ingest market data first")]
    NoPriceAvailable(String),

    #[error("insufficient cash ({available}) to buy {quantity} {symbol} at {price}")]
    InsufficientCash {
        symbol: String,
        quantity: Decimal,
        price: Decimal,
        available: Decimal,
    },

    #[error("cannot sell {quantity} {symbol} without sufficient holdings (held: {held})")]
    InsufficientHoldings {
        symbol: String,
        quantity: Decimal,
        held: Decimal,
    },

    #[error("order quantity must be positive for {0}")]
    InvalidOrder(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Get the portfolio record for an agent, creating it with the default
/// starting cash on first access. The single insert is idempotent under the
/// agent-id key and needs no wider transaction.
pub(crate) fn get_or_create_record(
    store: &TypedStore,
    agent_id: Uuid,
) -> Result<PortfolioRecord, StoreError> {
    if let Some(existing) = store.get::<PortfoliosTable>(&agent_id)? {
        return Ok(existing);
    }

    let record = PortfolioRecord {
        id: Uuid::new_v4(),
        agent_id,
        cash: DEFAULT_STARTING_CASH,
        base_currency: "USD".to_string(),
    };
    store.put::<PortfoliosTable>(&agent_id, &record)?;

    info!(%agent_id, cash = %record.cash, "Created portfolio with default starting cash");

    Ok(record)
}

pub struct PortfolioLedger {
    store: Arc<TypedStore>,
    /// Serializes concurrent `apply_decision` calls for the same agent.
    /// Different agents proceed in parallel.
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl PortfolioLedger {
    pub fn new(store: Arc<TypedStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    fn agent_lock(&self, agent_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(agent_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Current valued state of the agent's portfolio, creating it lazily.
    pub fn get_portfolio(&self, agent_id: Uuid) -> Result<PortfolioState, LedgerError> {
        let record = get_or_create_record(&self.store, agent_id)?;
        let positions = self.load_positions(record.id)?;
        Ok(self.build_state(&record, &positions)?)
    }

    /// Apply an agent's orders in input order under one atomic write.
    ///
    /// Returns the new portfolio state and the ids of the created trades,
    /// for correlation with an external audit record.
    pub async fn apply_decision(
        &self,
        agent_id: Uuid,
        orders: &[TradeOrder],
    ) -> Result<(PortfolioState, Vec<Uuid>), LedgerError> {
        let lock = self.agent_lock(agent_id);
        let _guard = lock.lock().await;

        let mut portfolio = get_or_create_record(&self.store, agent_id)?;
        let mut positions = self.load_positions(portfolio.id)?;

        let oracle = PriceOracle::new(&self.store);
        let now = Utc::now();
        let mut cash = portfolio.cash;
        let mut trades: Vec<TradeRecord> = Vec::new();
        let mut removed_assets: Vec<Uuid> = Vec::new();

        for order in orders {
            match order.side {
                TradeSide::Buy | TradeSide::Sell => {
                    if order.quantity <= Decimal::ZERO {
                        return Err(LedgerError::InvalidOrder(order.asset_symbol.clone()));
                    }
                }
                // Hold never mutates state or records a trade.
                TradeSide::Hold => continue,
            }

            let symbol = order.asset_symbol.to_uppercase();
            let asset = assets::find_enabled(&self.store, &symbol)?
                .ok_or_else(|| LedgerError::UnknownAsset(symbol.clone()))?;

            let price = match order.limit_price {
                Some(limit) if limit > Decimal::ZERO => limit,
                _ => oracle
                    .latest_price(asset.id)?
                    .ok_or_else(|| LedgerError::NoPriceAvailable(symbol.clone()))?,
            };
            let notional = order.quantity * price;

            match order.side {
                TradeSide::Buy => {
                    if notional > cash {
                        return Err(LedgerError::InsufficientCash {
                            symbol,
                            quantity: order.quantity,
                            price,
                            available: cash,
                        });
                    }

                    cash -= notional;

                    let position = positions.entry(asset.id).or_insert_with(|| PositionRecord {
                        portfolio_id: portfolio.id,
                        asset_id: asset.id,
                        quantity: Decimal::ZERO,
                        avg_entry_price: Decimal::ZERO,
                    });
                    position.avg_entry_price =
                        blended_entry_price(position, notional, order.quantity);
                    position.quantity += order.quantity;
                    removed_assets.retain(|id| *id != asset.id);

                    trades.push(TradeRecord {
                        id: Uuid::new_v4(),
                        portfolio_id: portfolio.id,
                        asset_id: asset.id,
                        side: TradeSide::Buy,
                        quantity: order.quantity,
                        price,
                        executed_at: now,
                    });
                }
                TradeSide::Sell => {
                    let held = positions
                        .get(&asset.id)
                        .map(|p| p.quantity)
                        .unwrap_or(Decimal::ZERO);
                    if held < order.quantity {
                        return Err(LedgerError::InsufficientHoldings {
                            symbol,
                            quantity: order.quantity,
                            held,
                        });
                    }

                    cash += notional;

                    let depleted = if let Some(position) = positions.get_mut(&asset.id) {
                        // Average entry price is not recalculated on sells.
                        position.quantity -= order.quantity;
                        position.quantity.is_zero()
                    } else {
                        false
                    };
                    if depleted {
                        positions.remove(&asset.id);
                        removed_assets.push(asset.id);
                    }

                    trades.push(TradeRecord {
                        id: Uuid::new_v4(),
                        portfolio_id: portfolio.id,
                        asset_id: asset.id,
                        side: TradeSide::Sell,
                        quantity: order.quantity,
                        price,
                        executed_at: now,
                    });
                }
                TradeSide::Hold => unreachable!("hold orders skipped above"),
            }
        }

        portfolio.cash = cash;

        // Value the post-trade portfolio and stage the snapshot alongside
        // the mutations, so state and snapshot commit together.
        let state = self.build_state(&portfolio, &positions)?;
        let snapshot = EquitySnapshotRecord {
            id: Uuid::new_v4(),
            portfolio_id: portfolio.id,
            captured_at: state.as_of,
            total_value: state.total_value,
            cash_value: portfolio.cash,
            positions_value: state.positions_value(),
            unrealized_pnl: state.unrealized_pnl(),
            batch_id: None,
        };

        let trade_ids: Vec<Uuid> = trades.iter().map(|t| t.id).collect();

        self.store.batch_write(|batch| {
            batch.put::<PortfoliosTable>(&agent_id, &portfolio)?;
            for position in positions.values() {
                batch.put::<PositionsTable>(
                    &PairKey::new(portfolio.id, position.asset_id),
                    position,
                )?;
            }
            for asset_id in &removed_assets {
                batch.delete::<PositionsTable>(&PairKey::new(portfolio.id, *asset_id))?;
            }
            for trade in &trades {
                batch.put::<TradesTable>(
                    &SeriesKey::new(portfolio.id, trade.executed_at, trade.id),
                    trade,
                )?;
            }
            batch.put::<SnapshotsTable>(
                &SeriesKey::new(portfolio.id, snapshot.captured_at, snapshot.id),
                &snapshot,
            )?;
            Ok(())
        })?;

        debug!(
            %agent_id,
            trades = trades.len(),
            cash = %portfolio.cash,
            total_value = %state.total_value,
            "Applied decision"
        );

        Ok((state, trade_ids))
    }

    fn load_positions(
        &self,
        portfolio_id: Uuid,
    ) -> Result<HashMap<Uuid, PositionRecord>, StoreError> {
        Ok(self
            .store
            .scan_prefix::<PositionsTable>(portfolio_id.as_bytes())?
            .into_iter()
            .map(|(key, position)| (key.item, position))
            .collect())
    }

    /// Value a portfolio against the latest prices, falling back to each
    /// position's average entry price when no price exists.
    fn build_state(
        &self,
        portfolio: &PortfolioRecord,
        positions: &HashMap<Uuid, PositionRecord>,
    ) -> Result<PortfolioState, StoreError> {
        let symbols = assets::symbol_lookup(&self.store)?;
        let latest_prices = PriceOracle::new(&self.store).latest_prices()?;

        let mut views: Vec<PositionView> = positions
            .values()
            .map(|position| {
                let current_price = latest_prices
                    .get(&position.asset_id)
                    .copied()
                    .unwrap_or(position.avg_entry_price);
                PositionView {
                    asset_symbol: symbols
                        .get(&position.asset_id)
                        .cloned()
                        .unwrap_or_else(|| "UNKNOWN".to_string()),
                    quantity: position.quantity,
                    avg_entry_price: position.avg_entry_price,
                    current_price,
                }
            })
            .collect();
        views.sort_by(|a, b| a.asset_symbol.cmp(&b.asset_symbol));

        let total_value = portfolio.cash
            + views
                .iter()
                .map(|v| v.market_value())
                .sum::<Decimal>();

        Ok(PortfolioState {
            portfolio_id: portfolio.id,
            agent_id: portfolio.agent_id,
            cash: portfolio.cash,
            positions: views,
            as_of: Utc::now(),
            total_value,
        })
    }
}

/// Running weighted-average entry price, updated only on buys.
fn blended_entry_price(
    position: &PositionRecord,
    new_notional: Decimal,
    new_quantity: Decimal,
) -> Decimal {
    let total_cost = position.avg_entry_price * position.quantity + new_notional;
    let total_quantity = position.quantity + new_quantity;

    if total_quantity <= Decimal::ZERO {
        position.avg_entry_price
    } else {
        total_cost / total_quantity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::codec::CandleKey;
    use crate::store::tables::{CandleRecord, CandlesTable};
    use rust_decimal_macros::dec;

    fn setup() -> (Arc<TypedStore>, PortfolioLedger, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TypedStore::open(dir.path()).unwrap());
        assets::seed_default_assets(&store).unwrap();
        let ledger = PortfolioLedger::new(store.clone());
        (store, ledger, dir)
    }

    fn put_price(store: &TypedStore, symbol: &str, close: Decimal) {
        let asset = assets::find_enabled(store, symbol).unwrap().unwrap();
        let timestamp = Utc::now();
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

    fn buy(symbol: &str, qty: Decimal) -> TradeOrder {
        TradeOrder::new(symbol, TradeSide::Buy, qty)
    }

    fn sell(symbol: &str, qty: Decimal) -> TradeOrder {
        TradeOrder::new(symbol, TradeSide::Sell, qty)
    }

    #[tokio::test]
    async fn test_limit_buy_debits_cash_and_opens_position() {
        let (_store, ledger, _dir) = setup();
        let agent_id = Uuid::new_v4();

        let orders = [buy("BTC", dec!(0.5)).with_limit(dec!(42000))];
        let (state, trade_ids) = ledger.apply_decision(agent_id, &orders).await.unwrap();

        assert_eq!(state.cash, dec!(79000));
        assert_eq!(state.positions.len(), 1);
        let btc = &state.positions[0];
        assert_eq!(btc.asset_symbol, "BTC");
        assert_eq!(btc.quantity, dec!(0.5));
        assert_eq!(btc.avg_entry_price, dec!(42000));
        assert_eq!(trade_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_sequential_buys_blend_average_entry_price() {
        let (_store, ledger, _dir) = setup();
        let agent_id = Uuid::new_v4();

        ledger
            .apply_decision(agent_id, &[buy("BTC", dec!(1)).with_limit(dec!(40000))])
            .await
            .unwrap();
        let (state, _) = ledger
            .apply_decision(agent_id, &[buy("BTC", dec!(1)).with_limit(dec!(42000))])
            .await
            .unwrap();

        // (1*40000 + 1*42000) / 2
        let btc = &state.positions[0];
        assert!((btc.avg_entry_price - dec!(41000)).abs() < dec!(0.0001));
        assert_eq!(btc.quantity, dec!(2));
    }

    #[tokio::test]
    async fn test_insufficient_cash_rolls_back_whole_batch() {
        let (store, ledger, _dir) = setup();
        let agent_id = Uuid::new_v4();

        let before = ledger.get_portfolio(agent_id).unwrap();

        // First order fits, second exceeds cash: nothing may commit.
        let orders = [
            buy("BTC", dec!(1)).with_limit(dec!(40000)),
            buy("ETH", dec!(100)).with_limit(dec!(2500)),
        ];
        let err = ledger.apply_decision(agent_id, &orders).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientCash { .. }));

        let after = ledger.get_portfolio(agent_id).unwrap();
        assert_eq!(after.cash, before.cash);
        assert!(after.positions.is_empty());

        // No trades were recorded either
        let trades = store
            .scan_prefix::<TradesTable>(before.portfolio_id.as_bytes())
            .unwrap();
        assert!(trades.is_empty());
    }

    #[tokio::test]
    async fn test_spending_exact_balance_is_allowed() {
        let (_store, ledger, _dir) = setup();
        let agent_id = Uuid::new_v4();

        let (state, _) = ledger
            .apply_decision(agent_id, &[buy("BTC", dec!(2)).with_limit(dec!(50000))])
            .await
            .unwrap();
        assert_eq!(state.cash, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_oversell_fails_and_leaves_state_unchanged() {
        let (_store, ledger, _dir) = setup();
        let agent_id = Uuid::new_v4();

        ledger
            .apply_decision(agent_id, &[buy("BTC", dec!(1)).with_limit(dec!(40000))])
            .await
            .unwrap();
        let before = ledger.get_portfolio(agent_id).unwrap();

        let err = ledger
            .apply_decision(agent_id, &[sell("BTC", dec!(2)).with_limit(dec!(40000))])
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientHoldings { .. }));

        let after = ledger.get_portfolio(agent_id).unwrap();
        assert_eq!(after.cash, before.cash);
        assert_eq!(after.positions, before.positions);
    }

    #[tokio::test]
    async fn test_selling_entire_position_removes_it() {
        let (_store, ledger, _dir) = setup();
        let agent_id = Uuid::new_v4();

        ledger
            .apply_decision(agent_id, &[buy("BTC", dec!(1)).with_limit(dec!(40000))])
            .await
            .unwrap();
        let (state, _) = ledger
            .apply_decision(agent_id, &[sell("BTC", dec!(1)).with_limit(dec!(45000))])
            .await
            .unwrap();

        assert!(state.positions.is_empty());
        assert_eq!(state.cash, dec!(105000));
    }

    #[tokio::test]
    async fn test_partial_sell_keeps_average_entry_price() {
        let (_store, ledger, _dir) = setup();
        let agent_id = Uuid::new_v4();

        ledger
            .apply_decision(agent_id, &[buy("BTC", dec!(2)).with_limit(dec!(40000))])
            .await
            .unwrap();
        let (state, _) = ledger
            .apply_decision(agent_id, &[sell("BTC", dec!(1)).with_limit(dec!(48000))])
            .await
            .unwrap();

        let btc = &state.positions[0];
        assert_eq!(btc.quantity, dec!(1));
        assert_eq!(btc.avg_entry_price, dec!(40000));
    }

    #[tokio::test]
    async fn test_hold_records_no_trade() {
        let (store, ledger, _dir) = setup();
        let agent_id = Uuid::new_v4();

        let orders = [TradeOrder::new("BTC", TradeSide::Hold, Decimal::ZERO)];
        let (state, trade_ids) = ledger.apply_decision(agent_id, &orders).await.unwrap();

        assert!(trade_ids.is_empty());
        assert_eq!(state.cash, DEFAULT_STARTING_CASH);
        let trades = store
            .scan_prefix::<TradesTable>(state.portfolio_id.as_bytes())
            .unwrap();
        assert!(trades.is_empty());
    }

    #[tokio::test]
    async fn test_non_positive_quantity_is_rejected() {
        let (_store, ledger, _dir) = setup();
        let agent_id = Uuid::new_v4();

        let err = ledger
            .apply_decision(agent_id, &[buy("BTC", Decimal::ZERO)])
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidOrder(_)));
    }

    #[tokio::test]
    async fn test_unknown_asset_is_rejected() {
        let (_store, ledger, _dir) = setup();
        let agent_id = Uuid::new_v4();

        let err = ledger
            .apply_decision(agent_id, &[buy("DOGE", dec!(1)).with_limit(dec!(1))])
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnknownAsset(_)));
    }

    #[tokio::test]
    async fn test_market_order_without_price_data_fails() {
        let (_store, ledger, _dir) = setup();
        let agent_id = Uuid::new_v4();

        let err = ledger
            .apply_decision(agent_id, &[buy("BTC", dec!(1))])
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NoPriceAvailable(_)));
    }

    #[tokio::test]
    async fn test_market_order_uses_latest_candle_close() {
        let (store, ledger, _dir) = setup();
        let agent_id = Uuid::new_v4();
        put_price(&store, "BTC", dec!(42000));

        let (state, _) = ledger
            .apply_decision(agent_id, &[buy("BTC", dec!(1))])
            .await
            .unwrap();
        assert_eq!(state.cash, dec!(58000));
        assert_eq!(state.positions[0].avg_entry_price, dec!(42000));
    }

    #[tokio::test]
    async fn test_apply_captures_post_trade_snapshot() {
        let (store, ledger, _dir) = setup();
        let agent_id = Uuid::new_v4();

        let (state, _) = ledger
            .apply_decision(agent_id, &[buy("BTC", dec!(0.5)).with_limit(dec!(42000))])
            .await
            .unwrap();

        let snapshots = store
            .scan_prefix::<SnapshotsTable>(state.portfolio_id.as_bytes())
            .unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].1.total_value, state.total_value);
        assert_eq!(snapshots[0].1.batch_id, None);
    }

    #[tokio::test]
    async fn test_get_portfolio_is_lazy_and_idempotent() {
        let (_store, ledger, _dir) = setup();
        let agent_id = Uuid::new_v4();

        let first = ledger.get_portfolio(agent_id).unwrap();
        let second = ledger.get_portfolio(agent_id).unwrap();

        assert_eq!(first.portfolio_id, second.portfolio_id);
        assert_eq!(first.cash, DEFAULT_STARTING_CASH);
    }
}
