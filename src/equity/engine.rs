//! Equity snapshot engine: values portfolios at a point in time.
//!
//! The batch path captures every active agent against ONE price map, ONE
//! timestamp and ONE batch id, so a cycle's snapshots compare all agents
//! at identical market conditions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agents::registry;
use crate::markets::oracle::PriceOracle;
use crate::portfolio::ledger::get_or_create_record;
use crate::store::codec::SeriesKey;
use crate::store::tables::{
    EquitySnapshotRecord, PortfoliosTable, PositionRecord, PositionsTable, SnapshotsTable,
};
use crate::store::{StoreError, TypedStore};

#[derive(Debug, Error)]
pub enum EquityError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// A snapshot as exposed to callers, annotated with the percent change
/// since the portfolio's first ever snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct EquitySnapshotView {
    pub id: Uuid,
    pub portfolio_id: Uuid,
    pub agent_id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub total_value: Decimal,
    pub cash_value: Decimal,
    pub positions_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub batch_id: Option<Uuid>,
    pub percent_change: Option<Decimal>,
}

pub struct EquityEngine {
    store: Arc<TypedStore>,
}

impl EquityEngine {
    pub fn new(store: Arc<TypedStore>) -> Self {
        Self { store }
    }

    pub(crate) fn store(&self) -> &TypedStore {
        &self.store
    }

    /// Capture a snapshot for one agent at the current time.
    pub fn capture_snapshot(&self, agent_id: Uuid) -> Result<EquitySnapshotView, EquityError> {
        let latest_prices = PriceOracle::new(&self.store).latest_prices()?;
        let snapshot = self.capture_internal(agent_id, None, Utc::now(), &latest_prices)?;

        info!(
            %agent_id,
            total = %snapshot.total_value,
            cash = %snapshot.cash_value,
            positions = %snapshot.positions_value,
            "Captured equity snapshot"
        );

        self.annotate(agent_id, snapshot)
    }

    /// Capture snapshots for every active agent with a shared timestamp and
    /// batch id. A failure for one agent is logged and skipped; the returned
    /// count reflects successes only.
    pub fn capture_all_snapshots(
        &self,
        batch_id: Uuid,
        timestamp: DateTime<Utc>,
    ) -> Result<usize, EquityError> {
        let agents = registry::active_agents(&self.store)?;
        let latest_prices = PriceOracle::new(&self.store).latest_prices()?;

        let mut count = 0;
        for agent in &agents {
            match self.capture_internal(agent.id, Some(batch_id), timestamp, &latest_prices) {
                Ok(_) => count += 1,
                Err(e) => {
                    error!(agent_id = %agent.id, error = %e, "Failed to capture snapshot");
                }
            }
        }

        info!(
            captured = count,
            active_agents = agents.len(),
            %batch_id,
            %timestamp,
            "Captured equity snapshots"
        );

        Ok(count)
    }

    /// The chronological snapshot series for an agent, optionally bounded,
    /// each entry annotated with percent change from the first snapshot in
    /// the portfolio's history.
    pub fn equity_curve(
        &self,
        agent_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<EquitySnapshotView>, EquityError> {
        let Some(portfolio) = self.store.get::<PortfoliosTable>(&agent_id)? else {
            return Ok(Vec::new());
        };

        let all = self.snapshots_for(portfolio.id)?;
        let first_value = all.first().map(|s| s.total_value);

        Ok(all
            .into_iter()
            .filter(|s| from.map_or(true, |f| s.captured_at >= f))
            .filter(|s| to.map_or(true, |t| s.captured_at <= t))
            .map(|s| view(agent_id, s, first_value))
            .collect())
    }

    /// Most recent snapshot for an agent, if any.
    pub fn latest_snapshot(
        &self,
        agent_id: Uuid,
    ) -> Result<Option<EquitySnapshotView>, EquityError> {
        let Some(portfolio) = self.store.get::<PortfoliosTable>(&agent_id)? else {
            return Ok(None);
        };

        let Some((_, latest)) = self
            .store
            .last_in_prefix::<SnapshotsTable>(&SeriesKey::owner_prefix(portfolio.id))?
        else {
            return Ok(None);
        };

        Ok(Some(self.annotate(agent_id, latest)?))
    }

    fn capture_internal(
        &self,
        agent_id: Uuid,
        batch_id: Option<Uuid>,
        timestamp: DateTime<Utc>,
        latest_prices: &HashMap<Uuid, Decimal>,
    ) -> Result<EquitySnapshotRecord, EquityError> {
        let portfolio = match self.store.get::<PortfoliosTable>(&agent_id)? {
            Some(existing) => existing,
            None => {
                warn!(%agent_id, "No portfolio for agent, creating one with default cash");
                get_or_create_record(&self.store, agent_id)?
            }
        };

        let positions: Vec<PositionRecord> = self
            .store
            .scan_prefix::<PositionsTable>(portfolio.id.as_bytes())?
            .into_iter()
            .map(|(_, p)| p)
            .collect();

        let mut positions_value = Decimal::ZERO;
        let mut unrealized_pnl = Decimal::ZERO;

        for position in &positions {
            match latest_prices.get(&position.asset_id) {
                Some(price) => {
                    positions_value += position.quantity * price;
                    unrealized_pnl += (price - position.avg_entry_price) * position.quantity;
                }
                // Without market data, fall back to the entry price: the
                // position is carried at cost, contributing no PnL.
                None => {
                    positions_value += position.quantity * position.avg_entry_price;
                }
            }
        }

        let snapshot = EquitySnapshotRecord {
            id: Uuid::new_v4(),
            portfolio_id: portfolio.id,
            captured_at: timestamp,
            total_value: portfolio.cash + positions_value,
            cash_value: portfolio.cash,
            positions_value,
            unrealized_pnl,
            batch_id,
        };

        self.store.put::<SnapshotsTable>(
            &SeriesKey::new(portfolio.id, snapshot.captured_at, snapshot.id),
            &snapshot,
        )?;

        debug!(
            %agent_id,
            total = %snapshot.total_value,
            batch = ?batch_id,
            "Captured snapshot"
        );

        Ok(snapshot)
    }

    pub(crate) fn snapshots_for(
        &self,
        portfolio_id: Uuid,
    ) -> Result<Vec<EquitySnapshotRecord>, StoreError> {
        Ok(self
            .store
            .scan_prefix::<SnapshotsTable>(&SeriesKey::owner_prefix(portfolio_id))?
            .into_iter()
            .map(|(_, s)| s)
            .collect())
    }

    fn annotate(
        &self,
        agent_id: Uuid,
        snapshot: EquitySnapshotRecord,
    ) -> Result<EquitySnapshotView, EquityError> {
        let first_value = self
            .store
            .scan_prefix::<SnapshotsTable>(&SeriesKey::owner_prefix(snapshot.portfolio_id))?
            .first()
            .map(|(_, s)| s.total_value);

        Ok(view(agent_id, snapshot, first_value))
    }
}

fn view(
    agent_id: Uuid,
    snapshot: EquitySnapshotRecord,
    first_value: Option<Decimal>,
) -> EquitySnapshotView {
    let percent_change = first_value
        .filter(|first| *first > Decimal::ZERO)
        .map(|first| (snapshot.total_value - first) / first * Decimal::from(100));

    EquitySnapshotView {
        id: snapshot.id,
        portfolio_id: snapshot.portfolio_id,
        agent_id,
        captured_at: snapshot.captured_at,
        total_value: snapshot.total_value,
        cash_value: snapshot.cash_value,
        positions_value: snapshot.positions_value,
        unrealized_pnl: snapshot.unrealized_pnl,
        batch_id: snapshot.batch_id,
        percent_change,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::decision::DecisionSourceKind;
    use crate::markets::assets;
    use crate::portfolio::{PortfolioLedger, TradeOrder, TradeSide};
    use crate::store::codec::CandleKey;
    use crate::store::tables::{CandleRecord, CandlesTable};
    use rust_decimal_macros::dec;

    fn setup() -> (Arc<TypedStore>, EquityEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TypedStore::open(dir.path()).unwrap());
        assets::seed_default_assets(&store).unwrap();
        let engine = EquityEngine::new(store.clone());
        (store, engine, dir)
    }

    fn add_agent(store: &TypedStore, name: &str) -> Uuid {
        registry::create_agent(store, name, "test", "", DecisionSourceKind::EchoHold)
            .unwrap()
            .id
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

    #[tokio::test]
    async fn test_snapshot_values_positions_at_latest_price() {
        let (store, engine, _dir) = setup();
        let agent_id = add_agent(&store, "alpha");
        put_price(&store, "BTC", dec!(40000));

        let ledger = PortfolioLedger::new(store.clone());
        ledger
            .apply_decision(agent_id, &[TradeOrder::new("BTC", TradeSide::Buy, dec!(1))])
            .await
            .unwrap();

        put_price(&store, "BTC", dec!(44000));
        let snapshot = engine.capture_snapshot(agent_id).unwrap();

        assert_eq!(snapshot.cash_value, dec!(60000));
        assert_eq!(snapshot.positions_value, dec!(44000));
        assert_eq!(snapshot.total_value, dec!(104000));
        assert_eq!(snapshot.unrealized_pnl, dec!(4000));
    }

    #[tokio::test]
    async fn test_snapshot_falls_back_to_entry_price_without_market_data() {
        let (store, engine, _dir) = setup();
        let agent_id = add_agent(&store, "alpha");

        let ledger = PortfolioLedger::new(store.clone());
        // Limit order works without any candle data
        ledger
            .apply_decision(
                agent_id,
                &[TradeOrder::new("BTC", TradeSide::Buy, dec!(1)).with_limit(dec!(40000))],
            )
            .await
            .unwrap();

        let snapshot = engine.capture_snapshot(agent_id).unwrap();
        assert_eq!(snapshot.positions_value, dec!(40000));
        assert_eq!(snapshot.unrealized_pnl, Decimal::ZERO);
        assert_eq!(snapshot.total_value, dec!(100000));
    }

    #[test]
    fn test_capture_all_shares_timestamp_and_batch() {
        let (store, engine, _dir) = setup();
        let a = add_agent(&store, "alpha");
        let b = add_agent(&store, "bravo");

        let batch_id = Uuid::new_v4();
        let timestamp = Utc::now();
        let count = engine.capture_all_snapshots(batch_id, timestamp).unwrap();
        assert_eq!(count, 2);

        for agent_id in [a, b] {
            let latest = engine.latest_snapshot(agent_id).unwrap().unwrap();
            assert_eq!(latest.captured_at, timestamp);
            assert_eq!(latest.batch_id, Some(batch_id));
        }
    }

    #[test]
    fn test_capture_all_skips_inactive_agents() {
        let (store, engine, _dir) = setup();
        add_agent(&store, "alpha");
        let dormant = add_agent(&store, "dormant");
        registry::set_active(&store, dormant, false).unwrap();

        let count = engine
            .capture_all_snapshots(Uuid::new_v4(), Utc::now())
            .unwrap();
        assert_eq!(count, 1);
        assert!(engine.latest_snapshot(dormant).unwrap().is_none());
    }

    #[test]
    fn test_percent_change_is_relative_to_first_snapshot() {
        let (store, engine, _dir) = setup();
        let agent_id = add_agent(&store, "alpha");

        // First snapshot of a fresh portfolio: zero change from itself
        let first = engine.capture_snapshot(agent_id).unwrap();
        assert_eq!(first.percent_change, Some(Decimal::ZERO));

        // Manufacture growth: bump cash directly and snapshot again
        let mut portfolio = store
            .get::<PortfoliosTable>(&agent_id)
            .unwrap()
            .unwrap();
        portfolio.cash = dec!(110000);
        store.put::<PortfoliosTable>(&agent_id, &portfolio).unwrap();

        let second = engine.capture_snapshot(agent_id).unwrap();
        assert_eq!(second.percent_change, Some(dec!(10)));

        portfolio.cash = dec!(120000);
        store.put::<PortfoliosTable>(&agent_id, &portfolio).unwrap();

        // Still measured against the FIRST snapshot, not the previous one
        let third = engine.capture_snapshot(agent_id).unwrap();
        assert_eq!(third.percent_change, Some(dec!(20)));
    }

    #[test]
    fn test_equity_curve_bounds() {
        let (store, engine, _dir) = setup();
        let agent_id = add_agent(&store, "alpha");

        engine.capture_snapshot(agent_id).unwrap();
        engine.capture_snapshot(agent_id).unwrap();

        let curve = engine.equity_curve(agent_id, None, None).unwrap();
        assert_eq!(curve.len(), 2);
        assert!(curve[0].captured_at <= curve[1].captured_at);

        let future = Utc::now() + chrono::Duration::hours(1);
        let empty = engine.equity_curve(agent_id, Some(future), None).unwrap();
        assert!(empty.is_empty());
    }
}
