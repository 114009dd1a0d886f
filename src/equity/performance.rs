//! Performance metrics derived from the snapshot series and trade history.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use crate::equity::engine::{EquityEngine, EquityError};
use crate::portfolio::types::{TradeSide, DEFAULT_STARTING_CASH};
use crate::store::codec::SeriesKey;
use crate::store::tables::{EquitySnapshotRecord, PortfoliosTable, TradeRecord, TradesTable};

#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceMetrics {
    pub agent_id: Uuid,
    pub initial_value: Decimal,
    pub current_value: Decimal,
    pub total_return: Decimal,
    pub percent_return: Decimal,
    /// Maximum peak-to-trough decline over the snapshot series, as a
    /// percentage.
    pub max_drawdown: Decimal,
    /// Requires a risk-free-rate model; not computed.
    pub sharpe_ratio: Option<Decimal>,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: Decimal,
    pub calculated_at: DateTime<Utc>,
}

impl EquityEngine {
    /// Compute performance metrics for an agent from its snapshot series
    /// and trade history.
    pub fn calculate_performance(
        &self,
        agent_id: Uuid,
    ) -> Result<PerformanceMetrics, EquityError> {
        let Some(portfolio) = self.store().get::<PortfoliosTable>(&agent_id)? else {
            return Ok(default_metrics(agent_id));
        };

        let snapshots = self.snapshots_for(portfolio.id)?;
        let trades: Vec<TradeRecord> = self
            .store()
            .scan_prefix::<TradesTable>(&SeriesKey::owner_prefix(portfolio.id))?
            .into_iter()
            .map(|(_, t)| t)
            .collect();

        let initial_value = snapshots
            .first()
            .map(|s| s.total_value)
            .unwrap_or(DEFAULT_STARTING_CASH);
        let current_value = snapshots
            .last()
            .map(|s| s.total_value)
            .unwrap_or(DEFAULT_STARTING_CASH);

        let total_return = current_value - initial_value;
        let percent_return = if initial_value > Decimal::ZERO {
            total_return / initial_value * Decimal::from(100)
        } else {
            Decimal::ZERO
        };

        let (winning_trades, losing_trades) = trade_outcomes(&trades);
        let total_trades = trades.len();
        let win_rate = if total_trades > 0 {
            Decimal::from(winning_trades) / Decimal::from(total_trades) * Decimal::from(100)
        } else {
            Decimal::ZERO
        };

        Ok(PerformanceMetrics {
            agent_id,
            initial_value,
            current_value,
            total_return,
            percent_return,
            max_drawdown: max_drawdown(&snapshots),
            sharpe_ratio: None,
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            calculated_at: Utc::now(),
        })
    }
}

fn default_metrics(agent_id: Uuid) -> PerformanceMetrics {
    PerformanceMetrics {
        agent_id,
        initial_value: DEFAULT_STARTING_CASH,
        current_value: DEFAULT_STARTING_CASH,
        total_return: Decimal::ZERO,
        percent_return: Decimal::ZERO,
        max_drawdown: Decimal::ZERO,
        sharpe_ratio: None,
        total_trades: 0,
        winning_trades: 0,
        losing_trades: 0,
        win_rate: Decimal::ZERO,
        calculated_at: Utc::now(),
    }
}

/// Maximum peak-to-trough percentage decline, walking the series in
/// chronological order.
fn max_drawdown(snapshots: &[EquitySnapshotRecord]) -> Decimal {
    if snapshots.len() < 2 {
        return Decimal::ZERO;
    }

    let mut peak = snapshots[0].total_value;
    let mut max_dd = Decimal::ZERO;

    for snapshot in snapshots {
        if snapshot.total_value > peak {
            peak = snapshot.total_value;
        }
        if peak > Decimal::ZERO {
            let drawdown = (peak - snapshot.total_value) / peak;
            if drawdown > max_dd {
                max_dd = drawdown;
            }
        }
    }

    max_dd * Decimal::from(100)
}

/// Classify each sell as winning or losing by replaying the trade history
/// with a synthetic running average entry price per asset.
///
/// The replay average can diverge from the persisted position average
/// after partial sells; this replay-based classification is the contract
/// for historical analytics and must not be "corrected" against live
/// position state.
fn trade_outcomes(trades: &[TradeRecord]) -> (usize, usize) {
    let mut replay: HashMap<Uuid, (Decimal, Decimal)> = HashMap::new();
    let mut winning = 0;
    let mut losing = 0;

    // Trades arrive in execution order from the series-keyed scan.
    for trade in trades {
        match trade.side {
            TradeSide::Buy => {
                let entry = replay
                    .entry(trade.asset_id)
                    .or_insert((Decimal::ZERO, Decimal::ZERO));
                let new_qty = entry.0 + trade.quantity;
                entry.1 = (entry.0 * entry.1 + trade.quantity * trade.price) / new_qty;
                entry.0 = new_qty;
            }
            TradeSide::Sell => {
                if let Some((qty, avg)) = replay.get(&trade.asset_id).copied() {
                    if trade.price > avg {
                        winning += 1;
                    } else {
                        losing += 1;
                    }

                    let new_qty = qty - trade.quantity;
                    if new_qty > Decimal::ZERO {
                        replay.insert(trade.asset_id, (new_qty, avg));
                    } else {
                        replay.remove(&trade.asset_id);
                    }
                }
            }
            TradeSide::Hold => {}
        }
    }

    (winning, losing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot(total_value: Decimal) -> EquitySnapshotRecord {
        EquitySnapshotRecord {
            id: Uuid::new_v4(),
            portfolio_id: Uuid::new_v4(),
            captured_at: Utc::now(),
            total_value,
            cash_value: total_value,
            positions_value: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            batch_id: None,
        }
    }

    fn trade(asset_id: Uuid, side: TradeSide, quantity: Decimal, price: Decimal) -> TradeRecord {
        TradeRecord {
            id: Uuid::new_v4(),
            portfolio_id: Uuid::new_v4(),
            asset_id,
            side,
            quantity,
            price,
            executed_at: Utc::now(),
        }
    }

    #[test]
    fn test_max_drawdown_peak_to_trough() {
        let series: Vec<_> = [dec!(100), dec!(120), dec!(90), dec!(110)]
            .into_iter()
            .map(snapshot)
            .collect();

        // Peak 120 to trough 90: 25%
        assert_eq!(max_drawdown(&series), dec!(25));
    }

    #[test]
    fn test_max_drawdown_of_rising_series_is_zero() {
        let series: Vec<_> = [dec!(100), dec!(110), dec!(120)]
            .into_iter()
            .map(snapshot)
            .collect();
        assert_eq!(max_drawdown(&series), Decimal::ZERO);
    }

    #[test]
    fn test_max_drawdown_needs_two_points() {
        assert_eq!(max_drawdown(&[snapshot(dec!(100))]), Decimal::ZERO);
    }

    #[test]
    fn test_trade_outcomes_replay_average() {
        let btc = Uuid::new_v4();
        let trades = vec![
            trade(btc, TradeSide::Buy, dec!(1), dec!(40000)),
            trade(btc, TradeSide::Buy, dec!(1), dec!(42000)),
            // Replay average is 41000: this sell wins
            trade(btc, TradeSide::Sell, dec!(1), dec!(41500)),
            // Average stays 41000 after the partial sell: this one loses
            trade(btc, TradeSide::Sell, dec!(1), dec!(40500)),
        ];

        assert_eq!(trade_outcomes(&trades), (1, 1));
    }

    #[test]
    fn test_trade_outcomes_ignore_sells_without_history() {
        let btc = Uuid::new_v4();
        let trades = vec![trade(btc, TradeSide::Sell, dec!(1), dec!(40000))];
        assert_eq!(trade_outcomes(&trades), (0, 0));
    }

    #[test]
    fn test_sell_at_exact_average_counts_as_loss() {
        let btc = Uuid::new_v4();
        let trades = vec![
            trade(btc, TradeSide::Buy, dec!(1), dec!(40000)),
            trade(btc, TradeSide::Sell, dec!(1), dec!(40000)),
        ];
        assert_eq!(trade_outcomes(&trades), (0, 1));
    }
}
