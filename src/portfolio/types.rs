//! Portfolio and trading type definitions with strong typing

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Every new portfolio starts with this much cash.
pub const DEFAULT_STARTING_CASH: Decimal = Decimal::from_parts(100_000, 0, 0, false, 0);

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "BUY"),
            TradeSide::Sell => write!(f, "SELL"),
            TradeSide::Hold => write!(f, "HOLD"),
        }
    }
}

/// A single order proposed by an agent. The limit price, when positive,
/// overrides the latest market price at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeOrder {
    pub asset_symbol: String,
    pub side: TradeSide,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
}

impl TradeOrder {
    pub fn new(asset_symbol: impl Into<String>, side: TradeSide, quantity: Decimal) -> Self {
        Self {
            asset_symbol: asset_symbol.into(),
            side,
            quantity,
            limit_price: None,
        }
    }

    pub fn with_limit(mut self, limit_price: Decimal) -> Self {
        self.limit_price = Some(limit_price);
        self
    }
}

/// The full output of one decision-source call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDecision {
    pub agent_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub orders: Vec<TradeOrder>,
    pub rationale: Option<String>,
}

impl AgentDecision {
    pub fn new(agent_id: Uuid, orders: Vec<TradeOrder>) -> Self {
        Self {
            agent_id,
            created_at: Utc::now(),
            orders,
            rationale: None,
        }
    }

    /// A decision with no orders, used when a decision source fails.
    pub fn empty(agent_id: Uuid, rationale: impl Into<String>) -> Self {
        Self {
            agent_id,
            created_at: Utc::now(),
            orders: Vec::new(),
            rationale: Some(rationale.into()),
        }
    }
}

/// One position as seen from the outside, valued at the latest known price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionView {
    pub asset_symbol: String,
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub current_price: Decimal,
}

impl PositionView {
    pub fn market_value(&self) -> Decimal {
        self.quantity * self.current_price
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        (self.current_price - self.avg_entry_price) * self.quantity
    }
}

/// Valued portfolio state returned by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioState {
    pub portfolio_id: Uuid,
    pub agent_id: Uuid,
    pub cash: Decimal,
    pub positions: Vec<PositionView>,
    pub as_of: DateTime<Utc>,
    pub total_value: Decimal,
}

impl PortfolioState {
    pub fn positions_value(&self) -> Decimal {
        self.positions.iter().map(|p| p.market_value()).sum()
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.positions.iter().map(|p| p.unrealized_pnl()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_view_valuation() {
        let view = PositionView {
            asset_symbol: "BTC".into(),
            quantity: dec!(0.5),
            avg_entry_price: dec!(40000),
            current_price: dec!(42000),
        };
        assert_eq!(view.market_value(), dec!(21000));
        assert_eq!(view.unrealized_pnl(), dec!(1000));
    }

    #[test]
    fn test_default_starting_cash() {
        assert_eq!(DEFAULT_STARTING_CASH, dec!(100000));
    }
}
