//! Portfolio ownership and the trade ledger.

pub mod ledger;
pub mod types;

pub use ledger::{LedgerError, PortfolioLedger};
pub use types::{AgentDecision, PortfolioState, PositionView, TradeOrder, TradeSide};
