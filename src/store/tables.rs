//! Persisted record types and table definitions.
//!
//! Key layouts double as the indexes the rest of the crate relies on:
//! positions are unique per (portfolio, asset), candles unique per
//! (asset, timestamp), and trades/snapshots scan back chronologically
//! per portfolio.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::decision::DecisionSourceKind;
use crate::define_table;
use crate::impl_db_value;
use crate::portfolio::types::TradeSide;
use crate::store::codec::{CandleKey, PairKey, SeriesKey};

/// A tradable asset known to the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketAssetRecord {
    pub id: Uuid,
    /// Uppercase ticker, unique (it is the table key).
    pub symbol: String,
    pub name: String,
    pub quote_currency: String,
    /// Identifier used by the external data feed (e.g. "bitcoin").
    pub external_id: String,
    pub enabled: bool,
}

/// One OHLC candle for an asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleRecord {
    pub asset_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// A portfolio, keyed by its owning agent id (one portfolio per agent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioRecord {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub cash: Decimal,
    pub base_currency: String,
}

/// An open position, keyed by (portfolio id, asset id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub portfolio_id: Uuid,
    pub asset_id: Uuid,
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
}

/// An executed trade. Append-only, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub portfolio_id: Uuid,
    pub asset_id: Uuid,
    pub side: TradeSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub executed_at: DateTime<Utc>,
}

/// A point-in-time portfolio valuation. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquitySnapshotRecord {
    pub id: Uuid,
    pub portfolio_id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub total_value: Decimal,
    pub cash_value: Decimal,
    pub positions_value: Decimal,
    pub unrealized_pnl: Decimal,
    /// Correlates snapshots captured against one market-data batch.
    pub batch_id: Option<Uuid>,
}

/// A competing agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: Uuid,
    pub name: String,
    /// Human-readable strategy blurb, for display.
    pub strategy: String,
    /// Instructions forwarded to the decision source.
    pub instructions: String,
    pub source: DecisionSourceKind,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of one market-cycle run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl CycleStatus {
    /// Whether a run with this status blocks a new start for the same key.
    pub fn is_in_flight(self) -> bool {
        matches!(self, CycleStatus::Pending | CycleStatus::Running)
    }
}

/// Result summary recorded when a cycle completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub batch_id: Uuid,
    pub cycle_ts: DateTime<Utc>,
    pub snapshot_count: usize,
    pub decision_cycle: bool,
    pub agents_run: usize,
    pub agents_failed: usize,
    pub trades_executed: usize,
    pub duration_ms: u64,
}

/// One orchestration run, keyed by its deterministic instance key.
/// Never resumed once completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleInstanceRecord {
    pub key: String,
    pub status: CycleStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub summary: Option<CycleSummary>,
}

impl_db_value!(
    MarketAssetRecord,
    CandleRecord,
    PortfolioRecord,
    PositionRecord,
    TradeRecord,
    EquitySnapshotRecord,
    AgentRecord,
    CycleInstanceRecord,
);

// Table definitions with unique prefixes

define_table!(AssetsTable, String, MarketAssetRecord, 0x01);
define_table!(CandlesTable, CandleKey, CandleRecord, 0x02);
define_table!(PortfoliosTable, Uuid, PortfolioRecord, 0x03);
define_table!(PositionsTable, PairKey, PositionRecord, 0x04);
define_table!(TradesTable, SeriesKey, TradeRecord, 0x05);
define_table!(SnapshotsTable, SeriesKey, EquitySnapshotRecord, 0x06);
define_table!(AgentsTable, Uuid, AgentRecord, 0x07);
define_table!(CyclesTable, String, CycleInstanceRecord, 0x08);
