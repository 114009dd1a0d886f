//! Equity snapshots and performance metrics.

pub mod engine;
pub mod performance;

pub use engine::{EquityEngine, EquityError, EquitySnapshotView};
pub use performance::PerformanceMetrics;
