//! Market data: asset registry, external OHLC feed, ingestion, price oracle.

pub mod assets;
pub mod client;
pub mod ingestion;
pub mod oracle;

pub use client::{ExternalCandle, MarketDataClient, MarketDataError};
pub use ingestion::{IngestionError, IngestionResult, IngestionService};
pub use oracle::PriceOracle;
