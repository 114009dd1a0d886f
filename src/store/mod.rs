//! Typed RocksDB storage layer.
//!
//! One RocksDB instance holds every logical table, distinguished by a
//! prefix byte. `TypedStore::batch_write` is the crate's transaction
//! boundary: the portfolio ledger stages all effects of one decision into
//! a single atomic write.

pub mod codec;
pub mod store;
pub mod table;
pub mod tables;

pub use store::{BatchWriter, StoreError, TypedStore};
