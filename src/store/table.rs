use crate::store::codec::{DbKey, DbValue};

/// A logical table inside the single RocksDB instance.
///
/// Each table owns one prefix byte; every key is stored as
/// `[PREFIX, encoded key...]`, so up to 256 tables coexist without
/// collisions and each supports independent prefix scans.
pub trait Table {
    type Key: DbKey;
    type Value: DbValue;

    /// Single byte prefix (0x00-0xFF). Must be unique across tables.
    const PREFIX: u8;
}

/// Define a table struct with its key/value types and prefix byte.
#[macro_export]
macro_rules! define_table {
    ($name:ident, $key:ty, $value:ty, $prefix:expr) => {
        pub struct $name;

        impl $crate::store::table::Table for $name {
            type Key = $key;
            type Value = $value;
            const PREFIX: u8 = $prefix;
        }
    };
}
