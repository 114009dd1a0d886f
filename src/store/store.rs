use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use thiserror::Error;

use crate::store::codec::{CodecError, DbKey, DbValue};
use crate::store::table::Table;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Wraps a RocksDB instance and exposes typed put/get/scan operations.
///
/// `batch_write` is the transaction boundary: every mutation staged through
/// a [`BatchWriter`] commits in one atomic RocksDB write, or not at all.
pub struct TypedStore {
    db: DB,
}

impl TypedStore {
    /// Open (or create) the database at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(512);
        opts.optimize_for_point_lookup(1024);

        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    /// Insert or update a key-value pair in the specified table.
    pub fn put<T: Table>(&self, key: &T::Key, value: &T::Value) -> Result<(), StoreError> {
        self.db.put(full_key::<T>(key), value.encode_value()?)?;
        Ok(())
    }

    /// Retrieve a value by key. Returns None if the key doesn't exist.
    pub fn get<T: Table>(&self, key: &T::Key) -> Result<Option<T::Value>, StoreError> {
        match self.db.get(full_key::<T>(key))? {
            Some(bytes) => Ok(Some(T::Value::decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Delete a key-value pair.
    pub fn delete<T: Table>(&self, key: &T::Key) -> Result<(), StoreError> {
        self.db.delete(full_key::<T>(key))?;
        Ok(())
    }

    /// Check whether a key exists.
    pub fn exists<T: Table>(&self, key: &T::Key) -> Result<bool, StoreError> {
        Ok(self.db.get(full_key::<T>(key))?.is_some())
    }

    /// Scan every row of a table, in key order.
    pub fn scan<T: Table>(&self) -> Result<Vec<(T::Key, T::Value)>, StoreError> {
        self.scan_prefix::<T>(&[])
    }

    /// Scan rows whose encoded key starts with `key_prefix`, in key order.
    /// Time-series tables encode their keys so this returns rows in
    /// chronological order.
    pub fn scan_prefix<T: Table>(
        &self,
        key_prefix: &[u8],
    ) -> Result<Vec<(T::Key, T::Value)>, StoreError> {
        let mut full_prefix = vec![T::PREFIX];
        full_prefix.extend_from_slice(key_prefix);

        let iter = self
            .db
            .iterator(IteratorMode::From(&full_prefix, Direction::Forward));

        let mut results = Vec::new();
        for item in iter {
            let (k, v) = item?;

            if !k.starts_with(&full_prefix) {
                break;
            }

            let key = T::Key::decode_key(&k[1..])?;
            let value = T::Value::decode_value(&v)?;
            results.push((key, value));
        }

        Ok(results)
    }

    /// Return the row with the greatest key under `key_prefix`, if any.
    /// For time-series tables this is the most recent row without scanning
    /// the whole range.
    pub fn last_in_prefix<T: Table>(
        &self,
        key_prefix: &[u8],
    ) -> Result<Option<(T::Key, T::Value)>, StoreError> {
        let mut full_prefix = vec![T::PREFIX];
        full_prefix.extend_from_slice(key_prefix);

        // Seek just past the prefix range, then step backwards into it.
        let mut upper = full_prefix.clone();
        increment_bytes(&mut upper);

        let iter = self
            .db
            .iterator(IteratorMode::From(&upper, Direction::Reverse));

        for item in iter {
            let (k, v) = item?;
            if k.starts_with(&full_prefix) {
                return Ok(Some((T::Key::decode_key(&k[1..])?, T::Value::decode_value(&v)?)));
            }
            if k.as_ref() < full_prefix.as_slice() {
                break;
            }
        }

        Ok(None)
    }

    /// Perform an atomic batch write. All puts/deletes staged by `f` commit
    /// together, or none do if `f` returns an error.
    pub fn batch_write<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut BatchWriter) -> Result<(), StoreError>,
    {
        let mut batch = WriteBatch::default();
        let mut writer = BatchWriter::new(&mut batch);
        f(&mut writer)?;
        self.db.write(batch)?;
        Ok(())
    }
}

fn full_key<T: Table>(key: &T::Key) -> Vec<u8> {
    let mut k = vec![T::PREFIX];
    k.extend(key.encode_key());
    k
}

/// Treat the byte string as a big-endian number and add one, for computing
/// the exclusive upper bound of a prefix range. All-0xFF prefixes cannot
/// occur here because the table prefix byte stays below 0xFF.
fn increment_bytes(bytes: &mut Vec<u8>) {
    for b in bytes.iter_mut().rev() {
        if *b < 0xFF {
            *b += 1;
            return;
        }
        *b = 0;
    }
    bytes.insert(0, 1);
}

/// Helper for staging puts/deletes inside one atomic write.
pub struct BatchWriter<'a> {
    batch: &'a mut WriteBatch,
}

impl<'a> BatchWriter<'a> {
    fn new(batch: &'a mut WriteBatch) -> Self {
        Self { batch }
    }

    pub fn put<T: Table>(&mut self, key: &T::Key, value: &T::Value) -> Result<(), StoreError> {
        self.batch.put(full_key::<T>(key), value.encode_value()?);
        Ok(())
    }

    pub fn delete<T: Table>(&mut self, key: &T::Key) -> Result<(), StoreError> {
        self.batch.delete(full_key::<T>(key));
        Ok(())
    }
}
