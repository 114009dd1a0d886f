use std::fmt;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to serialize data: {0}")]
    SerializationError(String),
    #[error("Failed to deserialize data: {0}")]
    DeserializationError(String),
    #[error("Invalid UTF-8 string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Key encoding for RocksDB. Encoded bytes must preserve the key's natural
/// ordering, since range scans rely on lexicographic byte order.
pub trait DbKey: Sized + Clone + fmt::Debug {
    fn encode_key(&self) -> Vec<u8>;
    fn decode_key(data: &[u8]) -> Result<Self, CodecError>;
}

/// Value encoding for RocksDB.
pub trait DbValue: Sized + Clone + fmt::Debug {
    fn encode_value(&self) -> Result<Vec<u8>, CodecError>;
    fn decode_value(data: &[u8]) -> Result<Self, CodecError>;
}

/// Implement `DbValue` via serde_json for one or more record types.
#[macro_export]
macro_rules! impl_db_value {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::store::codec::DbValue for $ty {
                fn encode_value(&self) -> Result<Vec<u8>, $crate::store::codec::CodecError> {
                    serde_json::to_vec(self).map_err(|e| {
                        $crate::store::codec::CodecError::SerializationError(e.to_string())
                    })
                }

                fn decode_value(data: &[u8]) -> Result<Self, $crate::store::codec::CodecError> {
                    serde_json::from_slice(data).map_err(|e| {
                        $crate::store::codec::CodecError::DeserializationError(e.to_string())
                    })
                }
            }
        )+
    };
}

impl DbKey for String {
    fn encode_key(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn decode_key(data: &[u8]) -> Result<Self, CodecError> {
        String::from_utf8(data.to_vec()).map_err(CodecError::from)
    }
}

impl DbKey for u64 {
    fn encode_key(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn decode_key(data: &[u8]) -> Result<Self, CodecError> {
        let bytes: [u8; 8] = data.try_into().map_err(|_| {
            CodecError::DeserializationError(format!(
                "Expected 8 bytes for u64, got {}",
                data.len()
            ))
        })?;
        Ok(u64::from_be_bytes(bytes))
    }
}

impl DbKey for Uuid {
    fn encode_key(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn decode_key(data: &[u8]) -> Result<Self, CodecError> {
        let bytes: [u8; 16] = data.try_into().map_err(|_| {
            CodecError::DeserializationError(format!(
                "Expected 16 bytes for Uuid, got {}",
                data.len()
            ))
        })?;
        Ok(Uuid::from_bytes(bytes))
    }
}

/// Composite key `(owner, asset)` for rows unique per (portfolio, asset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairKey {
    pub owner: Uuid,
    pub item: Uuid,
}

impl PairKey {
    pub fn new(owner: Uuid, item: Uuid) -> Self {
        Self { owner, item }
    }
}

impl DbKey for PairKey {
    fn encode_key(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        out.extend_from_slice(self.owner.as_bytes());
        out.extend_from_slice(self.item.as_bytes());
        out
    }

    fn decode_key(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != 32 {
            return Err(CodecError::DeserializationError(format!(
                "Expected 32 bytes for PairKey, got {}",
                data.len()
            )));
        }
        Ok(Self {
            owner: Uuid::decode_key(&data[..16])?,
            item: Uuid::decode_key(&data[16..])?,
        })
    }
}

/// Composite key `(owner, timestamp-millis, id)` for append-only time series
/// (trades, equity snapshots). Byte order makes per-owner prefix scans come
/// back in chronological order; the trailing id disambiguates rows written
/// within the same millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesKey {
    pub owner: Uuid,
    pub at_millis: u64,
    pub id: Uuid,
}

impl SeriesKey {
    pub fn new(owner: Uuid, at: chrono::DateTime<chrono::Utc>, id: Uuid) -> Self {
        Self {
            owner,
            at_millis: at.timestamp_millis().max(0) as u64,
            id,
        }
    }

    /// Prefix bytes selecting every row belonging to `owner`.
    pub fn owner_prefix(owner: Uuid) -> Vec<u8> {
        owner.as_bytes().to_vec()
    }
}

impl DbKey for SeriesKey {
    fn encode_key(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(40);
        out.extend_from_slice(self.owner.as_bytes());
        out.extend_from_slice(&self.at_millis.to_be_bytes());
        out.extend_from_slice(self.id.as_bytes());
        out
    }

    fn decode_key(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != 40 {
            return Err(CodecError::DeserializationError(format!(
                "Expected 40 bytes for SeriesKey, got {}",
                data.len()
            )));
        }
        Ok(Self {
            owner: Uuid::decode_key(&data[..16])?,
            at_millis: u64::decode_key(&data[16..24])?,
            id: Uuid::decode_key(&data[24..])?,
        })
    }
}

/// Composite key `(asset, timestamp-millis)` for candle rows, unique per
/// asset and timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandleKey {
    pub asset_id: Uuid,
    pub at_millis: u64,
}

impl CandleKey {
    pub fn new(asset_id: Uuid, at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            asset_id,
            at_millis: at.timestamp_millis().max(0) as u64,
        }
    }

    /// Prefix bytes selecting every candle for `asset_id`.
    pub fn asset_prefix(asset_id: Uuid) -> Vec<u8> {
        asset_id.as_bytes().to_vec()
    }
}

impl DbKey for CandleKey {
    fn encode_key(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        out.extend_from_slice(self.asset_id.as_bytes());
        out.extend_from_slice(&self.at_millis.to_be_bytes());
        out
    }

    fn decode_key(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != 24 {
            return Err(CodecError::DeserializationError(format!(
                "Expected 24 bytes for CandleKey, got {}",
                data.len()
            )));
        }
        Ok(Self {
            asset_id: Uuid::decode_key(&data[..16])?,
            at_millis: u64::decode_key(&data[16..])?,
        })
    }
}
