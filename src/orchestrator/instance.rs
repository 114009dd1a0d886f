//! Cycle instance lifecycle and idempotency keys.
//!
//! A cycle instance is uniquely named by its truncated cycle timestamp, so
//! at-least-once timer delivery can never start two concurrent runs for
//! the same time bucket. Manual triggers live in their own key namespace
//! (seconds-resolution) and cannot collide with scheduled runs.

use chrono::{DateTime, Timelike, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::tables::{CycleInstanceRecord, CycleStatus, CycleSummary, CyclesTable};
use crate::store::{StoreError, TypedStore};

/// Floor a timestamp to the cycle interval boundary.
pub fn truncate_to_interval(ts: DateTime<Utc>, interval_minutes: u32) -> DateTime<Utc> {
    let interval = interval_minutes.max(1);
    let minute = ts.minute() - ts.minute() % interval;
    ts.with_minute(minute)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Whether a cycle timestamp lands on the coarser decision boundary.
pub fn is_decision_minute(ts: DateTime<Utc>, decision_minutes: u32) -> bool {
    ts.minute() % decision_minutes.max(1) == 0
}

/// Instance key for a scheduled run, derived from the truncated timestamp.
pub fn scheduled_key(bucket: DateTime<Utc>) -> String {
    format!("market-cycle-{}", bucket.format("%Y%m%d-%H%M"))
}

/// Instance key for a manual run. Seconds resolution keeps it out of the
/// scheduled namespace.
pub fn manual_key(now: DateTime<Utc>) -> String {
    format!("market-cycle-manual-{}", now.format("%Y%m%d-%H%M%S"))
}

/// Deterministic batch id for an instance key: the same run always
/// correlates its snapshots under the same id, and distinct instances
/// (scheduled vs. manual) never share one.
pub fn batch_id_for(instance_key: &str) -> Uuid {
    let digest = Sha256::digest(instance_key.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);

    // Stamp RFC 4122 version/variant bits so the result is a well-formed
    // name-derived UUID.
    bytes[6] = (bytes[6] & 0x0F) | 0x50;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;

    Uuid::from_bytes(bytes)
}

/// Persistent view of cycle instances, with an atomic check-and-create for
/// idempotent starts.
pub struct InstanceStore {
    store: Arc<TypedStore>,
    /// Serializes the existence check and the Pending insert.
    start_guard: Mutex<()>,
}

impl InstanceStore {
    pub fn new(store: Arc<TypedStore>) -> Self {
        Self {
            store,
            start_guard: Mutex::new(()),
        }
    }

    /// Begin an instance if the key is free. Returns None when a run with
    /// this key is already in flight or has completed: a bucket runs at
    /// most once and is never resumed. A previously failed key may be
    /// retried.
    pub async fn try_begin(&self, key: &str) -> Result<Option<CycleInstanceRecord>, StoreError> {
        let _guard = self.start_guard.lock().await;

        if let Some(existing) = self.store.get::<CyclesTable>(&key.to_string())? {
            match existing.status {
                status if status.is_in_flight() => {
                    warn!(key, status = ?status, "Cycle instance already in flight, skipping");
                    return Ok(None);
                }
                CycleStatus::Completed => {
                    debug!(key, "Cycle instance already completed, skipping");
                    return Ok(None);
                }
                CycleStatus::Failed => {
                    debug!(key, "Retrying previously failed cycle instance");
                }
                _ => {}
            }
        }

        let record = CycleInstanceRecord {
            key: key.to_string(),
            status: CycleStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            summary: None,
        };
        self.store.put::<CyclesTable>(&record.key, &record)?;

        Ok(Some(record))
    }

    pub fn mark_running(&self, key: &str) -> Result<(), StoreError> {
        self.update(key, |record| {
            record.status = CycleStatus::Running;
        })
    }

    pub fn complete(&self, key: &str, summary: CycleSummary) -> Result<(), StoreError> {
        self.update(key, |record| {
            record.status = CycleStatus::Completed;
            record.finished_at = Some(Utc::now());
            record.summary = Some(summary.clone());
        })
    }

    pub fn fail(&self, key: &str, error: &str) -> Result<(), StoreError> {
        self.update(key, |record| {
            record.status = CycleStatus::Failed;
            record.finished_at = Some(Utc::now());
            record.error = Some(error.to_string());
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<CycleInstanceRecord>, StoreError> {
        self.store.get::<CyclesTable>(&key.to_string())
    }

    fn update(
        &self,
        key: &str,
        mutate: impl Fn(&mut CycleInstanceRecord),
    ) -> Result<(), StoreError> {
        if let Some(mut record) = self.store.get::<CyclesTable>(&key.to_string())? {
            mutate(&mut record);
            self.store.put::<CyclesTable>(&key.to_string(), &record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_truncate_to_interval() {
        let ts = Utc.with_ymd_and_hms(2026, 2, 5, 14, 37, 42).unwrap();
        let bucket = truncate_to_interval(ts, 5);
        assert_eq!(bucket, Utc.with_ymd_and_hms(2026, 2, 5, 14, 35, 0).unwrap());
    }

    #[test]
    fn test_decision_gate_every_third_tick() {
        let gate = |minute: u32| {
            let ts = Utc.with_ymd_and_hms(2026, 2, 5, 14, minute, 0).unwrap();
            is_decision_minute(ts, 15)
        };

        assert!(gate(0));
        assert!(!gate(5));
        assert!(!gate(10));
        assert!(gate(15));
        assert!(!gate(20));
    }

    #[test]
    fn test_key_namespaces_do_not_collide() {
        let ts = Utc.with_ymd_and_hms(2026, 2, 5, 14, 35, 12).unwrap();
        let scheduled = scheduled_key(truncate_to_interval(ts, 5));
        let manual = manual_key(ts);

        assert_eq!(scheduled, "market-cycle-20260205-1435");
        assert_eq!(manual, "market-cycle-manual-20260205-143512");
    }

    #[test]
    fn test_batch_id_is_deterministic_per_key() {
        let a = batch_id_for("market-cycle-20260205-1435");
        let b = batch_id_for("market-cycle-20260205-1435");
        let c = batch_id_for("market-cycle-manual-20260205-143512");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.get_version_num(), 5);
    }

    #[tokio::test]
    async fn test_second_start_for_same_bucket_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TypedStore::open(dir.path()).unwrap());
        let instances = InstanceStore::new(store);

        let first = instances.try_begin("market-cycle-20260205-1435").await.unwrap();
        assert!(first.is_some());

        let second = instances.try_begin("market-cycle-20260205-1435").await.unwrap();
        assert!(second.is_none());

        let record = instances.get("market-cycle-20260205-1435").unwrap().unwrap();
        assert!(record.status.is_in_flight());
    }

    #[tokio::test]
    async fn test_completed_instance_is_never_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TypedStore::open(dir.path()).unwrap());
        let instances = InstanceStore::new(store);

        let key = "market-cycle-20260205-1440";
        instances.try_begin(key).await.unwrap();
        instances.mark_running(key).unwrap();
        instances
            .complete(
                key,
                CycleSummary {
                    batch_id: batch_id_for(key),
                    cycle_ts: Utc::now(),
                    snapshot_count: 0,
                    decision_cycle: false,
                    agents_run: 0,
                    agents_failed: 0,
                    trades_executed: 0,
                    duration_ms: 1,
                },
            )
            .unwrap();

        assert!(instances.try_begin(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_instance_may_retry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TypedStore::open(dir.path()).unwrap());
        let instances = InstanceStore::new(store);

        let key = "market-cycle-20260205-1445";
        instances.try_begin(key).await.unwrap();
        instances.fail(key, "ingestion failed").unwrap();

        assert!(instances.try_begin(key).await.unwrap().is_some());
    }
}
