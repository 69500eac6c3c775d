//! In-memory bucket store
//!
//! Keeps every entity in a [`DashMap`] shard so different entities never
//! contend. A batch is applied while holding the entity's shard entry, which
//! makes it visible to readers as a whole.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use super::{BucketFields, BucketRecord, BucketStore, WriteBatch};
use crate::error::StorageError;
use crate::metric::EntityMeta;
use crate::types::{Period, Timestamp};

#[derive(Debug, Default)]
struct EntityData {
    tiers: BTreeMap<Period, BTreeMap<Timestamp, BucketFields>>,
    meta: EntityMeta,
}

/// Operation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    /// `read_bucket_range` calls
    pub range_reads: u64,
    /// `write_batch` calls that were applied
    pub batches_written: u64,
}

/// [`BucketStore`] held in process memory
///
/// Supports failure injection so callers can exercise the breaker.
#[derive(Debug, Default)]
pub struct MemoryBucketStore {
    entities: DashMap<String, EntityData>,
    unavailable: AtomicBool,
    failing_writes: AtomicUsize,
    range_reads: AtomicU64,
    batches_written: AtomicU64,
}

impl MemoryBucketStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a connection error until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `count` batch writes
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Stored fields of one bucket
    pub fn bucket(&self, entity: &str, period: Period, key: Timestamp) -> Option<BucketFields> {
        self.entities
            .get(entity)
            .and_then(|data| data.tiers.get(&period).and_then(|tier| tier.get(&key)).cloned())
    }

    /// Number of stored buckets of one tier
    pub fn bucket_count(&self, entity: &str, period: Period) -> usize {
        self.entities
            .get(entity)
            .and_then(|data| data.tiers.get(&period).map(BTreeMap::len))
            .unwrap_or(0)
    }

    /// Counters since creation
    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            range_reads: self.range_reads.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
        }
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Connection("memory store marked unavailable".into()));
        }
        Ok(())
    }

    fn take_injected_write_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn read_bucket_range(
        &self,
        entity: &str,
        period: Period,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<BucketRecord>, StorageError> {
        self.check_available()?;
        self.range_reads.fetch_add(1, Ordering::Relaxed);

        if start > end {
            return Ok(Vec::new());
        }
        let Some(data) = self.entities.get(entity) else {
            return Ok(Vec::new());
        };
        let Some(tier) = data.tiers.get(&period) else {
            return Ok(Vec::new());
        };

        Ok(tier
            .range(start..=end)
            .map(|(key, fields)| BucketRecord {
                key: *key,
                fields: fields.clone(),
            })
            .collect())
    }

    async fn read_meta(&self, entity: &str) -> Result<EntityMeta, StorageError> {
        self.check_available()?;
        Ok(self
            .entities
            .get(entity)
            .map(|data| data.meta.clone())
            .unwrap_or_default())
    }

    async fn write_batch(&self, entity: &str, batch: WriteBatch) -> Result<(), StorageError> {
        self.check_available()?;
        if self.take_injected_write_failure() {
            return Err(StorageError::Backend("injected write failure".into()));
        }
        if batch.is_empty() {
            return Ok(());
        }

        let mut data = self.entities.entry(entity.to_string()).or_default();
        for (name, record_type) in batch.meta {
            data.meta.insert(name, record_type);
        }
        for (period, records) in batch.buckets {
            let tier = data.tiers.entry(period).or_default();
            for record in records {
                tier.insert(record.key, record.fields);
            }
        }
        drop(data);

        self.batches_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn entities(&self) -> Result<Vec<String>, StorageError> {
        self.check_available()?;
        Ok(self.entities.iter().map(|entry| entry.key().clone()).collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
