//! Storage layer for tiered metric summaries
//!
//! A bucket store keeps, per entity and per tier, an ordered set of buckets
//! keyed by their aligned start. The tiered store keeps every tier consistent
//! on each write and plans reads across tiers.
//!
//! ```text
//! persist ──▶ BufferedStore (optional) ──▶ TieredStore ──▶ BucketStore
//!                                           │   │            (memory / redis)
//!                                  Lock ◀───┘   └──▶ QueryOptimizer
//! ```
//!
//! # Key Components
//!
//! - **BucketStore**: Backend contract (ordered bucket reads, batched writes)
//! - **MemoryBucketStore**: In-process backend
//! - **TieredStore**: Lock-guarded read-merge-write and planned reads
//! - **BufferedStore**: Per-slice write buffer in front of any `DataStore`

use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};

use crate::error::{Result, StorageError};
use crate::metric::{EntityMeta, Metrics, RecordType, Timeslice};
use crate::metric::Number;
use crate::types::{Period, Timestamp};

/// Buffered write path
pub mod buffered;
/// In-memory bucket store
pub mod memory;
/// Tier orchestration
pub mod tiered;

pub use buffered::{BufferConfig, BufferedStore};
pub use memory::MemoryBucketStore;
pub use tiered::{StoreConfig, TieredStore};

/// Stored fields of a bucket, without record types
pub type BucketFields = HashMap<String, Number>;

/// One stored bucket
#[derive(Debug, Clone, PartialEq)]
pub struct BucketRecord {
    /// Aligned bucket start
    pub key: Timestamp,
    /// Metric values
    pub fields: BucketFields,
}

impl BucketRecord {
    /// Strip record types off `metrics` for storage
    pub fn from_metrics(key: Timestamp, metrics: &Metrics) -> Self {
        Self {
            key,
            fields: metrics
                .iter()
                .map(|(name, metric)| (name.clone(), metric.value))
                .collect(),
        }
    }
}

/// Everything one persist writes, applied together
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    /// New bucket values per tier
    pub buckets: BTreeMap<Period, Vec<BucketRecord>>,
    /// Metric names to register in the entity meta
    pub meta: Vec<(String, RecordType)>,
}

impl WriteBatch {
    /// Empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a bucket write
    pub fn put(&mut self, period: Period, record: BucketRecord) {
        self.buckets.entry(period).or_default().push(record);
    }

    /// Total staged buckets
    pub fn bucket_count(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    /// True if nothing is staged
    pub fn is_empty(&self) -> bool {
        self.meta.is_empty() && self.bucket_count() == 0
    }
}

/// Backend holding buckets and entity meta
///
/// Reads return buckets ordered by key. A batch must become visible to
/// readers as a whole.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Buckets of `period` whose key lies in `[start, end]`, ascending
    async fn read_bucket_range(
        &self,
        entity: &str,
        period: Period,
        start: Timestamp,
        end: Timestamp,
    ) -> std::result::Result<Vec<BucketRecord>, StorageError>;

    /// Registered metric types of `entity` (empty if unknown)
    async fn read_meta(&self, entity: &str) -> std::result::Result<EntityMeta, StorageError>;

    /// Apply a batch of bucket writes and meta registrations
    async fn write_batch(
        &self,
        entity: &str,
        batch: WriteBatch,
    ) -> std::result::Result<(), StorageError>;

    /// Every entity with stored data
    async fn entities(&self) -> std::result::Result<Vec<String>, StorageError>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// Read and write surface offered to ingestion and query callers
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Record `metrics` for `entity` at `timestamp` in every tier
    async fn persist(&self, entity: &str, timestamp: Timestamp, metrics: &Metrics) -> Result<()>;

    /// Summary of everything recorded for `entity` in `[start, end]`
    async fn find(&self, entity: &str, start: Timestamp, end: Timestamp) -> Result<Metrics>;

    /// The `period` bucket containing `instant`
    async fn find_period_at(
        &self,
        entity: &str,
        period: Period,
        instant: Timestamp,
    ) -> Result<Vec<Timeslice>>;

    /// Non-empty `period` buckets between `start` and `end`, ascending
    async fn find_period(
        &self,
        entity: &str,
        period: Period,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Timeslice>>;

    /// Every `period` bucket between `start` and `end`, empty ones included
    async fn slices(
        &self,
        entity: &str,
        period: Period,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Timeslice>>;

    /// Entity ids with stored data, optionally filtered, sorted
    async fn entities(&self, pattern: Option<&Regex>) -> Result<Vec<String>>;
}
