//! Tiered store: keeps every summary tier consistent on each write
//!
//! # Write protocol
//!
//! A persist holds the entity lock for the whole multi-tier update:
//!
//! 1. Acquire the entity lock, retrying with linear backoff
//! 2. Load the entity meta and stage registrations for new metric names
//! 3. Read the bucket containing the timestamp in every tier
//! 4. Merge the incoming metrics into each bucket
//! 5. Write all buckets and registrations as one batch
//! 6. Release the lock
//!
//! A type conflict is detected in step 2, so a rejected write leaves every
//! tier untouched.
//!
//! # Reads
//!
//! Range reads go through the [`QueryOptimizer`], which turns an arbitrary
//! range into a few aligned bucket ranges spread over the tiers. Period reads
//! hit one tier directly.

use async_trait::async_trait;
use futures::future::try_join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use super::{BucketRecord, BucketStore, DataStore, WriteBatch};
use crate::error::{Error, LockError, Result, StorageError, ValidationError};
use crate::fail_fast::FastFailCheck;
use crate::lock::{Lock, LockToken};
use crate::metric::{is_reserved_name, Metrics, Timeslice};
use crate::metrics::{
    record_backend_error, record_find, record_lock_failure, record_persist, LOCK_ACQUIRE_DURATION,
};
use crate::query::{QueryOptimizer, SlicePlan};
use crate::types::{DateRange, Direction, Period, Timestamp};

/// Tier and write-protocol settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Tiers summarized on every write
    #[serde(default = "default_supported_periods")]
    pub supported_periods: Vec<Period>,

    /// Lock acquisition attempts per persist
    #[serde(default = "default_max_lock_retries")]
    pub max_lock_retries: u32,
}

fn default_supported_periods() -> Vec<Period> {
    vec![Period::Hourly, Period::Daily, Period::Monthly, Period::Yearly]
}

fn default_max_lock_retries() -> u32 {
    5
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            supported_periods: default_supported_periods(),
            max_lock_retries: default_max_lock_retries(),
        }
    }
}

/// Lock held for one persist
///
/// Released explicitly on the normal path. If the persist future is dropped
/// mid-flight the release is handed to the runtime so the entity does not
/// stay locked.
struct HeldLock {
    lock: Arc<dyn Lock>,
    name: String,
    token: Option<LockToken>,
}

impl HeldLock {
    async fn release(mut self) -> std::result::Result<(), LockError> {
        match self.token.take() {
            Some(token) => self.lock.release(&self.name, token).await,
            None => Ok(()),
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let lock = Arc::clone(&self.lock);
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lock.release(&name, token).await {
                        warn!(entity = %name, error = %e, "Failed to release abandoned lock");
                    }
                });
            },
            Err(_) => {
                warn!(entity = %name, "Persist abandoned outside a runtime, lock left to expire");
            },
        }
    }
}

/// Multi-tier store over a [`BucketStore`]
pub struct TieredStore {
    backend: Arc<dyn BucketStore>,
    lock: Arc<dyn Lock>,
    fail_check: Arc<FastFailCheck>,
    optimizer: QueryOptimizer,
    max_lock_retries: u32,
}

impl TieredStore {
    /// Build a store
    ///
    /// Fails if `config` names no tier other than `Realtime`.
    pub fn new(
        backend: Arc<dyn BucketStore>,
        lock: Arc<dyn Lock>,
        fail_check: Arc<FastFailCheck>,
        config: &StoreConfig,
    ) -> std::result::Result<Self, ValidationError> {
        let optimizer = QueryOptimizer::new(&config.supported_periods)?;
        Ok(Self {
            backend,
            lock,
            fail_check,
            optimizer,
            max_lock_retries: config.max_lock_retries.max(1),
        })
    }

    /// Store over a fresh in-memory backend with an in-process lock
    pub fn in_memory(config: &StoreConfig) -> std::result::Result<Self, ValidationError> {
        Self::new(
            Arc::new(super::MemoryBucketStore::new()),
            Arc::new(crate::lock::LocalLock::default()),
            Arc::new(FastFailCheck::new(Default::default())),
            config,
        )
    }

    /// Summarized tiers, coarsest first
    pub fn supported_periods(&self) -> &[Period] {
        self.optimizer.supported()
    }

    /// Read plan for a range
    pub fn plan(&self, start: Timestamp, end: Timestamp) -> Result<SlicePlan> {
        Ok(self.optimizer.optimal_slices(start, end)?)
    }

    /// The breaker this store reports to
    pub fn fail_check(&self) -> &Arc<FastFailCheck> {
        &self.fail_check
    }

    fn validate(entity: &str, metrics: &Metrics) -> std::result::Result<(), ValidationError> {
        if is_reserved_name(entity) {
            return Err(ValidationError::ReservedEntity(entity.to_string()));
        }
        if let Some(name) = metrics.names().find(|name| is_reserved_name(name)) {
            return Err(ValidationError::ReservedMetric(name.to_string()));
        }
        Ok(())
    }

    fn backend_failed(&self, operation: &'static str, e: StorageError) -> Error {
        record_backend_error(operation);
        self.fail_check.mark_failure(&e);
        e.into()
    }

    fn lock_failed(&self, operation: &'static str, e: LockError) -> Error {
        if matches!(e, LockError::Backend(_)) {
            record_backend_error(operation);
            self.fail_check.mark_failure(&e);
        }
        e.into()
    }

    async fn acquire(&self, entity: &str) -> Result<HeldLock> {
        let started = Instant::now();
        let delay = self.lock.delay();

        for attempt in 1..=self.max_lock_retries {
            match self.lock.acquire(entity).await {
                Ok(Some(token)) => {
                    LOCK_ACQUIRE_DURATION
                        .with_label_values(&[self.lock.kind()])
                        .observe(started.elapsed().as_secs_f64());
                    return Ok(HeldLock {
                        lock: Arc::clone(&self.lock),
                        name: entity.to_string(),
                        token: Some(token),
                    });
                },
                Ok(None) => {
                    debug!(entity, attempt, "Entity lock contended");
                    record_lock_failure("contended");
                    if attempt < self.max_lock_retries {
                        tokio::time::sleep(delay * attempt).await;
                    }
                },
                Err(e) => return Err(self.lock_failed("lock_acquire", e)),
            }
        }

        record_lock_failure("retries_exhausted");
        warn!(entity, attempts = self.max_lock_retries, "Giving up on entity lock");
        Err(LockError::RetriesExhausted {
            name: entity.to_string(),
            attempts: self.max_lock_retries,
        }
        .into())
    }

    async fn persist_locked(
        &self,
        entity: &str,
        timestamp: Timestamp,
        metrics: &Metrics,
    ) -> Result<()> {
        let mut meta = self
            .backend
            .read_meta(entity)
            .await
            .map_err(|e| self.backend_failed("read_meta", e))?;

        let registrations = meta.stage(entity, metrics)?;
        for (name, record_type) in &registrations {
            meta.insert(name.clone(), *record_type);
        }

        let reads = self.supported_periods().iter().map(|&period| {
            let key = DateRange::align(period, timestamp).start;
            async move {
                self.backend
                    .read_bucket_range(entity, period, key, key)
                    .await
                    .map(|records| (period, key, records))
            }
        });
        let existing = try_join_all(reads)
            .await
            .map_err(|e| self.backend_failed("read_bucket", e))?;

        let mut batch = WriteBatch::new();
        batch.meta = registrations;
        for (period, key, records) in existing {
            let mut bucket = meta.hydrate(records.into_iter().flat_map(|r| r.fields));
            bucket.merge(metrics)?;
            batch.put(period, BucketRecord::from_metrics(key, &bucket));
        }

        let buckets = batch.bucket_count();
        self.backend
            .write_batch(entity, batch)
            .await
            .map_err(|e| self.backend_failed("write_batch", e))?;

        debug!(entity, timestamp, buckets, "Persisted metrics");
        Ok(())
    }

    async fn read_tier(
        &self,
        entity: &str,
        period: Period,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Timeslice>> {
        DateRange::new(start, end)?;
        self.fail_check.proceed_or_err()?;

        let tier = period
            .closest_supported(self.supported_periods(), Direction::Finer)
            .ok_or(ValidationError::NoSupportedPeriods)?;
        if tier != period {
            debug!(requested = %period, substitute = %tier, "Tier not summarized, reading a finer one");
        }

        let first = DateRange::align(period, start).start;
        let last = DateRange::align(period, end).end;

        let (meta, records) = futures::try_join!(
            self.backend.read_meta(entity),
            self.backend.read_bucket_range(entity, tier, first, last),
        )
        .map_err(|e| self.backend_failed("read_tier", e))?;
        self.fail_check.mark_success();

        let mut slices: BTreeMap<Timestamp, Timeslice> = BTreeMap::new();
        for record in records {
            let range = DateRange::align(period, record.key);
            let metrics = meta.hydrate(record.fields);
            match slices.get_mut(&range.start) {
                Some(slice) => slice.metrics.merge(&metrics)?,
                None => {
                    slices.insert(range.start, Timeslice::new(range, metrics));
                },
            }
        }
        Ok(slices.into_values().collect())
    }
}

#[async_trait]
impl DataStore for TieredStore {
    async fn persist(&self, entity: &str, timestamp: Timestamp, metrics: &Metrics) -> Result<()> {
        Self::validate(entity, metrics)?;
        if metrics.is_empty() {
            return Ok(());
        }
        self.fail_check.proceed_or_err()?;

        let started = Instant::now();
        let held = self.acquire(entity).await?;
        let outcome = self.persist_locked(entity, timestamp, metrics).await;
        let released = held.release().await;

        let result = match (outcome, released) {
            (Ok(()), Ok(())) => {
                self.fail_check.mark_success();
                Ok(())
            },
            (Ok(()), Err(e)) => {
                error!(entity, error = %e, "Persist written but lock release failed");
                Err(self.lock_failed("lock_release", e))
            },
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_error)) => {
                error!(entity, error = %release_error, "Lock release failed after persist error");
                Err(e)
            },
        };

        record_persist(started.elapsed().as_secs_f64(), result.is_ok());
        result
    }

    async fn find(&self, entity: &str, start: Timestamp, end: Timestamp) -> Result<Metrics> {
        let started = Instant::now();
        let plan = self.optimizer.optimal_slices(start, end)?;
        self.fail_check.proceed_or_err()?;

        let meta = self
            .backend
            .read_meta(entity)
            .await
            .map_err(|e| self.backend_failed("read_meta", e))?;

        let reads = plan.iter().flat_map(|(&period, ranges)| {
            ranges.iter().map(move |range| {
                self.backend
                    .read_bucket_range(entity, period, range.start, range.end)
            })
        });
        let results = try_join_all(reads)
            .await
            .map_err(|e| self.backend_failed("read_bucket_range", e))?;
        self.fail_check.mark_success();

        let mut total = Metrics::new();
        for record in results.into_iter().flatten() {
            total.merge(&meta.hydrate(record.fields))?;
        }

        record_find("range", started.elapsed().as_secs_f64());
        Ok(total)
    }

    async fn find_period_at(
        &self,
        entity: &str,
        period: Period,
        instant: Timestamp,
    ) -> Result<Vec<Timeslice>> {
        let started = Instant::now();
        let slices = self.read_tier(entity, period, instant, instant).await?;
        record_find("period", started.elapsed().as_secs_f64());
        Ok(slices)
    }

    async fn find_period(
        &self,
        entity: &str,
        period: Period,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Timeslice>> {
        let started = Instant::now();
        let slices = self.read_tier(entity, period, start, end).await?;
        record_find("period", started.elapsed().as_secs_f64());
        Ok(slices)
    }

    async fn slices(
        &self,
        entity: &str,
        period: Period,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Timeslice>> {
        let started = Instant::now();
        let range = DateRange::new(start, end)?;
        let mut found: BTreeMap<Timestamp, Timeslice> = self
            .read_tier(entity, period, start, end)
            .await?
            .into_iter()
            .map(|slice| (slice.range.start, slice))
            .collect();

        let filled = range
            .buckets(period)
            .map(|bucket| {
                found
                    .remove(&bucket.start)
                    .unwrap_or_else(|| Timeslice::new(bucket, Metrics::new()))
            })
            .collect();

        record_find("slices", started.elapsed().as_secs_f64());
        Ok(filled)
    }

    async fn entities(&self, pattern: Option<&Regex>) -> Result<Vec<String>> {
        let mut entities = self
            .backend
            .entities()
            .await
            .map_err(|e| self.backend_failed("entities", e))?;
        if let Some(pattern) = pattern {
            entities.retain(|entity| pattern.is_match(entity));
        }
        entities.sort();
        Ok(entities)
    }
}

impl std::fmt::Debug for TieredStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredStore")
            .field("backend", &self.backend.name())
            .field("lock", &self.lock.kind())
            .field("tiers", &self.supported_periods())
            .field("max_lock_retries", &self.max_lock_retries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fail_fast::FailFastConfig;
    use crate::lock::LocalLock;
    use crate::metric::{Metric, Number, RecordType};
    use crate::storage::MemoryBucketStore;
    use crate::types::parse_timestamp;
    use std::time::Duration;

    fn ts(s: &str) -> Timestamp {
        parse_timestamp(s).unwrap()
    }

    fn metrics(pairs: &[(&str, Metric)]) -> Metrics {
        pairs
            .iter()
            .map(|(name, metric)| (name.to_string(), *metric))
            .collect()
    }

    struct Fixture {
        backend: Arc<MemoryBucketStore>,
        lock: Arc<LocalLock>,
        store: TieredStore,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBucketStore::new());
        let lock = Arc::new(LocalLock::new(16, Duration::from_millis(20)));
        let store = TieredStore::new(
            backend.clone(),
            lock.clone(),
            Arc::new(FastFailCheck::new(FailFastConfig::default())),
            &StoreConfig::default(),
        )
        .unwrap();
        Fixture {
            backend,
            lock,
            store,
        }
    }

    #[tokio::test]
    async fn test_persist_updates_every_tier() {
        let f = fixture();
        let t = ts("2010-03-14T15:09:26Z");
        f.store
            .persist("e1", t, &metrics(&[("x", Metric::aggregate(1))]))
            .await
            .unwrap();

        for period in [Period::Hourly, Period::Daily, Period::Monthly, Period::Yearly] {
            let key = DateRange::align(period, t).start;
            let bucket = f.backend.bucket("e1", period, key).expect("bucket written");
            assert_eq!(bucket.get("x"), Some(&Number::Int(1)), "{period}");
        }
        assert_eq!(f.lock.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_repeated_persist_sums_aggregates() {
        let f = fixture();
        let t = ts("2010-03-14T15:09:26Z");
        f.store
            .persist("e1", t, &metrics(&[("x", Metric::aggregate(1))]))
            .await
            .unwrap();
        f.store
            .persist("e1", t + 1000, &metrics(&[("x", Metric::aggregate(2))]))
            .await
            .unwrap();

        let slices = f.store.find_period_at("e1", Period::Hourly, t).await.unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].range, DateRange::align(Period::Hourly, t));
        assert_eq!(slices[0].metrics.get("x"), Some(&Metric::aggregate(3)));
    }

    #[tokio::test]
    async fn test_absolute_keeps_last_write() {
        let f = fixture();
        let t = ts("2010-03-14T15:00:00Z");
        f.store
            .persist("e1", t, &metrics(&[("size", Metric::absolute(10))]))
            .await
            .unwrap();
        f.store
            .persist("e1", t + 60_000, &metrics(&[("size", Metric::absolute(7))]))
            .await
            .unwrap();

        let day = f.store.find_period_at("e1", Period::Daily, t).await.unwrap();
        assert_eq!(day[0].metrics.get("size"), Some(&Metric::absolute(7)));
    }

    #[tokio::test]
    async fn test_type_conflict_leaves_buckets_unchanged() {
        let f = fixture();
        let t = ts("2010-03-14T15:09:26Z");
        f.store
            .persist("e1", t, &metrics(&[("x", Metric::absolute(5))]))
            .await
            .unwrap();
        let writes = f.backend.stats().batches_written;

        let err = f
            .store
            .persist("e1", t, &metrics(&[("x", Metric::aggregate(1)), ("y", Metric::aggregate(1))]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::TypeConflict {
                registered: RecordType::Absolute,
                requested: RecordType::Aggregate,
                ..
            })
        ));

        assert_eq!(f.backend.stats().batches_written, writes);
        let key = DateRange::align(Period::Hourly, t).start;
        let bucket = f.backend.bucket("e1", Period::Hourly, key).unwrap();
        assert_eq!(bucket.get("x"), Some(&Number::Int(5)));
        assert!(bucket.get("y").is_none());
        assert_eq!(f.lock.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_reserved_names_are_rejected() {
        let f = fixture();
        let err = f
            .store
            .persist("__meta__", 0, &metrics(&[("x", Metric::aggregate(1))]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::ReservedEntity(_))));

        let err = f
            .store
            .persist("e1", 0, &metrics(&[("__x__", Metric::aggregate(1))]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::ReservedMetric(_))));
        assert_eq!(f.backend.stats().batches_written, 0);
    }

    #[tokio::test]
    async fn test_contended_lock_exhausts_retries() {
        let f = fixture();
        let held = f.lock.acquire("e1").await.unwrap().unwrap();

        let err = f
            .store
            .persist("e1", 0, &metrics(&[("x", Metric::aggregate(1))]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Lock(LockError::RetriesExhausted { attempts: 5, .. })
        ));
        assert!(err.is_retryable());
        assert_eq!(f.backend.stats().batches_written, 0);

        f.lock.release("e1", held).await.unwrap();
    }

    #[tokio::test]
    async fn test_backend_failure_opens_breaker() {
        let f = fixture();
        f.backend.fail_next_writes(1);

        let err = f
            .store
            .persist("e1", 0, &metrics(&[("x", Metric::aggregate(1))]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(f.store.fail_check().is_in_failure_mode());
        assert_eq!(f.lock.active_keys(), 0);

        let err = f
            .store
            .persist("e1", 0, &metrics(&[("x", Metric::aggregate(1))]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FailFast(_)));
    }

    #[tokio::test]
    async fn test_find_sums_across_tiers() {
        let f = fixture();
        let writes = [
            "2010-01-30T23:55:00Z",
            "2010-01-31T10:00:00Z",
            "2010-03-15T00:00:00Z",
            "2010-07-01T00:30:00Z",
            "2010-07-01T01:30:00Z",
        ];
        for w in writes {
            f.store
                .persist("e1", ts(w), &metrics(&[("x", Metric::aggregate(1))]))
                .await
                .unwrap();
        }

        let total = f
            .store
            .find("e1", ts("2010-01-30T23:50:00Z"), ts("2010-07-01T00:55:00Z"))
            .await
            .unwrap();
        assert_eq!(total.get("x"), Some(&Metric::aggregate(4)));

        let empty = f.store.find("nobody", 0, 1000).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_period_reads_finer_tier() {
        let f = fixture();
        let t = ts("2010-03-14T15:09:26Z");
        f.store
            .persist("e1", t, &metrics(&[("x", Metric::aggregate(1))]))
            .await
            .unwrap();
        f.store
            .persist("e1", ts("2010-03-16T01:00:00Z"), &metrics(&[("x", Metric::aggregate(2))]))
            .await
            .unwrap();

        let weeks = f.store.find_period_at("e1", Period::Weekly, t).await.unwrap();
        assert_eq!(weeks.len(), 1);
        assert_eq!(weeks[0].range, DateRange::align(Period::Weekly, t));
        assert_eq!(weeks[0].metrics.get("x"), Some(&Metric::aggregate(3)));

        let err = f
            .store
            .find_period_at("e1", Period::Minutely, t)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::NoSupportedPeriods)));
    }

    #[tokio::test]
    async fn test_slices_fill_empty_buckets() {
        let f = fixture();
        f.store
            .persist("e1", ts("2010-03-14T01:30:00Z"), &metrics(&[("x", Metric::aggregate(1))]))
            .await
            .unwrap();

        let slices = f
            .store
            .slices("e1", Period::Hourly, ts("2010-03-14T00:00:00Z"), ts("2010-03-14T03:59:59.999Z"))
            .await
            .unwrap();
        let counts: Vec<_> = slices.iter().map(|s| s.metrics.len()).collect();
        assert_eq!(counts, vec![0, 1, 0, 0]);
    }

    #[tokio::test]
    async fn test_entities_filtered_and_sorted() {
        let f = fixture();
        for entity in ["web-2", "db-1", "web-1"] {
            f.store
                .persist(entity, 0, &metrics(&[("x", Metric::aggregate(1))]))
                .await
                .unwrap();
        }

        assert_eq!(f.store.entities(None).await.unwrap(), vec!["db-1", "web-1", "web-2"]);
        let web = Regex::new("^web-").unwrap();
        assert_eq!(f.store.entities(Some(&web)).await.unwrap(), vec!["web-1", "web-2"]);
    }

    #[tokio::test]
    async fn test_reversed_range_is_rejected() {
        let f = fixture();
        let err = f.store.find("e1", 2000, 1000).await.unwrap_err();
        assert!(err.is_validation());
    }
}
