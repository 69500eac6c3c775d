//! End-to-end tests of the tiered store over the in-memory backend
//!
//! Exercises the write protocol under concurrency with both lock flavours,
//! breaker recovery, and the write buffer in front of the store.

use std::sync::Arc;
use std::time::Duration;

use rollup_store::clock::{ManualClock, TimeService};
use rollup_store::error::{Error, ValidationError};
use rollup_store::lock::{InMemoryCache, LocalLock, Lock, LockConfig, SharedLock};
use rollup_store::query::query_count;
use rollup_store::storage::{BufferConfig, MemoryBucketStore};
use rollup_store::types::parse_timestamp;
use rollup_store::{
    BufferedStore, DataStore, DateRange, FailFastConfig, FastFailCheck, Metric, Metrics, Period,
    StoreConfig, TieredStore, Timestamp,
};

fn ts(s: &str) -> Timestamp {
    parse_timestamp(s).unwrap()
}

fn one(name: &str, metric: Metric) -> Metrics {
    let mut metrics = Metrics::new();
    metrics.insert(name, metric);
    metrics
}

fn store_with(
    backend: Arc<MemoryBucketStore>,
    lock: Arc<dyn Lock>,
    fail_check: Arc<FastFailCheck>,
    max_lock_retries: u32,
) -> TieredStore {
    let config = StoreConfig {
        max_lock_retries,
        ..StoreConfig::default()
    };
    TieredStore::new(backend, lock, fail_check, &config).unwrap()
}

fn breaker() -> Arc<FastFailCheck> {
    Arc::new(FastFailCheck::new(FailFastConfig::default()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_persists_lose_no_updates_with_local_lock() {
    let backend = Arc::new(MemoryBucketStore::new());
    let lock = Arc::new(LocalLock::new(128, Duration::from_secs(2)));
    let store = Arc::new(store_with(backend.clone(), lock.clone(), breaker(), 5));
    let t = ts("2010-03-14T15:09:26Z");

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .persist("e1", t + i * 1000, &one("hits", Metric::aggregate(1)))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    for period in [Period::Hourly, Period::Daily, Period::Monthly, Period::Yearly] {
        let slices = store.find_period_at("e1", period, t).await.unwrap();
        assert_eq!(
            slices[0].metrics.get("hits"),
            Some(&Metric::aggregate(32)),
            "{period}"
        );
    }
    assert_eq!(lock.active_keys(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_persists_lose_no_updates_with_shared_lock() {
    let backend = Arc::new(MemoryBucketStore::new());
    let cache = Arc::new(InMemoryCache::new());
    let config = LockConfig {
        delay_ms: 2,
        ..LockConfig::default()
    };
    let lock = Arc::new(SharedLock::new(cache.clone(), &config));
    let store = Arc::new(store_with(backend, lock.clone(), breaker(), 200));
    let t = ts("2010-03-14T15:09:26Z");

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for _ in 0..5 {
                    store
                        .persist("e1", t, &one("hits", Metric::aggregate(1)))
                        .await?;
                }
                Ok::<_, Error>(())
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let total = store
        .find("e1", ts("2010-01-01T00:00:00Z"), ts("2010-12-31T23:59:59.999Z"))
        .await
        .unwrap();
    assert_eq!(total.get("hits"), Some(&Metric::aggregate(20)));
    assert!(cache.get(&lock.key("e1")).is_none());
}

#[tokio::test]
async fn test_reference_range_read() {
    let store = TieredStore::in_memory(&StoreConfig::default()).unwrap();
    let start = ts("2010-01-30T23:50:00Z");
    let end = ts("2010-07-01T00:55:00Z");

    let plan = store.plan(start, end).unwrap();
    assert_eq!(plan[&Period::Hourly].len(), 2);
    assert_eq!(plan[&Period::Daily].len(), 1);
    assert_eq!(plan[&Period::Monthly].len(), 1);
    assert_eq!(query_count(&plan), 4);

    // Inside the range: one write per planned read
    for at in [
        "2010-01-30T23:59:00Z",
        "2010-01-31T12:00:00Z",
        "2010-04-10T08:00:00Z",
        "2010-07-01T00:10:00Z",
    ] {
        store
            .persist("e1", ts(at), &one("hits", Metric::aggregate(5)))
            .await
            .unwrap();
    }
    // Outside it
    store
        .persist("e1", ts("2010-07-01T03:00:00Z"), &one("hits", Metric::aggregate(100)))
        .await
        .unwrap();

    let total = store.find("e1", start, end).await.unwrap();
    assert_eq!(total.get("hits"), Some(&Metric::aggregate(20)));
}

#[tokio::test]
async fn test_mixed_record_types_summarize_independently() {
    let store = TieredStore::in_memory(&StoreConfig::default()).unwrap();
    let day = ts("2010-03-14T00:00:00Z");

    for hour in 0..3 {
        let mut metrics = Metrics::new();
        metrics.insert("requests", Metric::aggregate(10));
        metrics.insert("queue_depth", Metric::absolute(hour as f64));
        store
            .persist("e1", day + hour * 3_600_000, &metrics)
            .await
            .unwrap();
    }

    let daily = store.find_period_at("e1", Period::Daily, day).await.unwrap();
    assert_eq!(daily[0].range, DateRange::align(Period::Daily, day));
    assert_eq!(daily[0].metrics.get("requests"), Some(&Metric::aggregate(30)));
    assert_eq!(daily[0].metrics.get("queue_depth"), Some(&Metric::absolute(2.0)));

    let hourly = store
        .find_period("e1", Period::Hourly, day, day + 86_400_000 - 1)
        .await
        .unwrap();
    assert_eq!(hourly.len(), 3);
    assert!(hourly.windows(2).all(|w| w[0].range.start < w[1].range.start));
}

#[tokio::test]
async fn test_type_is_pinned_for_the_entity_lifetime() {
    let store = TieredStore::in_memory(&StoreConfig::default()).unwrap();
    store
        .persist("e1", 0, &one("x", Metric::absolute(1)))
        .await
        .unwrap();

    // Even a year later in another bucket
    let err = store
        .persist("e1", ts("1971-01-01T00:00:00Z"), &one("x", Metric::aggregate(1)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::TypeConflict { .. })
    ));

    // Other entities are unaffected
    store
        .persist("e2", 0, &one("x", Metric::aggregate(1)))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_breaker_opens_and_recovers() {
    let clock = Arc::new(ManualClock::new(1000));
    let fail_check = Arc::new(FastFailCheck::with_clock(
        FailFastConfig::default(),
        clock.clone(),
    ));
    let backend = Arc::new(MemoryBucketStore::new());
    let store = store_with(
        backend.clone(),
        Arc::new(LocalLock::default()),
        fail_check.clone(),
        5,
    );
    let metrics = one("hits", Metric::aggregate(1));

    backend.set_unavailable(true);
    let err = store.persist("e1", 0, &metrics).await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
    assert!(err.is_retryable());
    assert!(!fail_check.proceed());

    // The backend is back but the window is still open
    backend.set_unavailable(false);
    clock.set(2000);
    let err = store.persist("e1", 0, &metrics).await.unwrap_err();
    assert!(matches!(err, Error::FailFast(_)));
    assert_eq!(backend.stats().batches_written, 0);

    clock.set(2001);
    store.persist("e1", 0, &metrics).await.unwrap();
    assert!(!fail_check.is_in_failure_mode());

    let total = store.find("e1", 0, 3_600_000 - 1).await.unwrap();
    assert_eq!(total.get("hits"), Some(&Metric::aggregate(1)));
}

#[tokio::test]
async fn test_buffer_collapses_a_slice_into_one_write() {
    let backend = Arc::new(MemoryBucketStore::new());
    let inner: Arc<dyn DataStore> = Arc::new(store_with(
        backend.clone(),
        Arc::new(LocalLock::default()),
        breaker(),
        5,
    ));
    let clock = Arc::new(ManualClock::new(0));
    let buffer = BufferedStore::with_time(
        inner.clone(),
        &BufferConfig {
            enabled: true,
            granularity_ms: 60_000,
        },
        TimeService::new(clock.clone()),
    );

    for second in 0..10 {
        buffer
            .persist("e1", second * 1000, &one("hits", Metric::aggregate(1)))
            .await
            .unwrap();
    }
    assert_eq!(backend.stats().batches_written, 0);
    assert!(inner.find("e1", 0, 59_999).await.unwrap().is_empty());

    // The next slice pushes the first one out
    buffer
        .persist("e1", 61_000, &one("hits", Metric::aggregate(1)))
        .await
        .unwrap();
    assert_eq!(backend.stats().batches_written, 1);
    assert_eq!(
        inner.find("e1", 0, 59_999).await.unwrap().get("hits"),
        Some(&Metric::aggregate(10))
    );

    buffer.flush().await.unwrap();
    assert_eq!(buffer.pending_entities().await, 0);
    assert_eq!(
        inner.find("e1", 0, 3_599_999).await.unwrap().get("hits"),
        Some(&Metric::aggregate(11))
    );
}
