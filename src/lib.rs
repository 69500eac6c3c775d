//! Rollup Store - tiered, pre-aggregated metrics for entities
//!
//! Every write for an entity is folded into summary buckets at each
//! configured granularity (hourly, daily, monthly, yearly by default), so a
//! read over any date range touches a handful of buckets instead of raw
//! samples.
//!
//! This library provides:
//! - Calendar-aligned periods and date ranges
//! - Typed metrics that sum (AGGREGATE) or replace (ABSOLUTE)
//! - A query optimizer mapping a range onto the fewest stored buckets
//! - Per-entity locking, local or through a shared cache
//! - A fail-fast circuit breaker and a watchdog driving pausable workers
//! - In-memory and Redis bucket backends
//!
//! ```rust
//! use rollup_store::{DataStore, Metric, Metrics, TieredStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> rollup_store::Result<()> {
//! let store = TieredStore::in_memory(&Default::default())?;
//!
//! let mut metrics = Metrics::new();
//! metrics.insert("requests", Metric::aggregate(1));
//! store.persist("web-1", 1_278_000_000_000, &metrics).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod error;
pub mod fail_fast;
pub mod lock;
pub mod metric;
pub mod types;

/// Configuration management with TOML support
pub mod config;

/// Tracing subscriber setup
pub mod logging;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Read planning across summary tiers
pub mod query;

/// Bucket backends and the tiered store built on them
pub mod storage;

/// Redis bucket backend and shared lock cache
pub mod redis;

/// Pausable ingest worker fed from a channel
pub mod ingestion;

/// Service lifecycle and the watchdog
pub mod services;

// Re-export main types
pub use error::{Error, Result};
pub use fail_fast::{FailFastConfig, FastFailCheck};
pub use metric::{EntityMeta, Metric, Metrics, Number, RecordType, Timeslice};
pub use query::QueryOptimizer;
pub use storage::{BufferedStore, DataStore, StoreConfig, TieredStore};
pub use types::{DateRange, Direction, Period, Timestamp};
