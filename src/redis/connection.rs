//! Redis connection pool with retry logic
//!
//! One multiplexed connection shared by all callers, with a semaphore
//! bounding in-flight commands, a per-command timeout and exponential
//! backoff on transient failures.
//!
//! # Example
//!
//! ```rust,no_run
//! use rollup_store::redis::{RedisConfig, RedisPool};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RedisConfig::with_url("redis://localhost:6379").pool_size(32);
//! let pool = RedisPool::new(config).await?;
//! assert!(pool.health_check().await);
//! # Ok(())
//! # }
//! ```

use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, warn};

use super::util::safe_redis_error;
use crate::error::StorageError;

/// Redis settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Use Redis for buckets and the shared lock
    #[serde(default)]
    pub enabled: bool,

    /// Server URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_url")]
    pub url: String,

    /// Commands allowed in flight at once
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Timeout for establishing the connection
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Timeout for one command
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Retries of a failed command
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Prefix of every key written
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_pool_size() -> u32 {
    16
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

fn default_command_timeout_ms() -> u64 {
    1000
}

fn default_key_prefix() -> String {
    "rollup".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_url(),
            pool_size: default_pool_size(),
            connection_timeout_ms: default_connection_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            retry_policy: RetryPolicy::default(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl RedisConfig {
    /// Create a new config with the specified URL
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            enabled: true,
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the pool size
    pub fn pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the command timeout
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the key prefix
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Connection timeout
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Per-command timeout
    pub fn command_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }
        if self.pool_size == 0 {
            return Err("Pool size must be greater than 0".to_string());
        }
        if self.pool_size > 1000 {
            return Err("Pool size cannot exceed 1000".to_string());
        }
        if self.command_timeout_ms == 0 {
            return Err("Command timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Retry policy with exponential backoff
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound on the delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Add up to 25% random jitter to delays
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-indexed), doubling each time
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * 2f64.powi(attempt.min(62) as i32);
        let delay_ms = base.min(self.max_delay_ms as f64);

        let delay_ms = if self.jitter {
            delay_ms * (1.0 + rand::random::<f64>() * 0.25)
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms as u64)
    }

    /// Check if we should retry after the given attempt
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Command counters
#[derive(Debug, Default)]
pub struct PoolMetrics {
    connections_created: AtomicU64,
    connection_failures: AtomicU64,
    commands_executed: AtomicU64,
    command_failures: AtomicU64,
    retries: AtomicU64,
    total_latency_us: AtomicU64,
}

impl PoolMetrics {
    fn record_command(&self, latency: Duration) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of the metrics
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        let executed = self.commands_executed.load(Ordering::Relaxed);
        let total = self.total_latency_us.load(Ordering::Relaxed);
        PoolMetricsSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            commands_executed: executed,
            command_failures: self.command_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            average_latency_us: if executed == 0 {
                0.0
            } else {
                total as f64 / executed as f64
            },
        }
    }
}

/// Snapshot of pool metrics at a point in time
#[derive(Debug, Clone)]
pub struct PoolMetricsSnapshot {
    /// Connections established
    pub connections_created: u64,
    /// Failed connection attempts
    pub connection_failures: u64,
    /// Commands that succeeded
    pub commands_executed: u64,
    /// Command attempts that failed
    pub command_failures: u64,
    /// Retries made
    pub retries: u64,
    /// Average command latency in microseconds
    pub average_latency_us: f64,
}

/// Redis connection pool
pub struct RedisPool {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    config: RedisConfig,
    metrics: Arc<PoolMetrics>,
    semaphore: Arc<Semaphore>,
}

impl RedisPool {
    /// Connect to the configured server
    pub async fn new(config: RedisConfig) -> Result<Self, StorageError> {
        config.validate().map_err(StorageError::Connection)?;

        let client = Client::open(config.url.as_str())
            .map_err(|e| StorageError::Connection(safe_redis_error(&config.url, &e)))?;

        let pool = Self {
            client,
            connection: RwLock::new(None),
            semaphore: Arc::new(Semaphore::new(config.pool_size as usize)),
            config,
            metrics: Arc::new(PoolMetrics::default()),
        };
        pool.connect().await?;

        debug!("Redis connection pool initialized");
        Ok(pool)
    }

    async fn connect(&self) -> Result<MultiplexedConnection, StorageError> {
        let start = Instant::now();

        let conn = tokio::time::timeout(
            self.config.connection_timeout(),
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            self.metrics.connection_failures.fetch_add(1, Ordering::Relaxed);
            StorageError::Timeout("Redis connection".to_string())
        })?
        .map_err(|e| {
            self.metrics.connection_failures.fetch_add(1, Ordering::Relaxed);
            StorageError::Connection(safe_redis_error(&self.config.url, &e))
        })?;

        *self.connection.write().await = Some(conn.clone());
        self.metrics.connections_created.fetch_add(1, Ordering::Relaxed);

        debug!(elapsed = ?start.elapsed(), "Redis connection established");
        Ok(conn)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StorageError> {
        let current = self.connection.read().await.clone();
        match current {
            Some(conn) => Ok(conn),
            None => self.connect().await,
        }
    }

    /// Run a command with the timeout and retry policy applied
    ///
    /// `f` may be called several times, so it must be safe to repeat.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| StorageError::Connection("Redis pool closed".to_string()))?;

        let mut attempt = 0;
        loop {
            let conn = self.connection().await?;
            let start = Instant::now();
            let result = tokio::time::timeout(self.config.command_timeout_duration(), f(conn)).await;

            let failure = match result {
                Ok(Ok(value)) => {
                    self.metrics.record_command(start.elapsed());
                    return Ok(value);
                },
                Ok(Err(e)) => {
                    if !is_retriable_error(&e) || !self.config.retry_policy.should_retry(attempt) {
                        self.metrics.command_failures.fetch_add(1, Ordering::Relaxed);
                        return Err(map_redis_error(&self.config.url, &e));
                    }
                    if is_connection_error(&e) {
                        *self.connection.write().await = None;
                    }
                    safe_redis_error(&self.config.url, &e)
                },
                Err(_) => {
                    if !self.config.retry_policy.should_retry(attempt) {
                        self.metrics.command_failures.fetch_add(1, Ordering::Relaxed);
                        return Err(StorageError::Timeout("Redis command".to_string()));
                    }
                    "command timeout".to_string()
                },
            };

            self.metrics.command_failures.fetch_add(1, Ordering::Relaxed);
            self.metrics.retries.fetch_add(1, Ordering::Relaxed);
            let delay = self.config.retry_policy.delay_for_attempt(attempt);
            warn!(attempt = attempt + 1, delay = ?delay, error = %failure, "Redis command failed, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// PING the server
    pub async fn health_check(&self) -> bool {
        self.execute(|mut conn| async move { redis::cmd("PING").query_async::<String>(&mut conn).await })
            .await
            .is_ok()
    }

    /// Get pool metrics
    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Get the pool configuration
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }
}

impl std::fmt::Debug for RedisPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPool")
            .field("url", &super::util::sanitize_url(&self.config.url))
            .field("pool_size", &self.config.pool_size)
            .finish()
    }
}

fn map_redis_error(url: &str, e: &RedisError) -> StorageError {
    if is_connection_error(e) {
        StorageError::Connection(safe_redis_error(url, e))
    } else if e.is_timeout() {
        StorageError::Timeout(safe_redis_error(url, e))
    } else {
        StorageError::Backend(safe_redis_error(url, e))
    }
}

fn is_retriable_error(e: &RedisError) -> bool {
    is_connection_error(e)
        || e.is_timeout()
        || matches!(
            e.kind(),
            redis::ErrorKind::BusyLoadingError | redis::ErrorKind::TryAgain
        )
}

fn is_connection_error(e: &RedisError) -> bool {
    e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error()
}
