//! Lock shared between processes through a cache
//!
//! Acquiring stores an owner token under the lock key only if the key is
//! absent, with a TTL so a crashed holder cannot wedge an entity forever.
//! Releasing deletes the key only if it still holds the caller's token. If it
//! does not, the TTL ran out mid-persist and another writer may have taken
//! the lock; that is reported as [`LockError::Stolen`] and never ignored.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::{Lock, LockConfig, LockToken};
use crate::error::LockError;
use crate::metrics::record_lock_failure;

/// Minimal cache contract the shared lock needs
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Store `value` under `key` for `ttl` unless the key exists
    ///
    /// Returns whether the value was stored.
    async fn add_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, LockError>;

    /// Delete `key` if it currently holds `expected`
    ///
    /// Returns whether the key was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, LockError>;
}

#[async_trait]
impl<C: SharedCache + ?Sized> SharedCache for Arc<C> {
    async fn add_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        (**self).add_if_absent(key, value, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, LockError> {
        (**self).compare_and_delete(key, expected).await
    }
}

/// Lock backed by a [`SharedCache`]
pub struct SharedLock<C> {
    cache: C,
    owner: Uuid,
    sequence: AtomicU64,
    key_prefix: String,
    ttl: Duration,
    delay: Duration,
}

impl<C: SharedCache> SharedLock<C> {
    /// Create a lock over `cache`
    pub fn new(cache: C, config: &LockConfig) -> Self {
        Self {
            cache,
            owner: Uuid::new_v4(),
            sequence: AtomicU64::new(0),
            key_prefix: config.key_prefix.clone(),
            ttl: config.ttl(),
            delay: config.delay(),
        }
    }

    /// Cache key guarding `name`
    pub fn key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }

    /// Lock expiry
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[async_trait]
impl<C: SharedCache> Lock for SharedLock<C> {
    async fn acquire(&self, name: &str) -> Result<Option<LockToken>, LockError> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let token = LockToken::new(format!("{}:{}", self.owner, seq));

        if self
            .cache
            .add_if_absent(&self.key(name), token.as_str(), self.ttl)
            .await?
        {
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    async fn release(&self, name: &str, token: LockToken) -> Result<(), LockError> {
        let key = self.key(name);
        if self.cache.compare_and_delete(&key, token.as_str()).await? {
            return Ok(());
        }

        record_lock_failure("stolen");
        tracing::error!(
            lock = name,
            key = %key,
            ttl_secs = self.ttl.as_secs(),
            "Lock expired and was taken by another owner before release"
        );
        Err(LockError::Stolen(name.to_string()))
    }

    fn delay(&self) -> Duration {
        self.delay
    }

    fn kind(&self) -> &'static str {
        "shared"
    }
}

/// Process-local [`SharedCache`] with TTL expiry
///
/// Stands in for the shared cache when every writer lives in one process,
/// and in tests.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Current live value of `key`
    pub fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.clone())
    }

    /// Number of stored keys, expired ones included until the next add
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no keys are stored
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Overwrite `key` unconditionally
    pub fn set(&self, key: &str, value: &str, ttl: Duration) {
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
    }
}

#[async_trait]
impl SharedCache for InMemoryCache {
    async fn add_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        // Keys left by crashed holders are never released
        entries.retain(|_, (_, expires)| *expires > now);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires)) if value == expected && *expires > now => {
                entries.remove(key);
                Ok(true)
            },
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_with(cache: Arc<InMemoryCache>, ttl_secs: u64) -> SharedLock<Arc<InMemoryCache>> {
        let config = LockConfig {
            ttl_secs,
            ..LockConfig::default()
        };
        SharedLock::new(cache, &config)
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive_across_owners() {
        let cache = Arc::new(InMemoryCache::new());
        let first = lock_with(Arc::clone(&cache), 120);
        let second = lock_with(Arc::clone(&cache), 120);

        let token = first.acquire("e1").await.unwrap().expect("free");
        assert!(second.acquire("e1").await.unwrap().is_none());
        assert_eq!(cache.get("rollup:lock:e1").as_deref(), Some(token.as_str()));

        first.release("e1", token).await.unwrap();
        assert!(cache.get("rollup:lock:e1").is_none());
        assert!(second.acquire("e1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_after_takeover_is_stolen() {
        let cache = Arc::new(InMemoryCache::new());
        let lock = lock_with(Arc::clone(&cache), 120);

        let token = lock.acquire("e1").await.unwrap().unwrap();
        // Simulate expiry followed by another owner taking the key
        cache.set("rollup:lock:e1", "someone-else", Duration::from_secs(120));

        let err = lock.release("e1", token).await.unwrap_err();
        assert_eq!(err, LockError::Stolen("e1".into()));
        assert_eq!(cache.get("rollup:lock:e1").as_deref(), Some("someone-else"));
    }

    #[tokio::test]
    async fn test_expired_key_can_be_taken() {
        let cache = Arc::new(InMemoryCache::new());
        cache.set("rollup:lock:e1", "crashed-owner", Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let lock = lock_with(Arc::clone(&cache), 120);
        assert!(lock.acquire("e1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_add_purges_expired_keys() {
        let cache = Arc::new(InMemoryCache::new());
        cache.set("rollup:lock:gone-1", "crashed", Duration::from_millis(1));
        cache.set("rollup:lock:gone-2", "crashed", Duration::from_millis(1));
        cache.set("rollup:lock:live", "holder", Duration::from_secs(120));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.len(), 3);

        let lock = lock_with(Arc::clone(&cache), 120);
        let token = lock.acquire("e1").await.unwrap().unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("rollup:lock:live").as_deref(), Some("holder"));

        lock.release("e1", token).await.unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_tokens_are_unique_per_acquire() {
        let cache = Arc::new(InMemoryCache::new());
        let lock = lock_with(cache, 120);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let a = rt.block_on(lock.acquire("a")).unwrap().unwrap();
        let b = rt.block_on(lock.acquire("b")).unwrap().unwrap();
        assert_ne!(a, b);
        assert_eq!(lock.delay(), Duration::from_millis(50));
    }
}
