//! Shared lock cache on Redis
//!
//! `SET key token NX PX ttl` takes the lock; a Lua compare-and-delete gives
//! it back only while it still holds the caller's token.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::connection::RedisPool;
use super::scripts::LuaScripts;
use crate::error::LockError;
use crate::lock::SharedCache;

/// [`SharedCache`] over a [`RedisPool`]
pub struct RedisSharedCache {
    pool: Arc<RedisPool>,
    scripts: LuaScripts,
}

impl RedisSharedCache {
    /// Cache on `pool`
    pub fn new(pool: Arc<RedisPool>) -> Self {
        Self {
            pool,
            scripts: LuaScripts::new(),
        }
    }
}

#[async_trait]
impl SharedCache for RedisSharedCache {
    async fn add_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let reply: Option<String> = self
            .pool
            .execute(|mut conn| async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn)
                    .await
            })
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, LockError> {
        let script = self.scripts.compare_and_delete();
        let deleted: i64 = self
            .pool
            .execute(|mut conn| {
                let script = Arc::clone(&script);
                async move { script.key(key).arg(expected).invoke_async(&mut conn).await }
            })
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(deleted == 1)
    }
}

impl std::fmt::Debug for RedisSharedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSharedCache")
            .field("pool", &self.pool)
            .finish()
    }
}
