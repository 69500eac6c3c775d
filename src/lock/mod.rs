//! Per-entity mutual exclusion
//!
//! The tiered store holds an entity's lock for the whole read-merge-write of
//! a persist, across every tier. Two implementations share one contract:
//!
//! - [`LocalLock`]: in-process, for a single writer process
//! - [`SharedLock`]: token-owned keys with a TTL in a shared cache, for
//!   writers spread over several processes
//!
//! `acquire` returning `Ok(None)` means "someone else holds it", which is not
//! an error; the caller decides whether to retry after [`Lock::delay`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::LockError;

pub mod local;
pub mod shared;

pub use local::LocalLock;
pub use shared::{InMemoryCache, SharedCache, SharedLock};

/// Proof of ownership returned by a successful acquire
///
/// Must be handed back to [`Lock::release`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Wrap an owner identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Owner identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Named exclusive lock
#[async_trait]
pub trait Lock: Send + Sync {
    /// Try to take `name`
    ///
    /// `Ok(None)` when it stays held by someone else.
    async fn acquire(&self, name: &str) -> Result<Option<LockToken>, LockError>;

    /// Give `name` back
    ///
    /// Fails if `token` is not the current owner.
    async fn release(&self, name: &str, token: LockToken) -> Result<(), LockError>;

    /// Unit of the linear backoff between acquisition attempts
    fn delay(&self) -> Duration;

    /// Short label for logs and metrics
    fn kind(&self) -> &'static str;
}

/// Which lock implementation to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    /// In-process lock
    #[default]
    Local,
    /// Shared-cache lock
    Shared,
}

/// Lock settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Implementation
    #[serde(default)]
    pub kind: LockKind,

    /// Local lock: waiters allowed per key before acquire gives up immediately
    #[serde(default = "default_max_waiters")]
    pub max_waiters: usize,

    /// Local lock: how long one acquire waits for the holder
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Shared lock: backoff unit between attempts
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Shared lock: key expiry
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Shared lock: key prefix
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_max_waiters() -> usize {
    1024
}

fn default_max_wait_ms() -> u64 {
    1000
}

fn default_delay_ms() -> u64 {
    50
}

fn default_ttl_secs() -> u64 {
    120
}

fn default_key_prefix() -> String {
    "rollup:lock:".to_string()
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            kind: LockKind::default(),
            max_waiters: default_max_waiters(),
            max_wait_ms: default_max_wait_ms(),
            delay_ms: default_delay_ms(),
            ttl_secs: default_ttl_secs(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl LockConfig {
    /// Local lock wait bound
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Shared lock backoff unit
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Shared lock expiry
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}
