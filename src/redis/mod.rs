//! Redis backend for buckets and the shared entity lock
//!
//! # Architecture
//!
//! ```text
//! Redis Schema (prefix "rollup"):
//! rollup:entities                      → SET of entity ids
//! rollup:e:{entity}:meta               → HASH metric → record type
//! rollup:e:{entity}:{period}:index     → ZSET of bucket starts
//! rollup:e:{entity}:{period}:{start}   → HASH metric → JSON number
//! rollup:lock:{entity}                 → owner token with TTL
//! ```
//!
//! # Features
//!
//! - Connection pooling with timeouts and retry
//! - One `MULTI`/`EXEC` pipeline per persist
//! - Token-checked lock release via Lua

pub mod cache;
pub mod connection;
pub mod scripts;
pub mod store;
pub mod util;

pub use cache::RedisSharedCache;
pub use connection::{RedisConfig, RedisPool, RetryPolicy};
pub use scripts::LuaScripts;
pub use store::RedisBucketStore;
