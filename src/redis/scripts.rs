//! Lua scripts for atomic Redis operations
//!
//! Scripts are compiled once and cached; `redis::Script` sends `EVALSHA` and
//! falls back to `EVAL` when the server has not seen the script yet.

use parking_lot::RwLock;
use redis::Script;
use std::collections::HashMap;
use std::sync::Arc;

/// Cache of the Lua scripts the store uses
#[derive(Default)]
pub struct LuaScripts {
    cache: RwLock<HashMap<&'static str, Arc<Script>>>,
}

impl LuaScripts {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create(&self, name: &'static str, lua: &str) -> Arc<Script> {
        if let Some(script) = self.cache.read().get(name) {
            return Arc::clone(script);
        }

        let mut cache = self.cache.write();
        Arc::clone(
            cache
                .entry(name)
                .or_insert_with(|| Arc::new(Script::new(lua))),
        )
    }

    /// Delete a key only while it still holds the expected value
    ///
    /// # Keys
    /// - KEYS[1]: lock key
    ///
    /// # Arguments
    /// - ARGV[1]: owner token
    ///
    /// # Returns
    /// - 1 if the key was deleted
    /// - 0 if it was missing or held another token
    pub fn compare_and_delete(&self) -> Arc<Script> {
        self.get_or_create(
            "compare_and_delete",
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
            "#,
        )
    }

    /// Number of cached scripts
    pub fn cached(&self) -> usize {
        self.cache.read().len()
    }
}
