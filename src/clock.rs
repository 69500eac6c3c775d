//! Time sources
//!
//! Components that make decisions based on wall-clock time take a
//! [`TimeService`], which wraps a pluggable [`Clock`] and never returns a
//! value earlier than one it already returned. A clock that steps backwards
//! (NTP correction, VM migration) therefore freezes time instead of
//! reopening windows that already elapsed.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::types::Timestamp;

/// A source of UTC milliseconds
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch
    fn now_millis(&self) -> Timestamp;
}

/// The system wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to
///
/// # Example
///
/// ```rust
/// use rollup_store::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new(1000);
/// clock.advance(500);
/// assert_eq!(clock.now_millis(), 1500);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Start at `now`
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    /// Jump to `now` (may go backwards)
    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move forward by `millis`
    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Monotonic-clamped view of a [`Clock`]
pub struct TimeService {
    source: Arc<dyn Clock>,
    last: AtomicI64,
}

impl TimeService {
    /// Wrap a clock
    pub fn new(source: Arc<dyn Clock>) -> Self {
        Self {
            source,
            last: AtomicI64::new(i64::MIN),
        }
    }

    /// Wrap the system clock
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// Current time, never earlier than any previous result
    pub fn current_time_millis(&self) -> Timestamp {
        let now = self.source.now_millis();
        let previous = self.last.fetch_max(now, Ordering::SeqCst);
        previous.max(now)
    }
}

impl Default for TimeService {
    fn default() -> Self {
        Self::system()
    }
}

impl std::fmt::Debug for TimeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeService")
            .field("last", &self.last.load(Ordering::Relaxed))
            .finish()
    }
}
