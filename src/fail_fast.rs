//! Fail-fast circuit breaker
//!
//! Backend calls report their outcome here. After a failure the breaker
//! refuses work for a backoff window that doubles with every consecutive
//! failure, up to a ceiling:
//!
//! ```text
//!            mark_failure (window = min(initial * m, max), m *= 2)
//!   ┌────────┐ ───────────────────────────────▶ ┌────────────┐
//!   │ normal │                                  │ in failure │◀─┐
//!   └────────┘ ◀─────────────────────────────── └─────┬──────┘  │ mark_failure
//!                 mark_success (m = 1)                └─────────┘
//! ```
//!
//! Once the window has elapsed `proceed()` answers `true` again while the
//! breaker stays in failure mode. That is a tentative green light: the next
//! outcome either closes the breaker or opens a longer window.
//!
//! One instance is shared by `Arc` between the store, the ingest workers and
//! the watchdog.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, TimeService};
use crate::error::FailFastError;
use crate::metrics::FAIL_FAST_TRANSITIONS;
use crate::types::Timestamp;

/// Breaker backoff settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailFastConfig {
    /// First backoff window in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Ceiling for the backoff window in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for FailFastConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl FailFastConfig {
    /// Initial window as a duration
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Maximum window as a duration
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug)]
struct BreakerState {
    in_failure_mode: bool,
    fail_fast_until: Timestamp,
    backoff_multiplier: u64,
    last_cause: Option<String>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            in_failure_mode: false,
            fail_fast_until: 0,
            backoff_multiplier: 1,
            last_cause: None,
        }
    }
}

/// Point-in-time view of the breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailFastStatus {
    /// Whether a failure has been recorded since the last success
    pub in_failure_mode: bool,
    /// End of the current backoff window
    pub fail_fast_until: Timestamp,
    /// Multiplier the next failure will use
    pub backoff_multiplier: u64,
    /// Description of the last failure
    pub last_cause: Option<String>,
}

/// Circuit breaker with exponential backoff
pub struct FastFailCheck {
    config: FailFastConfig,
    time: TimeService,
    state: Mutex<BreakerState>,
}

impl FastFailCheck {
    /// Breaker on the system clock
    pub fn new(config: FailFastConfig) -> Self {
        Self::with_time(config, TimeService::system())
    }

    /// Breaker on a custom clock
    pub fn with_clock(config: FailFastConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_time(config, TimeService::new(clock))
    }

    fn with_time(config: FailFastConfig, time: TimeService) -> Self {
        Self {
            config,
            time,
            state: Mutex::new(BreakerState::closed()),
        }
    }

    /// Record a failure and open (or widen) the backoff window
    pub fn mark_failure(&self, cause: &dyn Display) {
        let now = self.time.current_time_millis();
        let cause = cause.to_string();

        let (delay, until) = {
            let mut state = self.state.lock();
            let delay = self
                .config
                .initial_backoff_ms
                .saturating_mul(state.backoff_multiplier)
                .min(self.config.max_backoff_ms);
            state.in_failure_mode = true;
            state.fail_fast_until = now.saturating_add(delay as i64);
            state.backoff_multiplier = state.backoff_multiplier.saturating_mul(2);
            state.last_cause = Some(cause.clone());
            (delay, state.fail_fast_until)
        };

        FAIL_FAST_TRANSITIONS.with_label_values(&["open"]).inc();
        tracing::error!(
            backoff_ms = delay,
            fail_fast_until = until,
            cause = %cause,
            "Backend failure, failing fast"
        );
    }

    /// Record a success, closing the breaker if it was open
    pub fn mark_success(&self) {
        let was_failing = {
            let mut state = self.state.lock();
            if state.in_failure_mode {
                *state = BreakerState::closed();
                true
            } else {
                false
            }
        };

        if was_failing {
            FAIL_FAST_TRANSITIONS.with_label_values(&["closed"]).inc();
            tracing::info!("Backend recovered, leaving fail-fast mode");
        }
    }

    /// Whether work may be attempted now
    pub fn proceed(&self) -> bool {
        let now = self.time.current_time_millis();
        let state = self.state.lock();
        !state.in_failure_mode || state.fail_fast_until < now
    }

    /// Like [`proceed`](Self::proceed), but with the remaining wait as an error
    pub fn proceed_or_err(&self) -> Result<(), FailFastError> {
        let now = self.time.current_time_millis();
        let state = self.state.lock();
        if !state.in_failure_mode || state.fail_fast_until < now {
            return Ok(());
        }
        Err(FailFastError::Open {
            remaining_ms: state.fail_fast_until - now,
            cause: state.last_cause.clone(),
        })
    }

    /// Whether a failure has been recorded since the last success
    pub fn is_in_failure_mode(&self) -> bool {
        self.state.lock().in_failure_mode
    }

    /// Snapshot of the breaker state
    pub fn status(&self) -> FailFastStatus {
        let state = self.state.lock();
        FailFastStatus {
            in_failure_mode: state.in_failure_mode,
            fail_fast_until: state.fail_fast_until,
            backoff_multiplier: state.backoff_multiplier,
            last_cause: state.last_cause.clone(),
        }
    }

    /// Breaker configuration
    pub fn config(&self) -> &FailFastConfig {
        &self.config
    }
}

impl std::fmt::Debug for FastFailCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastFailCheck")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish()
    }
}
