//! Watchdog: turns circuit-breaker state into pause/resume signals
//!
//! Every tick the watchdog looks at the [`FastFailCheck`] and tells each
//! registered listener what to do:
//!
//! | breaker                          | signal           |
//! |----------------------------------|------------------|
//! | failing, backoff window elapsed  | `on_start`       |
//! | failing, inside backoff window   | `on_stop`        |
//! | healthy                          | `ensure_started` |
//!
//! `heartbeat` is called on every listener after the signal, on every tick.
//! Listeners are usually ingest workers, so a failing backend pushes back on
//! ingestion instead of being hammered with retries.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use super::framework::{Service, ServiceError, ServiceStatus};
use crate::fail_fast::FastFailCheck;
use crate::metrics::WATCHDOG_TICKS;

/// A pausable worker driven by the watchdog
#[async_trait]
pub trait WatchDogListener: Send + Sync {
    /// Resume work after a failure (tentative)
    async fn on_start(&self);

    /// Stop pulling new work
    async fn on_stop(&self);

    /// Resume if currently stopped, otherwise do nothing
    async fn ensure_started(&self);

    /// Called once per tick after the signal
    async fn heartbeat(&self);

    /// Listener name for logs
    fn name(&self) -> &str;
}

/// What a tick told the listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Backoff elapsed, listeners resumed tentatively
    Resume,
    /// Breaker open, listeners paused
    Pause,
    /// Healthy, listeners started if stopped
    EnsureStarted,
}

impl Signal {
    /// Label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Resume => "resume",
            Signal::Pause => "pause",
            Signal::EnsureStarted => "ensure_started",
        }
    }
}

/// Watchdog settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchDogConfig {
    /// Tick interval
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_interval_ms() -> u64 {
    1000
}

impl Default for WatchDogConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

/// Periodic breaker check fanning out to listeners
pub struct WatchDog {
    fail_check: Arc<FastFailCheck>,
    listeners: RwLock<Vec<Arc<dyn WatchDogListener>>>,
    interval: Duration,
    last_signal: Mutex<Option<Signal>>,
    status: RwLock<ServiceStatus>,
}

impl WatchDog {
    /// Watch `fail_check`
    pub fn new(fail_check: Arc<FastFailCheck>, config: &WatchDogConfig) -> Self {
        Self {
            fail_check,
            listeners: RwLock::new(Vec::new()),
            interval: Duration::from_millis(config.interval_ms.max(1)),
            last_signal: Mutex::new(None),
            status: RwLock::new(ServiceStatus::Stopped),
        }
    }

    /// Add a listener; it is signalled from the next tick on
    pub fn register(&self, listener: Arc<dyn WatchDogListener>) {
        tracing::debug!(listener = listener.name(), "Watchdog listener registered");
        self.listeners.write().push(listener);
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Run one tick
    pub async fn check(&self) -> Signal {
        let signal = if !self.fail_check.is_in_failure_mode() {
            Signal::EnsureStarted
        } else if self.fail_check.proceed() {
            Signal::Resume
        } else {
            Signal::Pause
        };

        let previous = self.last_signal.lock().replace(signal);
        if previous != Some(signal) {
            tracing::info!(signal = signal.as_str(), "Watchdog signal changed");
        }

        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in &listeners {
            match signal {
                Signal::Resume => listener.on_start().await,
                Signal::Pause => listener.on_stop().await,
                Signal::EnsureStarted => listener.ensure_started().await,
            }
        }
        for listener in &listeners {
            listener.heartbeat().await;
        }

        WATCHDOG_TICKS.with_label_values(&[signal.as_str()]).inc();
        signal
    }
}

#[async_trait]
impl Service for WatchDog {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        tracing::debug!(interval_ms = self.interval.as_millis() as u64, "Watchdog started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            tracing::debug!("Watchdog received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(missed = n, "Watchdog shutdown receiver lagged");
                        }
                    }
                }

                _ = ticker.tick() => {
                    self.check().await;
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        tracing::debug!("Watchdog stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "watchdog"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}
