//! Write buffer in front of a [`DataStore`]
//!
//! Metrics for the current time slice are merged in memory per entity and
//! persisted once when the slice is over, which turns a burst of writes for
//! one entity into a single persist. Writes for slices that are already
//! closed bypass the buffer.
//!
//! Buffered metrics are not visible to reads until flushed.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use super::DataStore;
use crate::clock::TimeService;
use crate::error::{Result, ValidationError};
use crate::metric::{is_reserved_name, Metrics, Timeslice};
use crate::metrics::{BUFFERED_ENTITIES, BUFFER_DISCARDED, BUFFER_FLUSHES};
use crate::services::WatchDogListener;
use crate::types::{Period, Timestamp};

/// Write buffer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Put a buffer in front of the store
    #[serde(default)]
    pub enabled: bool,

    /// Width of a buffered slice
    #[serde(default = "default_granularity_ms")]
    pub granularity_ms: u64,
}

fn default_granularity_ms() -> u64 {
    60_000
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            granularity_ms: default_granularity_ms(),
        }
    }
}

#[derive(Debug)]
struct BufferState {
    current_slice: Timestamp,
    entries: HashMap<String, Metrics>,
}

/// [`DataStore`] that batches writes per time slice
pub struct BufferedStore {
    inner: Arc<dyn DataStore>,
    time: TimeService,
    granularity: i64,
    state: Mutex<BufferState>,
}

impl BufferedStore {
    /// Buffer on the system clock
    pub fn new(inner: Arc<dyn DataStore>, config: &BufferConfig) -> Self {
        Self::with_time(inner, config, TimeService::system())
    }

    /// Buffer on a custom time source
    pub fn with_time(inner: Arc<dyn DataStore>, config: &BufferConfig, time: TimeService) -> Self {
        let granularity = (config.granularity_ms.max(1)).min(i64::MAX as u64) as i64;
        let now = time.current_time_millis();
        Self {
            inner,
            time,
            granularity,
            state: Mutex::new(BufferState {
                current_slice: now - now.rem_euclid(granularity),
                entries: HashMap::new(),
            }),
        }
    }

    fn slice_of(&self, timestamp: Timestamp) -> Timestamp {
        timestamp - timestamp.rem_euclid(self.granularity)
    }

    /// Start of the slice currently buffered
    pub async fn current_slice(&self) -> Timestamp {
        self.state.lock().await.current_slice
    }

    /// Entities with unflushed metrics
    pub async fn pending_entities(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Persist everything buffered now
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state, "manual").await
    }

    /// Flush if the wall clock has moved past the buffered slice
    pub async fn flush_expired(&self) -> Result<()> {
        let now_slice = self.slice_of(self.time.current_time_millis());
        let mut state = self.state.lock().await;
        if now_slice > state.current_slice {
            self.flush_locked(&mut state, "expired").await?;
            state.current_slice = now_slice;
        }
        Ok(())
    }

    /// Persist every buffered entity at the slice start
    ///
    /// An entity the store rejects as invalid is dropped so it cannot block
    /// the slice; any other error keeps it and the rest for a later flush.
    async fn flush_locked(&self, state: &mut BufferState, trigger: &'static str) -> Result<()> {
        if state.entries.is_empty() {
            return Ok(());
        }
        BUFFER_FLUSHES.with_label_values(&[trigger]).inc();

        let mut entities: Vec<String> = state.entries.keys().cloned().collect();
        entities.sort();

        let slice = state.current_slice;
        let mut result = Ok(());
        for entity in entities {
            let Some(metrics) = state.entries.get(&entity) else {
                continue;
            };
            match self.inner.persist(&entity, slice, metrics).await {
                Ok(()) => {
                    state.entries.remove(&entity);
                },
                Err(e) if e.is_validation() => {
                    error!(entity = %entity, slice, error = %e, "Discarding buffered metrics rejected by the store");
                    BUFFER_DISCARDED.inc();
                    state.entries.remove(&entity);
                },
                Err(e) => {
                    warn!(entity = %entity, slice, error = %e, "Buffer flush failed, keeping entries");
                    result = Err(e);
                    break;
                },
            }
        }

        BUFFERED_ENTITIES.set(state.entries.len() as i64);
        debug!(slice, remaining = state.entries.len(), trigger, "Flushed write buffer");
        result
    }
}

#[async_trait]
impl DataStore for BufferedStore {
    async fn persist(&self, entity: &str, timestamp: Timestamp, metrics: &Metrics) -> Result<()> {
        if is_reserved_name(entity) {
            return Err(ValidationError::ReservedEntity(entity.to_string()).into());
        }
        if let Some(name) = metrics.names().find(|name| is_reserved_name(name)) {
            return Err(ValidationError::ReservedMetric(name.to_string()).into());
        }
        if metrics.is_empty() {
            return Ok(());
        }

        let slice = self.slice_of(timestamp);
        let mut state = self.state.lock().await;

        if slice < state.current_slice {
            drop(state);
            return self.inner.persist(entity, timestamp, metrics).await;
        }
        if slice > state.current_slice {
            self.flush_locked(&mut state, "advance").await?;
            state.current_slice = slice;
        }

        match state.entries.get_mut(entity) {
            Some(buffered) => buffered.merge(metrics)?,
            None => {
                state.entries.insert(entity.to_string(), metrics.clone());
            },
        }
        BUFFERED_ENTITIES.set(state.entries.len() as i64);
        Ok(())
    }

    async fn find(&self, entity: &str, start: Timestamp, end: Timestamp) -> Result<Metrics> {
        self.inner.find(entity, start, end).await
    }

    async fn find_period_at(
        &self,
        entity: &str,
        period: Period,
        instant: Timestamp,
    ) -> Result<Vec<Timeslice>> {
        self.inner.find_period_at(entity, period, instant).await
    }

    async fn find_period(
        &self,
        entity: &str,
        period: Period,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Timeslice>> {
        self.inner.find_period(entity, period, start, end).await
    }

    async fn slices(
        &self,
        entity: &str,
        period: Period,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Timeslice>> {
        self.inner.slices(entity, period, start, end).await
    }

    async fn entities(&self, pattern: Option<&Regex>) -> Result<Vec<String>> {
        self.inner.entities(pattern).await
    }
}

#[async_trait]
impl WatchDogListener for BufferedStore {
    async fn on_start(&self) {}

    async fn on_stop(&self) {
        let mut state = self.state.lock().await;
        if let Err(e) = self.flush_locked(&mut state, "stop").await {
            warn!(error = %e, "Could not flush write buffer on stop");
        }
    }

    async fn ensure_started(&self) {}

    async fn heartbeat(&self) {
        if let Err(e) = self.flush_expired().await {
            warn!(error = %e, "Could not flush expired write buffer");
        }
    }

    fn name(&self) -> &str {
        "write-buffer"
    }
}

impl std::fmt::Debug for BufferedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedStore")
            .field("granularity_ms", &self.granularity)
            .finish()
    }
}
