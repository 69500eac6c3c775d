//! Pausable ingest worker
//!
//! Pulls deliveries off a channel, decodes them and persists them. Each
//! delivery is answered with an [`Outcome`]:
//!
//! - `Acked` once the metrics are persisted
//! - `Rejected` for input that can never succeed (bad JSON, reserved or
//!   conflicting names); redelivering it would loop forever
//! - `Redeliver` for everything else; the message must not be acknowledged
//!
//! The worker stops pulling while paused. The watchdog pauses it while the
//! breaker is open and resumes it once the backoff window has passed.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, ValidationError};
use crate::fail_fast::FastFailCheck;
use crate::metric::Metrics;
use crate::metrics::INGEST_MESSAGES;
use crate::services::{Service, ServiceError, ServiceStatus, WatchDogListener};
use crate::storage::DataStore;
use crate::types::{parse_timestamp, Timestamp};

/// Ingest settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Deliveries queued before senders wait
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Event timestamp as sent on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    /// Epoch milliseconds
    Millis(i64),
    /// RFC 3339 date-time
    Text(String),
}

/// One inbound message
///
/// ```json
/// {"entityId": "web-1", "timestamp": 1268579366000,
///  "metrics": {"hits": {"value": 3}, "size": {"value": 10, "type": "ABSOLUTE"}}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestMessage {
    /// Entity the metrics belong to
    pub entity_id: String,
    /// When the metrics were observed
    pub timestamp: WireTimestamp,
    /// Observed metrics
    #[serde(default)]
    pub metrics: Metrics,
}

impl IngestMessage {
    /// Parse a JSON payload
    pub fn decode(payload: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Timestamp in epoch milliseconds
    pub fn timestamp_millis(&self) -> Result<Timestamp, ValidationError> {
        match &self.timestamp {
            WireTimestamp::Millis(ms) => Ok(*ms),
            WireTimestamp::Text(text) => parse_timestamp(text),
        }
    }
}

/// How a delivery was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Persisted; acknowledge
    Acked,
    /// Not persisted; leave unacknowledged so it comes back
    Redeliver(String),
    /// Never persistable; acknowledge and drop
    Rejected(String),
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Acked => "acked",
            Outcome::Redeliver(_) => "redeliver",
            Outcome::Rejected(_) => "rejected",
        }
    }
}

/// A payload plus the channel its outcome goes back on
#[derive(Debug)]
pub struct Delivery {
    /// Raw JSON message
    pub payload: String,
    /// Outcome sink
    pub ack: oneshot::Sender<Outcome>,
}

impl Delivery {
    /// New delivery and the receiver for its outcome
    pub fn new(payload: impl Into<String>) -> (Self, oneshot::Receiver<Outcome>) {
        let (ack, outcome) = oneshot::channel();
        (
            Self {
                payload: payload.into(),
                ack,
            },
            outcome,
        )
    }
}

/// Worker persisting deliveries from a channel
pub struct IngestWorker {
    store: Arc<dyn DataStore>,
    fail_check: Arc<FastFailCheck>,
    input: tokio::sync::Mutex<Option<mpsc::Receiver<Delivery>>>,
    paused: watch::Sender<bool>,
    last_heartbeat: Mutex<Option<Instant>>,
    handled: AtomicU64,
    status: RwLock<ServiceStatus>,
}

impl IngestWorker {
    /// Worker reading `input`
    pub fn new(
        store: Arc<dyn DataStore>,
        fail_check: Arc<FastFailCheck>,
        input: mpsc::Receiver<Delivery>,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            store,
            fail_check,
            input: tokio::sync::Mutex::new(Some(input)),
            paused,
            last_heartbeat: Mutex::new(None),
            handled: AtomicU64::new(0),
            status: RwLock::new(ServiceStatus::Stopped),
        }
    }

    /// Stop pulling deliveries
    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            info!("Ingest paused");
        }
    }

    /// Resume pulling deliveries
    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            info!("Ingest resumed");
        }
    }

    /// Whether the worker is paused
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Deliveries handled so far
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Time since the last watchdog heartbeat
    pub fn since_heartbeat(&self) -> Option<std::time::Duration> {
        self.last_heartbeat.lock().map(|at| at.elapsed())
    }

    /// Decode and persist one payload
    pub async fn handle(&self, payload: &str) -> Outcome {
        let outcome = self.process(payload).await;
        self.handled.fetch_add(1, Ordering::Relaxed);
        INGEST_MESSAGES.with_label_values(&[outcome.label()]).inc();
        outcome
    }

    async fn process(&self, payload: &str) -> Outcome {
        let message = match IngestMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Rejecting undecodable message");
                return Outcome::Rejected(e.to_string());
            },
        };
        let timestamp = match message.timestamp_millis() {
            Ok(ts) => ts,
            Err(e) => {
                warn!(entity = %message.entity_id, error = %e, "Rejecting message with bad timestamp");
                return Outcome::Rejected(e.to_string());
            },
        };

        if let Err(e) = self.fail_check.proceed_or_err() {
            self.pause();
            return Outcome::Redeliver(e.to_string());
        }

        match self
            .store
            .persist(&message.entity_id, timestamp, &message.metrics)
            .await
        {
            Ok(()) => Outcome::Acked,
            Err(e) if e.is_validation() => {
                warn!(entity = %message.entity_id, error = %e, "Rejecting invalid message");
                Outcome::Rejected(e.to_string())
            },
            Err(e) => {
                warn!(entity = %message.entity_id, error = %e, "Persist failed, message will be redelivered");
                if self.fail_check.is_in_failure_mode() {
                    self.pause();
                }
                Outcome::Redeliver(e.to_string())
            },
        }
    }
}

#[async_trait]
impl Service for IngestWorker {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        let mut input = self
            .input
            .lock()
            .await
            .take()
            .ok_or_else(|| ServiceError::AlreadyRunning("ingest".into()))?;
        let mut paused = self.paused.subscribe();

        *self.status.write() = ServiceStatus::Running;
        debug!("Ingest worker started");

        loop {
            let is_paused = *paused.borrow_and_update();
            tokio::select! {
                biased;

                result = shutdown.recv() => {
                    if !matches!(result, Err(broadcast::error::RecvError::Lagged(_))) {
                        debug!("Ingest worker received shutdown signal");
                        break;
                    }
                }

                changed = paused.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                delivery = input.recv(), if !is_paused => {
                    let Some(delivery) = delivery else {
                        debug!("Ingest channel closed");
                        break;
                    };
                    let outcome = self.handle(&delivery.payload).await;
                    if delivery.ack.send(outcome).is_err() {
                        debug!("Delivery outcome dropped by sender");
                    }
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        debug!(handled = self.handled(), "Ingest worker stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ingest"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}

#[async_trait]
impl WatchDogListener for IngestWorker {
    async fn on_start(&self) {
        self.resume();
    }

    async fn on_stop(&self) {
        self.pause();
    }

    async fn ensure_started(&self) {
        if self.is_paused() {
            self.resume();
        }
    }

    async fn heartbeat(&self) {
        *self.last_heartbeat.lock() = Some(Instant::now());
    }

    fn name(&self) -> &str {
        "ingest"
    }
}
