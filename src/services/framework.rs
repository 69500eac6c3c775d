//! Service Framework
//!
//! Long-running background loops (the watchdog, ingest workers) implement
//! [`Service`] and are driven by a [`ServiceManager`], which starts them in
//! registration order and stops them together on shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// Service Trait
// ============================================================================

/// Trait for implementing background services
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Run the service until `shutdown` fires
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError>;

    /// Service name for logging and identification
    fn name(&self) -> &'static str;

    /// Current status
    fn status(&self) -> ServiceStatus;
}

// ============================================================================
// Service Status
// ============================================================================

/// Status of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Service is initializing
    Starting,

    /// Service is running normally
    Running,

    /// Service is shutting down
    Stopping,

    /// Service has stopped
    Stopped,

    /// Service failed with an error
    Failed(String),
}

impl ServiceStatus {
    /// Check if the service is in a healthy state
    pub fn is_healthy(&self) -> bool {
        matches!(self, ServiceStatus::Running)
    }

    /// Check if the service has stopped (normally or due to failure)
    pub fn is_stopped(&self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Failed(_))
    }
}

// ============================================================================
// Service Error
// ============================================================================

/// Errors that can occur in services
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Service encountered an error during execution
    #[error("Service runtime error: {0}")]
    RuntimeError(String),

    /// A service with this name is already registered or running
    #[error("Service already running: {0}")]
    AlreadyRunning(String),

    /// The requested service was not found in the registry
    #[error("Service not found: {0}")]
    NotFound(String),
}

// ============================================================================
// Service Config
// ============================================================================

/// Configuration for the service manager
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Timeout for graceful shutdown
    pub shutdown_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

struct ServiceHandle {
    service: Arc<dyn Service>,
    task: Option<JoinHandle<Result<(), ServiceError>>>,
    started_at: Option<Instant>,
}

// ============================================================================
// Service Manager
// ============================================================================

/// Manager for coordinating background services
pub struct ServiceManager {
    config: ServiceConfig,
    order: RwLock<Vec<&'static str>>,
    services: RwLock<HashMap<&'static str, ServiceHandle>>,
    shutdown_tx: broadcast::Sender<()>,
    running: RwLock<bool>,
}

impl ServiceManager {
    /// Create a new service manager
    pub fn new(config: ServiceConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            order: RwLock::new(Vec::new()),
            services: RwLock::new(HashMap::new()),
            shutdown_tx,
            running: RwLock::new(false),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ServiceConfig::default())
    }

    /// Register a service with the manager
    pub fn register(&self, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        let name = service.name();
        let mut services = self.services.write();

        if services.contains_key(name) {
            return Err(ServiceError::AlreadyRunning(name.to_string()));
        }

        services.insert(
            name,
            ServiceHandle {
                service,
                task: None,
                started_at: None,
            },
        );
        self.order.write().push(name);

        tracing::debug!(service = name, "Service registered");
        Ok(())
    }

    /// Start all registered services in registration order
    pub async fn start_all(&self) -> Result<(), ServiceError> {
        {
            let mut running = self.running.write();
            if *running {
                return Err(ServiceError::AlreadyRunning("service manager".into()));
            }
            *running = true;
        }

        let order = self.order.read().clone();
        for name in order {
            self.start_service(name).await?;
        }

        tracing::debug!("All services started");
        Ok(())
    }

    /// Start a specific service
    pub async fn start_service(&self, name: &'static str) -> Result<(), ServiceError> {
        let service = {
            let mut services = self.services.write();
            let handle = services
                .get_mut(name)
                .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
            if handle.task.is_some() {
                return Err(ServiceError::AlreadyRunning(name.to_string()));
            }

            let service = Arc::clone(&handle.service);
            let shutdown_rx = self.shutdown_tx.subscribe();
            let runner = Arc::clone(&service);
            handle.task = Some(tokio::spawn(async move { runner.start(shutdown_rx).await }));
            handle.started_at = Some(Instant::now());
            service
        };

        // Give the service a moment to report Running
        let start_wait = Instant::now();
        while start_wait.elapsed() < Duration::from_millis(100) {
            if service.status().is_healthy() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tracing::debug!(service = name, "Service started");
        Ok(())
    }

    /// Stop all services gracefully
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        tracing::info!("Initiating graceful shutdown");

        let _ = self.shutdown_tx.send(());

        let tasks: Vec<(&'static str, JoinHandle<Result<(), ServiceError>>)> = {
            let mut services = self.services.write();
            services
                .iter_mut()
                .filter_map(|(name, handle)| handle.task.take().map(|task| (*name, task)))
                .collect()
        };

        let deadline = Instant::now() + self.config.shutdown_timeout;
        for (name, task) in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let abort = task.abort_handle();

            match tokio::time::timeout(remaining, task).await {
                Ok(Ok(Ok(()))) => {
                    tracing::debug!(service = name, "Service stopped gracefully");
                },
                Ok(Ok(Err(e))) => {
                    tracing::warn!(service = name, error = %e, "Service stopped with error");
                },
                Ok(Err(e)) => {
                    tracing::error!(service = name, error = %e, "Service task panicked");
                },
                Err(_) => {
                    tracing::warn!(service = name, "Service shutdown timed out, aborting");
                    abort.abort();
                },
            }
        }

        *self.running.write() = false;
        tracing::info!("Shutdown complete");
        Ok(())
    }

    /// Get the status of all services
    pub fn status(&self) -> HashMap<&'static str, ServiceStatus> {
        let services = self.services.read();
        services
            .iter()
            .map(|(name, handle)| (*name, handle.service.status()))
            .collect()
    }

    /// Time since a service was started
    pub fn service_uptime(&self, name: &str) -> Option<Duration> {
        let services = self.services.read();
        services
            .get(name)
            .and_then(|h| h.started_at.map(|started| started.elapsed()))
    }

    /// Check if all services are healthy
    pub fn is_healthy(&self) -> bool {
        let services = self.services.read();
        services.values().all(|h| h.service.status().is_healthy())
    }
}
