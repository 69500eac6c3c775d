//! Error types for the rollup store

use thiserror::Error;

use crate::metric::RecordType;
use crate::types::Timestamp;

/// Main error type for the store
#[derive(Error, Debug)]
pub enum Error {
    /// Input rejected before any work was done
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Lock acquisition or ownership failure
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Backend read or write failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The circuit breaker refused the operation
    #[error("Fail-fast: {0}")]
    FailFast(#[from] FailFastError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// True if retrying the same operation later may succeed
    ///
    /// Validation failures and ownership violations are permanent; backend
    /// outages, an open breaker and lock contention are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Storage(_) | Error::FailFast(_) | Error::Io(_) => true,
            Error::Lock(e) => matches!(e, LockError::RetriesExhausted { .. }),
            _ => false,
        }
    }

    /// True for errors caused by the input itself
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Validation errors
///
/// Reported synchronously, never retried, and never leave partial effects.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Entity id uses the reserved `__name__` form
    #[error("Entity id '{0}' is reserved")]
    ReservedEntity(String),

    /// Metric name uses the reserved `__name__` form
    #[error("Metric name '{0}' is reserved")]
    ReservedMetric(String),

    /// Range with start after end
    #[error("Invalid range: start {start} is after end {end}")]
    InvalidRange {
        /// Requested start (ms since epoch)
        start: Timestamp,
        /// Requested end (ms since epoch)
        end: Timestamp,
    },

    /// A metric name was already registered for the entity with another type
    #[error(
        "Metric '{metric}' of entity '{entity}' is registered as {registered}, cannot write it as {requested}"
    )]
    TypeConflict {
        /// Entity id
        entity: String,
        /// Metric name
        metric: String,
        /// Type recorded in the entity's meta
        registered: RecordType,
        /// Type of the rejected write
        requested: RecordType,
    },

    /// Two metrics of different types were combined
    #[error("Cannot combine a {existing} metric with a {incoming} metric")]
    TypeMismatch {
        /// Type of the receiving metric
        existing: RecordType,
        /// Type of the incoming metric
        incoming: RecordType,
    },

    /// No configured tier can answer the request
    #[error("There are no supported summarization periods")]
    NoSupportedPeriods,

    /// Unknown period or record type name
    #[error("Unknown {kind} '{value}'")]
    UnknownName {
        /// What was being parsed
        kind: &'static str,
        /// Offending input
        value: String,
    },

    /// Malformed metric name pattern
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The pattern as given
        pattern: String,
        /// Regex compiler message
        reason: String,
    },
}

/// Lock errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Gave up after the bounded number of acquisition attempts
    #[error("Unable to acquire lock '{name}' after {attempts} attempts")]
    RetriesExhausted {
        /// Lock name
        name: String,
        /// Attempts made
        attempts: u32,
    },

    /// Release called by a caller that does not hold the lock
    #[error("Lock '{0}' is not held by the caller")]
    NotOwner(String),

    /// The shared lock expired and was taken by someone else
    #[error("Lock '{0}' turned out to be someone else's")]
    Stolen(String),

    /// The shared cache backing the lock failed
    #[error("Lock backend error: {0}")]
    Backend(String),
}

/// Storage backend errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Could not reach the backend
    #[error("Connection error: {0}")]
    Connection(String),

    /// Backend command failed
    #[error("Backend error: {0}")]
    Backend(String),

    /// Stored value could not be decoded
    #[error("Corrupted record at '{key}': {reason}")]
    Corrupted {
        /// Backend key of the record
        key: String,
        /// Decode failure
        reason: String,
    },

    /// The backend did not answer in time
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Circuit breaker errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailFastError {
    /// The breaker is open
    #[error("Failing fast for another {remaining_ms}ms (last failure: {})", .cause.as_deref().unwrap_or("unknown"))]
    Open {
        /// Time left in the backoff window
        remaining_ms: i64,
        /// Description of the failure that opened the breaker
        cause: Option<String>,
    },
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file '{path}': {reason}")]
    Read {
        /// File path
        path: String,
        /// IO error text
        reason: String,
    },

    /// Config file could not be parsed
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// Config values are inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
