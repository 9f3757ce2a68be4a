//! Error types for the billing resilience layer
//!
//! Failures are classified once, where they originate, into a closed
//! [`FailureKind`]. Everything downstream (retry policy, metrics, the retry
//! processor) branches on that kind instead of inspecting messages.

use std::time::Duration;

use thiserror::Error;

/// Classification of a failed backend operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connection refused or reset
    Connection,
    /// The attempt exceeded its deadline
    Timeout,
    /// DNS, TLS or other transport failure
    Network,
    /// Upstream rejected the call because of rate limiting (HTTP 429)
    RateLimited,
    /// Upstream reported a 5xx-class condition
    Unavailable,
    /// Input failed validation
    Validation,
    /// Referenced entity does not exist
    NotFound,
    /// Conflicting concurrent modification or duplicate
    Conflict,
    /// Explicitly non-retryable
    Permanent,
}

impl FailureKind {
    /// Whether an operation failing with this kind may succeed if retried.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Timeout | Self::Network | Self::RateLimited | Self::Unavailable
        )
    }

    /// Classify an HTTP status code returned by an upstream API.
    ///
    /// Returns `None` for success codes.
    pub fn from_http_status(status: u16) -> Option<Self> {
        match status {
            200..=399 => None,
            408 => Some(Self::Timeout),
            409 => Some(Self::Conflict),
            404 | 410 => Some(Self::NotFound),
            429 => Some(Self::RateLimited),
            400 | 422 => Some(Self::Validation),
            500..=599 => Some(Self::Unavailable),
            _ => Some(Self::Permanent),
        }
    }

    /// Stable label used in logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Permanent => "permanent",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a guarded backend operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} failure: {message}")]
pub struct OperationError {
    /// Classification decided by the code that produced the error
    pub kind: FailureKind,
    /// Human readable detail
    pub message: String,
}

impl OperationError {
    /// Create an error of the given kind
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a non-retryable failure
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    /// Shorthand for a per-attempt timeout
    pub fn timeout(after: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("attempt timed out after {}ms", after.as_millis()),
        )
    }

    /// Whether the retry policy may retry this error
    pub fn is_retryable(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Error surfaced by [`ResilientExecutor::execute_guarded`](crate::ResilientExecutor::execute_guarded).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The breaker is open; no attempt was made
    #[error("circuit breaker is open, retry in {}ms", retry_in.as_millis())]
    CircuitOpen {
        /// Remaining cool-down before the breaker will admit a probe
        retry_in: Duration,
    },

    /// Every attempt ran into its deadline
    #[error("operation timed out after {attempts} attempt(s) of {}ms", timeout.as_millis())]
    Timeout {
        /// Per-attempt deadline
        timeout: Duration,
        /// Attempts made
        attempts: u32,
    },

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// The operation failed; transient failures have already been retried
    #[error(transparent)]
    Operation(#[from] OperationError),
}

impl ExecutorError {
    /// The failure kind behind this error, if any
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::CircuitOpen { .. } => Some(FailureKind::Unavailable),
            Self::Timeout { .. } => Some(FailureKind::Timeout),
            Self::Cancelled => None,
            Self::Operation(e) => Some(e.kind),
        }
    }

    /// Whether a later attempt (for example through the DLQ) may succeed
    pub fn is_retryable(&self) -> bool {
        self.kind().is_some_and(FailureKind::is_transient)
    }
}

/// Persistence errors shared by every store backend
#[derive(Error, Debug)]
pub enum StoreError {
    /// Record with the given id does not exist
    #[error("record not found: {0}")]
    NotFound(String),

    /// Could not acquire a row lock within the configured timeout
    #[error("timed out acquiring lock on {resource} after {}ms", waited.as_millis())]
    LockTimeout {
        /// Locked resource
        resource: String,
        /// How long we waited
        waited: Duration,
    },

    /// A uniqueness constraint rejected the write
    #[error("duplicate key: {0}")]
    Duplicate(String),

    /// The record is not in a state that allows the transition
    #[error("invalid state transition: {0}")]
    InvalidState(String),

    /// Stored data could not be decoded
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backend database error
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Failure kind for callers that feed store errors into the retry machinery
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NotFound(_) => FailureKind::NotFound,
            Self::LockTimeout { .. } => FailureKind::Timeout,
            Self::Duplicate(_) | Self::InvalidState(_) => FailureKind::Conflict,
            Self::Corrupt(_) | Self::Json(_) => FailureKind::Permanent,
            #[cfg(feature = "postgres")]
            Self::Database(e) => match e {
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => FailureKind::Connection,
                sqlx::Error::Io(_) | sqlx::Error::Tls(_) => FailureKind::Network,
                sqlx::Error::RowNotFound => FailureKind::NotFound,
                _ => FailureKind::Unavailable,
            },
        }
    }
}

impl From<StoreError> for OperationError {
    fn from(err: StoreError) -> Self {
        OperationError::new(err.kind(), err.to_string())
    }
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An environment variable held a value that could not be parsed
    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidValue {
        /// Variable name
        name: String,
        /// Raw value
        value: String,
        /// Parser message
        reason: String,
    },

    /// Values parsed but are inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// Guarded execution errors
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Store errors
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Subscription update errors
    #[error("subscription update error: {0}")]
    Update(#[from] crate::subscription::UpdaterError),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for crate operations
pub type Result<T> = std::result::Result<T, Error>;
