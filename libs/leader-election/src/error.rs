//! Error types for election and watch operations.
//!
//! [`StoreError`] classifies failures reported by a coordination store so the
//! background loops can decide between creating a key, resetting a watch,
//! backing off, or exiting. [`ElectionError`] is the small set of failures a
//! caller can observe synchronously.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a [`CoordinationStore`](crate::store::CoordinationStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The key does not exist. `index` is the store index at the time of the read.
    #[error("key not found: {key} (index {index})")]
    NotFound { key: String, index: u64 },

    /// A no-clobber create lost to an existing key.
    #[error("key already exists: {key} (index {index})")]
    AlreadyExists { key: String, index: u64 },

    /// A compare-and-swap condition did not hold.
    #[error("precondition failed for {key}: {reason}")]
    PreconditionFailed { key: String, reason: String },

    /// The requested watch position was truncated from the store history.
    #[error("watch expired: index {requested} is older than retained history ({oldest})")]
    WatchExpired { requested: u64, oldest: u64 },

    /// The operation was abandoned because the caller is shutting down.
    #[error("operation cancelled")]
    Cancelled,

    /// Network or store unavailability.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// The store rejected the request as malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_watch_expired(&self) -> bool {
        matches!(self, StoreError::WatchExpired { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled)
    }

    /// Returns true if a create or compare-and-swap lost a race.
    pub fn is_precondition_failed(&self) -> bool {
        matches!(
            self,
            StoreError::AlreadyExists { .. } | StoreError::PreconditionFailed { .. }
        )
    }

    /// Returns true if retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Transient(_) | StoreError::WatchExpired { .. }
        )
    }
}

/// Errors returned to callers of the [`Client`](crate::Client).
#[derive(Debug, Error)]
pub enum ElectionError {
    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Lease terms shorter than the store's TTL granularity are rejected.
    #[error("invalid term {0:?}: must be at least one second")]
    InvalidTerm(Duration),

    /// The client has been closed; no further registrations are accepted.
    #[error("client is closed")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result alias for client operations.
pub type ElectionResult<T> = Result<T, ElectionError>;
