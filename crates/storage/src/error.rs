//! Storage error types and result alias.
//!
//! Every [`StorageBackend`](crate::StorageBackend) maps its internal failures onto
//! [`StorageError`], so callers can reason about outcomes without knowing which
//! backend variant was selected at startup.
//!
//! # Error Types
//!
//! - [`StorageError::Conflict`] - A compare-and-set precondition did not hold
//! - [`StorageError::Connection`] - The backend could not be reached
//! - [`StorageError::Serialization`] - A stored value could not be encoded or decoded
//! - [`StorageError::Internal`] - Backend-specific internal errors
//! - [`StorageError::Timeout`] - Operation exceeded its time limit
//!
//! `Connection` and `Timeout` are *transient*: the backend may recover. A
//! `Connection` error means the request never reached the backend, so a
//! mutation was not applied. After a `Timeout` the outcome of a mutation is
//! unknown. See [`StorageError::is_transient`] and
//! [`StorageError::outcome_unknown`].
//!
//! # Example
//!
//! ```
//! use checkpoint_storage::{StorageError, StorageResult};
//!
//! fn parse_counter(raw: &[u8]) -> StorageResult<u64> {
//!     std::str::from_utf8(raw)
//!         .ok()
//!         .and_then(|s| s.parse().ok())
//!         .ok_or_else(|| StorageError::serialization("value is not a counter"))
//! }
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Errors preserve their source chain via the `#[source]` attribute.
///
/// # Non-exhaustive
///
/// New variants may be added without a semver-breaking change. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// A compare-and-set precondition did not hold.
    ///
    /// The current value differed from the expected value (or presence did not
    /// match). Callers typically re-read and re-evaluate.
    #[error("Compare-and-set conflict")]
    Conflict,

    /// Connection or network error.
    ///
    /// The request was not delivered, so a mutation was not applied.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error that caused this connection failure.
        #[source]
        source: Option<BoxError>,
    },

    /// Serialization or deserialization error.
    ///
    /// Usually indicates a corrupted record or a schema mismatch between
    /// service versions.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error that caused serialization to fail.
        #[source]
        source: Option<BoxError>,
    },

    /// Internal storage backend error.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error that caused this internal failure.
        #[source]
        source: Option<BoxError>,
    },

    /// Operation timed out.
    ///
    /// The outcome of a timed-out mutation is unknown; callers that need the
    /// true outcome must re-read.
    #[error("Operation timeout")]
    Timeout,
}

impl StorageError {
    /// A precondition mismatch.
    #[must_use]
    pub fn conflict() -> Self {
        Self::Conflict
    }

    /// The backend could not be reached.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// A stored value could not be encoded or decoded.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Any other backend failure.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// The backend did not answer in time.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Attaches `source` to a variant that carries one; other variants are
    /// returned unchanged.
    #[must_use]
    pub fn with_source(self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        let source: Option<BoxError> = Some(Arc::new(source));
        match self {
            Self::Connection { message, .. } => Self::Connection { message, source },
            Self::Serialization { message, .. } => Self::Serialization { message, source },
            Self::Internal { message, .. } => Self::Internal { message, source },
            other => other,
        }
    }

    /// Returns `true` if the backend was unreachable or did not answer in time.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout)
    }

    /// Returns `true` if a mutation that failed with this error may still
    /// have been applied.
    ///
    /// Callers that need the true outcome must re-read, and must not replay
    /// the mutation anywhere else.
    #[must_use]
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("JSON encoding failed").with_source(err)
    }
}

/// Configuration validation errors.
///
/// Returned by the validating builders of configuration types across the
/// workspace.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric field is below its allowed minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Name of the offending field.
        field: &'static str,
        /// Smallest accepted value.
        min: String,
        /// Value that was supplied.
        value: String,
    },

    /// A duration or count must be strictly positive.
    #[error("{field} must be positive, got {value}")]
    MustBePositive {
        /// Name of the offending field.
        field: &'static str,
        /// Value that was supplied.
        value: String,
    },

    /// A field failed a semantic check.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}
