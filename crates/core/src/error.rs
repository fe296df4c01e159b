//! Error types for the check-in core.
//!
//! Each component owns its error enum; [`CheckpointError`] unifies them for
//! the service layer and classifies every failure into an [`ErrorKind`] with
//! a user-facing message.

use std::time::Duration;

use checkpoint_authn::AuthError;
use checkpoint_storage::{ConfigError, StorageError};
use thiserror::Error;

use crate::ledger::Action;

/// Token redemption and issuance failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TokenError {
    /// No record exists for the token id.
    #[error("Token not found")]
    NotFound,

    /// The token was already redeemed by another consumer.
    #[error("Token already consumed")]
    AlreadyConsumed,

    /// The token's expiry has passed.
    #[error("Token expired")]
    Expired,

    /// A stored token record is undecodable or inconsistent.
    #[error("Token invariant violated: {0}")]
    InvariantViolation(String),

    /// The store failed.
    #[error("Token store error: {0}")]
    Store(#[source] StorageError),
}

impl TokenError {
    /// Creates a [`TokenError::InvariantViolation`], logging it at `error!`.
    #[must_use]
    pub fn invariant_violation(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(reason = %message, "Token invariant violated");
        Self::InvariantViolation(message)
    }
}

impl From<StorageError> for TokenError {
    fn from(err: StorageError) -> Self {
        Self::Store(err)
    }
}

/// Attendance ledger failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// The action does not alternate with the pair's last action.
    #[error("Event conflict: {action} rejected, last action was {last:?}")]
    Conflict {
        /// The rejected action.
        action: Action,
        /// The pair's last recorded action, if any.
        last: Option<Action>,
    },

    /// Compare-and-set kept losing to concurrent writers.
    #[error("Ledger contention: gave up after {attempts} attempts")]
    Contention {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// A stored ledger record is undecodable or inconsistent.
    #[error("Ledger invariant violated: {0}")]
    InvariantViolation(String),

    /// The store failed.
    #[error("Ledger store error: {0}")]
    Store(#[source] StorageError),
}

impl LedgerError {
    /// Creates a [`LedgerError::InvariantViolation`], logging it at `error!`.
    #[must_use]
    pub fn invariant_violation(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(reason = %message, "Ledger invariant violated");
        Self::InvariantViolation(message)
    }
}

impl From<StorageError> for LedgerError {
    fn from(err: StorageError) -> Self {
        Self::Store(err)
    }
}

/// Rate limiter failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RateLimitError {
    /// The client exceeded its limit.
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    Exceeded {
        /// Time until the client may retry.
        retry_after: Duration,
    },

    /// The store failed.
    #[error("Rate limit store error: {0}")]
    Store(#[source] StorageError),
}

impl From<StorageError> for RateLimitError {
    fn from(err: StorageError) -> Self {
        Self::Store(err)
    }
}

/// Rounds a retry hint up to whole seconds, never below one.
#[must_use]
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

/// Classification of every failure a caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The token id is unknown.
    TokenNotFound,
    /// The token was redeemed already.
    TokenAlreadyConsumed,
    /// The token's expiry has passed.
    TokenExpired,
    /// The event does not alternate with the last one.
    EventConflict,
    /// The client is rate limited.
    RateLimitExceeded,
    /// The shared store could not serve the request.
    StoreUnavailable,
    /// The session credential is not acceptable.
    CredentialInvalid,
    /// The session credential's own expiry has passed.
    CredentialExpired,
    /// Invariant violation, misconfiguration or another server-side fault.
    Internal,
}

/// Unified error for the check-in service.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CheckpointError {
    /// Token failure.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Ledger failure.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Rate limiter failure.
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    /// Credential failure.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Direct store failure.
    #[error(transparent)]
    Store(#[from] StorageError),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CheckpointError {
    /// Returns the error's classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Token(TokenError::NotFound) => ErrorKind::TokenNotFound,
            Self::Token(TokenError::AlreadyConsumed) => ErrorKind::TokenAlreadyConsumed,
            Self::Token(TokenError::Expired) => ErrorKind::TokenExpired,
            Self::Ledger(LedgerError::Conflict { .. }) => ErrorKind::EventConflict,
            Self::RateLimit(RateLimitError::Exceeded { .. }) => ErrorKind::RateLimitExceeded,
            Self::Auth(AuthError::CredentialExpired) => ErrorKind::CredentialExpired,
            Self::Auth(e) if e.requires_reauthentication() => ErrorKind::CredentialInvalid,
            Self::Token(TokenError::Store(_))
            | Self::Ledger(LedgerError::Store(_) | LedgerError::Contention { .. })
            | Self::RateLimit(RateLimitError::Store(_))
            | Self::Auth(AuthError::KeyStorage(_))
            | Self::Store(_) => ErrorKind::StoreUnavailable,
            _ => ErrorKind::Internal,
        }
    }

    /// Returns the retry hint of a rate limit rejection.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit(RateLimitError::Exceeded { retry_after }) => Some(*retry_after),
            _ => None,
        }
    }

    /// Returns the HTTP status an HTTP front end should answer with.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::TokenNotFound => 404,
            ErrorKind::TokenAlreadyConsumed | ErrorKind::EventConflict => 409,
            ErrorKind::TokenExpired => 410,
            ErrorKind::RateLimitExceeded => 429,
            ErrorKind::StoreUnavailable => 503,
            ErrorKind::CredentialInvalid | ErrorKind::CredentialExpired => 401,
            ErrorKind::Internal => 500,
        }
    }

    /// Returns the message shown to the person who made the request.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::TokenNotFound
            | ErrorKind::TokenAlreadyConsumed
            | ErrorKind::TokenExpired => "Token already used, please rescan.".to_owned(),
            ErrorKind::EventConflict => match self {
                Self::Ledger(LedgerError::Conflict { action: Action::Exit, .. }) => {
                    "You are already checked out. Check in first.".to_owned()
                },
                _ => "You are already checked in. Check out first.".to_owned(),
            },
            ErrorKind::RateLimitExceeded => format!(
                "Too many requests, retry in {} seconds.",
                self.retry_after().map_or(1, retry_after_secs)
            ),
            ErrorKind::StoreUnavailable => {
                "Service temporarily unavailable, please try again.".to_owned()
            },
            ErrorKind::CredentialInvalid | ErrorKind::CredentialExpired => {
                "Your session has ended, please sign in again.".to_owned()
            },
            ErrorKind::Internal => "Something went wrong on our side.".to_owned(),
        }
    }
}

/// Result type alias for the check-in core.
pub type Result<T> = std::result::Result<T, CheckpointError>;
