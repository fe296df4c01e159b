//! Authentication error types.
//!
//! This module defines errors that can occur while signing or verifying
//! session credentials and while rotating the signing key.

use chrono::{DateTime, Utc};
use checkpoint_storage::StorageError;
use thiserror::Error;

/// Credential and key-rotation errors.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`; new variants may be added in
/// future minor releases without a semver-breaking change. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// Neither the current nor a still-valid previous key verifies the
    /// credential.
    #[error("Invalid credential")]
    CredentialInvalid,

    /// The credential's own expiry has passed.
    #[error("Credential expired")]
    CredentialExpired,

    /// Malformed credential, cannot be decoded.
    #[error("Invalid token format: {0}")]
    InvalidTokenFormat(String),

    /// Algorithm not in allowed list.
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// A rotation was requested while the previous one is still in its
    /// grace period.
    #[error("Key rotation pending until {deadline}")]
    RotationPending {
        /// When the previous key is retired and rotation becomes possible.
        deadline: DateTime<Utc>,
    },

    /// Stored or generated key material could not be used.
    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// The signing key slot is missing or inconsistent.
    #[error("Signing key slot invariant violated: {0}")]
    InvariantViolation(String),

    /// Storage backend error while reading or updating the key slot.
    ///
    /// Wraps the original [`StorageError`] to preserve the full error source
    /// chain for debugging and structured logging.
    #[error("Key storage error: {0}")]
    KeyStorage(
        /// The underlying storage error.
        #[source]
        StorageError,
    ),
}

impl AuthError {
    /// Creates an [`AuthError::InvalidTokenFormat`] error.
    #[must_use]
    pub fn invalid_token_format(message: impl Into<String>) -> Self {
        Self::InvalidTokenFormat(message.into())
    }

    /// Creates an [`AuthError::UnsupportedAlgorithm`] error.
    #[must_use]
    pub fn unsupported_algorithm(message: impl Into<String>) -> Self {
        Self::UnsupportedAlgorithm(message.into())
    }

    /// Creates an [`AuthError::InvalidKeyMaterial`] error.
    #[must_use]
    pub fn invalid_key_material(message: impl Into<String>) -> Self {
        Self::InvalidKeyMaterial(message.into())
    }

    /// Creates an [`AuthError::InvariantViolation`] error.
    #[must_use]
    pub fn invariant_violation(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }

    /// Returns `true` if the caller should re-authenticate.
    ///
    /// Covers every way a presented credential can be rejected, as opposed
    /// to server-side failures.
    #[must_use]
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            Self::CredentialInvalid
                | Self::CredentialExpired
                | Self::InvalidTokenFormat(_)
                | Self::UnsupportedAlgorithm(_)
        )
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) => {
                AuthError::invalid_token_format("Invalid JWT structure")
            },
            ErrorKind::InvalidSignature => AuthError::CredentialInvalid,
            ErrorKind::ExpiredSignature => AuthError::CredentialExpired,
            ErrorKind::InvalidAlgorithm => {
                AuthError::unsupported_algorithm("Algorithm not supported")
            },
            ErrorKind::InvalidEcdsaKey | ErrorKind::InvalidKeyFormat => {
                AuthError::invalid_key_material(err.to_string())
            },
            _ => AuthError::invalid_token_format(format!("JWT error: {err}")),
        }
    }
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        AuthError::KeyStorage(err)
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        AuthError::invariant_violation(format!("signing key slot is not decodable: {err}"))
    }
}

/// Result type alias for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;
