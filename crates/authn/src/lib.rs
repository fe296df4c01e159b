//! # Checkpoint Authentication
//!
//! Session credentials for the Checkpoint dashboard, with zero-downtime
//! rotation of the signing key.
//!
//! This crate provides:
//! - **Credentials**: EdDSA-signed JWTs carrying `sub`, `role`, `iat`, `exp`
//! - **Signing key slot**: current and previous key in one shared-store record
//! - **Verification**: current key first, then the previous key until its deadline
//! - **Rotation admin**: audited status, rotate, verify and purge operations
//!
//! ## Security
//!
//! - Only EdDSA is accepted; `none` and HMAC algorithms are rejected before any signature work
//! - A credential past its own `exp` is reported as expired, whatever its signature
//! - Private key bytes are zeroized on drop and never appear in `Debug` output
//!
//! ## Example
//!
//! ```no_run
//! use checkpoint_authn::{CredentialConfig, CredentialVerifier, SigningKeyMaterial};
//! use checkpoint_storage::MemoryBackend;
//!
//! # async fn example() -> Result<(), checkpoint_authn::AuthError> {
//! let verifier = CredentialVerifier::new(MemoryBackend::new(), CredentialConfig::default());
//! verifier.bootstrap().await?;
//!
//! let credential = verifier.sign("alice", "admin").await?;
//! verifier.rotate(SigningKeyMaterial::generate()).await?;
//!
//! // Still valid: the previous key verifies until its deadline.
//! let claims = verifier.verify(&credential).await?;
//! assert_eq!(claims.sub, "alice");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Audit trail for key administration.
pub mod audit;
/// Credential lifetime configuration.
pub mod config;
/// Authentication error types.
pub mod error;
/// Credential encoding and decoding.
pub mod jwt;
/// Ed25519 key material.
pub mod keys;
/// Audited rotation operations.
pub mod rotation;
/// The signing key slot record.
pub mod slot;
/// Shared test utilities.
#[cfg(feature = "testutil")]
pub mod testutil;
/// Algorithm and key id validation.
pub mod validation;
/// Credential signing and verification.
pub mod verifier;

pub use audit::{AuditAction, AuditEvent, AuditLogger, AuditOutcome, MemoryAuditLogger, TracingAuditLogger};
pub use config::{CredentialConfig, DEFAULT_CREDENTIAL_TTL, DEFAULT_GRACE_PERIOD};
pub use error::{AuthError, Result};
pub use jwt::SessionClaims;
pub use keys::SigningKeyMaterial;
pub use rotation::{RotationAdmin, RotationReport, RotationStatus, VerificationReport};
pub use slot::{SigningKeySlot, SlotState};
pub use validation::{ACCEPTED_ALGORITHMS, FORBIDDEN_ALGORITHMS, validate_algorithm};
pub use verifier::CredentialVerifier;
