//! Credential algorithm and key id validation.
//!
//! Checks run on the unverified header before any signature work, so an
//! attacker cannot steer verification onto a weaker algorithm.

use crate::error::AuthError;

/// Algorithms that are never accepted.
///
/// - `none`: no signature at all
/// - `HS256`, `HS384`, `HS512`: symmetric; anyone holding the verification key can mint
///   credentials
pub const FORBIDDEN_ALGORITHMS: &[&str] = &["none", "HS256", "HS384", "HS512"];

/// Accepted algorithms. Signing keys are Ed25519 only.
pub const ACCEPTED_ALGORITHMS: &[&str] = &["EdDSA"];

/// Maximum accepted length of a `kid` header.
pub const MAX_KID_LENGTH: usize = 64;

/// Validates a credential's algorithm against the allow and deny lists.
///
/// # Errors
///
/// Returns [`AuthError::UnsupportedAlgorithm`] if the algorithm is forbidden
/// or not in [`ACCEPTED_ALGORITHMS`].
///
/// # Examples
///
/// ```
/// use checkpoint_authn::validation::validate_algorithm;
///
/// assert!(validate_algorithm("EdDSA").is_ok());
/// assert!(validate_algorithm("HS256").is_err());
/// assert!(validate_algorithm("RS256").is_err());
/// ```
pub fn validate_algorithm(alg: &str) -> Result<(), AuthError> {
    if FORBIDDEN_ALGORITHMS.contains(&alg) {
        return Err(AuthError::unsupported_algorithm(format!(
            "Algorithm '{alg}' is not allowed for security reasons"
        )));
    }

    if !ACCEPTED_ALGORITHMS.contains(&alg) {
        return Err(AuthError::unsupported_algorithm(format!(
            "Algorithm '{alg}' is not in accepted list (only EdDSA is supported)"
        )));
    }

    Ok(())
}

/// Validates a `kid` header value.
///
/// Key ids are generated by this crate as base64url strings; anything else
/// (control characters, path separators, oversized values) is rejected
/// before it can reach a log line.
///
/// # Errors
///
/// Returns [`AuthError::InvalidTokenFormat`] for an empty, oversized or
/// non-base64url `kid`.
pub fn validate_kid(kid: &str) -> Result<(), AuthError> {
    if kid.is_empty() || kid.len() > MAX_KID_LENGTH {
        return Err(AuthError::invalid_token_format("kid has an invalid length"));
    }
    if !kid.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
        return Err(AuthError::invalid_token_format("kid contains invalid characters"));
    }
    Ok(())
}
