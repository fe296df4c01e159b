//! Shared test utilities for credential testing.
//!
//! Helpers for minting claims, signing with keys that are not in the slot
//! and crafting raw credentials for attack tests. Feature-gated behind
//! `testutil` so none of it leaks into production builds.
//!
//! ```toml
//! [dev-dependencies]
//! checkpoint-authn = { path = "../authn", features = ["testutil"] }
//! ```
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use checkpoint_authn::testutil::{craft_raw_jwt, sign_with_foreign_key};
//! ```

#![allow(clippy::expect_used)]

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;

use crate::{
    jwt::{self, SessionClaims},
    keys::SigningKeyMaterial,
};

/// Claims for `sub` issued now and expiring in `ttl_secs` seconds.
///
/// A negative `ttl_secs` produces claims that are already expired.
#[must_use]
pub fn session_claims(sub: &str, ttl_secs: i64) -> SessionClaims {
    let now = Utc::now().timestamp();
    SessionClaims::new(sub, "user", now, now + ttl_secs)
}

/// Signs `claims` with a freshly generated key that is not in any slot.
///
/// Returns the credential and the key, so tests can also verify against it
/// directly.
///
/// # Panics
///
/// Panics if encoding fails, which does not happen with generated keys.
#[must_use]
pub fn sign_with_foreign_key(claims: &SessionClaims) -> (String, SigningKeyMaterial) {
    let key = SigningKeyMaterial::generate();
    let credential = jwt::encode(claims, &key).expect("encode with generated key");
    (credential, key)
}

/// Creates a raw credential from arbitrary header and payload JSON.
///
/// The result is `{header_b64}.{payload_b64}.` with an empty signature,
/// for testing rejection of `alg: none` and algorithm confusion.
///
/// # Panics
///
/// Panics if JSON serialization fails.
#[must_use]
pub fn craft_raw_jwt(header_json: &serde_json::Value, payload_json: &serde_json::Value) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header_json).expect("header json"));
    let payload_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload_json).expect("payload json"));
    format!("{header_b64}.{payload_b64}.")
}

/// Replaces the payload of a signed credential, keeping its header and
/// signature.
///
/// # Panics
///
/// Panics if `credential` is not three dot-separated parts or JSON
/// serialization fails.
#[must_use]
pub fn replace_payload(credential: &str, payload_json: &serde_json::Value) -> String {
    let parts: Vec<&str> = credential.split('.').collect();
    assert_eq!(parts.len(), 3, "credential must have three parts");
    let payload_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload_json).expect("payload json"));
    format!("{}.{payload_b64}.{}", parts[0], parts[2])
}

/// Asserts that a `Result<T, AuthError>` is an `Err` of the given variant.
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use checkpoint_authn::assert_auth_error;
/// use checkpoint_authn::error::AuthError;
///
/// let result: Result<(), AuthError> = Err(AuthError::CredentialExpired);
/// assert_auth_error!(result, CredentialExpired);
/// ```
#[macro_export]
macro_rules! assert_auth_error {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "expected AuthError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
    ($result:expr, $variant:ident, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "{}: expected AuthError::{}, got: {:?}",
            $msg,
            stringify!($variant),
            $result,
        );
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::AuthError;

    #[test]
    fn test_craft_raw_jwt_has_empty_signature() {
        let jwt = craft_raw_jwt(&json!({"alg": "none"}), &json!({"sub": "x"}));
        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[2].is_empty());
    }

    #[test]
    fn test_foreign_key_credential_verifies_against_its_key() {
        let claims = session_claims("mallory", 60);
        let (credential, key) = sign_with_foreign_key(&claims);
        let decoded = jwt::verify_signature(&credential, &key.decoding_key().unwrap()).unwrap();
        assert_eq!(decoded, claims);
    }

    #[test]
    fn test_replace_payload_keeps_signature() {
        let (credential, _) = sign_with_foreign_key(&session_claims("alice", 60));
        let tampered = replace_payload(&credential, &json!({"sub": "root"}));
        assert_eq!(credential.rsplit('.').next(), tampered.rsplit('.').next());
    }

    #[test]
    fn test_assert_auth_error_macro() {
        let result: Result<(), AuthError> = Err(AuthError::invalid_token_format("x"));
        assert_auth_error!(result, InvalidTokenFormat, "malformed");
    }
}
