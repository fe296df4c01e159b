//! Session credential encoding and decoding.
//!
//! Credentials are compact JWTs signed with EdDSA. The header is decoded by
//! hand before any signature check so the algorithm can be rejected as a raw
//! string: `jsonwebtoken` cannot even represent `none`.
//!
//! # Example
//!
//! ```
//! use checkpoint_authn::jwt::{SessionClaims, decode_header_unverified, encode};
//! use checkpoint_authn::keys::SigningKeyMaterial;
//!
//! # fn example() -> Result<(), checkpoint_authn::AuthError> {
//! let key = SigningKeyMaterial::generate();
//! let claims = SessionClaims::new("alice", "admin", 1_700_000_000, 1_700_001_800);
//! let credential = encode(&claims, &key)?;
//!
//! let header = decode_header_unverified(&credential)?;
//! assert_eq!(header.alg, "EdDSA");
//! assert_eq!(header.kid.as_deref(), Some(key.kid()));
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation, decode};
use serde::{Deserialize, Serialize};

use crate::{
    error::{AuthError, Result},
    keys::SigningKeyMaterial,
};

/// Claims carried by a session credential.
///
/// ```json
/// {
///   "sub": "alice",
///   "role": "admin",
///   "iat": 1700000000,
///   "exp": 1700001800
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject: the username.
    pub sub: String,
    /// Dashboard role of the subject.
    pub role: String,
    /// Issued at (seconds since epoch).
    pub iat: i64,
    /// Expiration time (seconds since epoch).
    pub exp: i64,
}

impl SessionClaims {
    /// Creates claims from their parts.
    #[must_use]
    pub fn new(sub: impl Into<String>, role: impl Into<String>, iat: i64, exp: i64) -> Self {
        Self { sub: sub.into(), role: role.into(), iat, exp }
    }

    /// Returns `true` if the credential's own expiry has passed at `now`
    /// (seconds since epoch).
    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.exp
    }
}

/// Header fields read before verification.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RawHeader {
    /// Algorithm exactly as written by the issuer.
    pub alg: String,
    /// Key id, if present.
    #[serde(default)]
    pub kid: Option<String>,
}

fn split_compact(credential: &str) -> Result<[&str; 3]> {
    let mut parts = credential.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(payload), Some(signature), None) => Ok([header, payload, signature]),
        _ => Err(AuthError::invalid_token_format("JWT must have 3 parts separated by dots")),
    }
}

/// Decodes the credential header without verification.
///
/// # Errors
///
/// Returns [`AuthError::InvalidTokenFormat`] if the credential is not three
/// dot-separated parts or the header is not base64url JSON with an `alg`.
pub fn decode_header_unverified(credential: &str) -> Result<RawHeader> {
    let [header, ..] = split_compact(credential)?;
    let bytes = URL_SAFE_NO_PAD.decode(header).map_err(|e| {
        AuthError::invalid_token_format(format!("Failed to decode JWT header: {e}"))
    })?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::invalid_token_format(format!("Failed to parse JWT header: {e}")))
}

/// Decodes the claims without verification.
///
/// Used to apply the expiry rule before the signature is checked.
///
/// # Errors
///
/// Returns [`AuthError::InvalidTokenFormat`] if the payload does not decode
/// into [`SessionClaims`] or `sub` is empty.
pub fn decode_claims_unverified(credential: &str) -> Result<SessionClaims> {
    let [_, payload, _] = split_compact(credential)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).map_err(|e| {
        AuthError::invalid_token_format(format!("Failed to decode JWT payload: {e}"))
    })?;
    let claims: SessionClaims = serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::invalid_token_format(format!("Failed to parse JWT claims: {e}")))?;
    if claims.sub.is_empty() {
        return Err(AuthError::invalid_token_format("JWT claim 'sub' is empty"));
    }
    Ok(claims)
}

/// Signs `claims` with `key`, writing its id into the header.
///
/// # Errors
///
/// Returns [`AuthError::InvalidKeyMaterial`] if the key cannot sign.
pub fn encode(claims: &SessionClaims, key: &SigningKeyMaterial) -> Result<String> {
    let mut header = Header::new(Algorithm::EdDSA);
    header.kid = Some(key.kid().to_owned());
    Ok(jsonwebtoken::encode(&header, claims, &key.encoding_key()?)?)
}

/// Verifies the signature of `credential` with `decoding_key`.
///
/// Expiry is not checked here; callers apply it against the unverified
/// claims first so an expired credential is reported as expired whatever its
/// signature.
///
/// # Errors
///
/// Returns [`AuthError::CredentialInvalid`] on a bad signature and
/// [`AuthError::InvalidTokenFormat`] on a malformed credential.
pub fn verify_signature(credential: &str, decoding_key: &DecodingKey) -> Result<SessionClaims> {
    let mut validation = Validation::new(Algorithm::EdDSA);
    validation.leeway = 0;
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.set_required_spec_claims(&["exp", "sub"]);

    let data = decode::<SessionClaims>(credential, decoding_key, &validation)?;
    Ok(data.claims)
}
