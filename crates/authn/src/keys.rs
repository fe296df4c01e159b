//! Ed25519 signing key material.
//!
//! A [`SigningKeyMaterial`] carries everything needed to sign and verify
//! credentials under one key: a random key id, the PKCS#8 DER private key and
//! the raw public key, both base64url encoded. Private bytes are scrubbed from
//! memory on drop.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::{SECRET_KEY_LENGTH, SigningKey};
use jsonwebtoken::{DecodingKey, EncodingKey};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{AuthError, Result};

/// PKCS#8 v1 header for an Ed25519 private key (RFC 8410), followed by the
/// 32 secret bytes.
const PKCS8_ED25519_PREFIX: [u8; 16] = [
    0x30, 0x2e, // SEQUENCE, 46 bytes
    0x02, 0x01, 0x00, // INTEGER version 0
    0x30, 0x05, // SEQUENCE, 5 bytes (algorithm identifier)
    0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
    0x04, 0x22, // OCTET STRING, 34 bytes
    0x04, 0x20, // OCTET STRING, 32 bytes (the actual key)
];

/// Number of random bytes in a key id.
const KID_BYTES: usize = 12;

/// One Ed25519 signing key.
///
/// Serialized into the signing key slot. The private half never appears in
/// `Debug` output.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SigningKeyMaterial {
    kid: String,
    public_key: String,
    private_key: String,
}

impl std::fmt::Debug for SigningKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyMaterial")
            .field("kid", &self.kid)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl SigningKeyMaterial {
    /// Generates a fresh key with a random key id.
    #[must_use]
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes());

        let secret: Zeroizing<[u8; SECRET_KEY_LENGTH]> = Zeroizing::new(signing_key.to_bytes());
        let mut pkcs8_der = Zeroizing::new(Vec::with_capacity(PKCS8_ED25519_PREFIX.len() + 32));
        pkcs8_der.extend_from_slice(&PKCS8_ED25519_PREFIX);
        pkcs8_der.extend_from_slice(&*secret);

        let mut kid_bytes = [0u8; KID_BYTES];
        OsRng.fill_bytes(&mut kid_bytes);

        Self {
            kid: URL_SAFE_NO_PAD.encode(kid_bytes),
            public_key,
            private_key: URL_SAFE_NO_PAD.encode(&*pkcs8_der),
        }
    }

    /// Returns the key id placed in credential headers.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Returns the base64url-encoded public key.
    #[must_use]
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    fn secret_bytes(&self) -> Result<Zeroizing<Vec<u8>>> {
        let der = Zeroizing::new(
            URL_SAFE_NO_PAD
                .decode(&self.private_key)
                .map_err(|e| AuthError::invalid_key_material(format!("private key: {e}")))?,
        );
        if der.len() != PKCS8_ED25519_PREFIX.len() + SECRET_KEY_LENGTH
            || der[..PKCS8_ED25519_PREFIX.len()] != PKCS8_ED25519_PREFIX
        {
            return Err(AuthError::invalid_key_material("private key is not Ed25519 PKCS#8"));
        }
        Ok(der)
    }

    /// Builds the signing key.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidKeyMaterial`] if the private key does not
    /// decode to Ed25519 PKCS#8 DER.
    pub fn encoding_key(&self) -> Result<EncodingKey> {
        let der = self.secret_bytes()?;
        Ok(EncodingKey::from_ed_der(&der))
    }

    /// Builds the verification key.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidKeyMaterial`] if the public key does not
    /// decode.
    pub fn decoding_key(&self) -> Result<DecodingKey> {
        DecodingKey::from_ed_components(&self.public_key)
            .map_err(|e| AuthError::invalid_key_material(format!("public key: {e}")))
    }

    /// Checks that the private key decodes and derives the stored public key.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidKeyMaterial`] describing the first problem
    /// found.
    pub fn validate(&self) -> Result<()> {
        let der = self.secret_bytes()?;
        let mut secret = Zeroizing::new([0u8; SECRET_KEY_LENGTH]);
        secret.copy_from_slice(&der[PKCS8_ED25519_PREFIX.len()..]);

        let derived =
            URL_SAFE_NO_PAD.encode(SigningKey::from_bytes(&secret).verifying_key().to_bytes());
        if derived != self.public_key {
            return Err(AuthError::invalid_key_material(format!(
                "public key of {} does not match its private key",
                self.kid
            )));
        }
        if crate::validation::validate_kid(&self.kid).is_err() {
            return Err(AuthError::invalid_key_material("kid is malformed"));
        }
        Ok(())
    }
}
