//! Credential signing and verification against the shared key slot.
//!
//! The [`CredentialVerifier`] keeps no key state of its own: every call reads
//! the [`SigningKeySlot`] from the store, so a rotation performed by any
//! process is visible to all of them on their next request.

use std::time::Duration;

use bytes::Bytes;
use checkpoint_storage::{StorageBackend, StorageError};
use chrono::Utc;

use crate::{
    config::CredentialConfig,
    error::{AuthError, Result},
    jwt::{self, SessionClaims},
    keys::SigningKeyMaterial,
    slot::{SIGNING_SLOT_KEY, SigningKeySlot, SlotState},
    validation::{validate_algorithm, validate_kid},
};

/// Upper bound on slot compare-and-set retries under contention.
const MAX_SLOT_ATTEMPTS: usize = 8;

fn to_chrono(duration: Duration, field: &str) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|_| AuthError::invariant_violation(format!("{field} is out of range")))
}

/// Signs and verifies session credentials with rotation support.
#[derive(Debug, Clone)]
pub struct CredentialVerifier<S> {
    store: S,
    config: CredentialConfig,
}

impl<S: StorageBackend> CredentialVerifier<S> {
    /// Creates a verifier over `store`.
    pub fn new(store: S, config: CredentialConfig) -> Self {
        Self { store, config }
    }

    /// Returns the credential lifetimes in use.
    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    async fn load(&self) -> Result<Option<(Bytes, SigningKeySlot)>> {
        let Some(raw) = self.store.get(SIGNING_SLOT_KEY).await? else {
            return Ok(None);
        };
        let slot = serde_json::from_slice(&raw).map_err(|e| {
            tracing::error!(error = %e, "Signing key slot is not decodable");
            AuthError::from(e)
        })?;
        Ok(Some((raw, slot)))
    }

    async fn load_or_bootstrap(&self) -> Result<(Bytes, SigningKeySlot)> {
        for _ in 0..2 {
            if let Some(loaded) = self.load().await? {
                return Ok(loaded);
            }
            self.bootstrap().await?;
        }
        Err(AuthError::invariant_violation("signing key slot vanished after bootstrap"))
    }

    /// Creates the slot with a freshly generated key if it does not exist.
    ///
    /// Returns `true` if this call created the slot. Concurrent callers race
    /// with insert-if-absent; losers keep the winner's key.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyStorage`] if the store fails and the slot is
    /// still absent after re-reading.
    #[tracing::instrument(skip(self))]
    pub async fn bootstrap(&self) -> Result<bool> {
        if self.load().await?.is_some() {
            return Ok(false);
        }

        let key = SigningKeyMaterial::generate();
        let kid = key.kid().to_owned();
        let encoded = serde_json::to_vec(&SigningKeySlot::new(key))?;

        match self.store.compare_and_set(SIGNING_SLOT_KEY, None, encoded).await {
            Ok(()) => {
                tracing::info!(kid = %kid, "Signing key slot bootstrapped");
                Ok(true)
            },
            Err(StorageError::Conflict) => Ok(false),
            Err(e) if e.is_transient() => match self.load().await? {
                Some((_, slot)) => Ok(slot.current.kid() == kid),
                None => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the slot, bootstrapping it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyStorage`] on store failure and
    /// [`AuthError::InvariantViolation`] if the stored slot does not decode.
    pub async fn slot(&self) -> Result<SigningKeySlot> {
        Ok(self.load_or_bootstrap().await?.1)
    }

    /// Signs a credential for `subject` with the configured lifetime.
    ///
    /// # Errors
    ///
    /// See [`CredentialVerifier::sign_claims`].
    pub async fn sign(&self, subject: &str, role: &str) -> Result<String> {
        self.sign_with_ttl(subject, role, self.config.credential_ttl()).await
    }

    /// Signs a credential for `subject` valid for `ttl`.
    ///
    /// # Errors
    ///
    /// See [`CredentialVerifier::sign_claims`].
    pub async fn sign_with_ttl(&self, subject: &str, role: &str, ttl: Duration) -> Result<String> {
        let iat = Utc::now();
        let exp = iat + to_chrono(ttl, "credential ttl")?;
        let claims = SessionClaims::new(subject, role, iat.timestamp(), exp.timestamp());
        self.sign_claims(&claims).await
    }

    /// Signs `claims` with the current key.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyStorage`] if the slot cannot be read and
    /// [`AuthError::InvalidKeyMaterial`] if the current key cannot sign.
    #[tracing::instrument(skip(self, claims), fields(sub = %claims.sub))]
    pub async fn sign_claims(&self, claims: &SessionClaims) -> Result<String> {
        let slot = self.slot().await?;
        jwt::encode(claims, &slot.current)
    }

    /// Verifies `credential` and returns its claims.
    ///
    /// Checks run in this order:
    ///
    /// 1. The header algorithm must be `EdDSA` and the `kid` well formed.
    /// 2. A credential whose own `exp` has passed is
    ///    [`AuthError::CredentialExpired`], whatever its signature.
    /// 3. The current key, then the previous key while its deadline has not
    ///    passed. If neither verifies the result is
    ///    [`AuthError::CredentialInvalid`].
    ///
    /// A previous key found past its deadline is purged from the slot on a
    /// best-effort basis.
    ///
    /// # Errors
    ///
    /// As listed above, plus [`AuthError::KeyStorage`] on store failure.
    #[tracing::instrument(skip(self, credential))]
    pub async fn verify(&self, credential: &str) -> Result<SessionClaims> {
        let header = jwt::decode_header_unverified(credential)?;
        validate_algorithm(&header.alg)?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::invalid_token_format("JWT header missing 'kid' field"))?;
        validate_kid(&kid)?;

        let now = Utc::now();
        let unverified = jwt::decode_claims_unverified(credential)?;
        if unverified.is_expired_at(now.timestamp()) {
            return Err(AuthError::CredentialExpired);
        }

        let (raw, slot) = self.load_or_bootstrap().await?;
        if slot.has_stale_previous(now) {
            self.purge_stale(&raw, &slot).await;
        }

        let candidates = std::iter::once(&slot.current).chain(slot.usable_previous(now));
        for key in candidates {
            match jwt::verify_signature(credential, &key.decoding_key()?) {
                Ok(claims) => {
                    tracing::debug!(kid = %key.kid(), sub = %claims.sub, "Credential verified");
                    return Ok(claims);
                },
                Err(AuthError::CredentialInvalid) => continue,
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(kid = %kid, "Credential rejected by every usable signing key");
        Err(AuthError::CredentialInvalid)
    }

    async fn purge_stale(&self, raw: &Bytes, slot: &SigningKeySlot) {
        let retired = slot.previous.as_ref().map(|k| k.kid().to_owned()).unwrap_or_default();
        let encoded = match serde_json::to_vec(&slot.purged()) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode purged signing key slot");
                return;
            },
        };
        match self.store.compare_and_set(SIGNING_SLOT_KEY, Some(&raw[..]), encoded).await {
            Ok(()) => tracing::info!(kid = %retired, "Retired previous signing key purged"),
            Err(e) => tracing::debug!(error = %e, "Previous signing key purge skipped"),
        }
    }

    /// Removes the previous key if its deadline has passed.
    ///
    /// Returns the id of the purged key, or `None` if there was nothing to
    /// purge.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyStorage`] on store failure, including a
    /// conflict with a concurrent slot update.
    #[tracing::instrument(skip(self))]
    pub async fn purge_expired_previous(&self) -> Result<Option<String>> {
        let (raw, slot) = self.load_or_bootstrap().await?;
        if !slot.has_stale_previous(Utc::now()) {
            return Ok(None);
        }
        let retired = slot.previous.as_ref().map(|k| k.kid().to_owned());
        let encoded = serde_json::to_vec(&slot.purged())?;
        self.store.compare_and_set(SIGNING_SLOT_KEY, Some(&raw[..]), encoded).await?;
        tracing::info!(kid = ?retired, "Retired previous signing key purged");
        Ok(retired)
    }

    /// Rotates the signing key to `new_key`.
    ///
    /// The current key becomes the previous key and keeps verifying for the
    /// configured grace period. The slot is replaced with a single
    /// compare-and-set, retried on contention by re-reading. An
    /// unacknowledged write is settled the same way: a slot whose current
    /// key is `new_key` means the rotation landed.
    ///
    /// # Errors
    ///
    /// - [`AuthError::RotationPending`] if the previous rotation's grace period is still running
    /// - [`AuthError::InvalidKeyMaterial`] if `new_key` is unusable or reuses the current key id
    /// - [`AuthError::KeyStorage`] if the store fails and re-reading cannot settle the outcome
    #[tracing::instrument(skip(self, new_key), fields(kid = %new_key.kid()))]
    pub async fn rotate(&self, new_key: SigningKeyMaterial) -> Result<SigningKeySlot> {
        new_key.validate()?;
        let grace = to_chrono(self.config.grace_period(), "grace period")?;
        let mut unacknowledged = None;

        for _ in 0..MAX_SLOT_ATTEMPTS {
            let (raw, slot) = self.load_or_bootstrap().await?;
            let now = Utc::now();

            if unacknowledged.is_some() && slot.current.kid() == new_key.kid() {
                tracing::info!(
                    kid = %new_key.kid(),
                    "Signing key rotation confirmed after lost acknowledgement"
                );
                return Ok(slot);
            }
            if let SlotState::Rotating { deadline } = slot.state(now) {
                return Err(AuthError::RotationPending { deadline });
            }
            if slot.current.kid() == new_key.kid() {
                return Err(AuthError::invalid_key_material("new key reuses the current kid"));
            }

            let next = slot.rotated(new_key.clone(), now, grace);
            let outcome = self
                .store
                .compare_and_set(SIGNING_SLOT_KEY, Some(&raw[..]), serde_json::to_vec(&next)?)
                .await
                .and_then(|()| {
                    fail::fail_point!("rotate-lose-ack", |_| Err(StorageError::timeout()));
                    Ok(())
                });

            match outcome {
                Ok(()) => {
                    tracing::info!(
                        kid = %next.current.kid(),
                        previous_kid = %slot.current.kid(),
                        valid_until = ?next.previous_valid_until,
                        "Signing key rotated"
                    );
                    return Ok(next);
                },
                Err(StorageError::Conflict) => continue,
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "Slot update unacknowledged, re-reading");
                    unacknowledged = Some(e);
                },
                Err(e) => return Err(e.into()),
            }
        }

        Err(AuthError::KeyStorage(unacknowledged.unwrap_or_else(StorageError::conflict)))
    }
}
