//! One-time access tokens.
//!
//! A token is issued into the `token:current` slot and redeemed exactly once
//! by a compare-and-set on its record. Records outlive their expiry by the
//! configured retention so late scans report `Expired` instead of
//! `NotFound`.
//!
//! ```text
//!   issue ──► Active ──consume (CAS)──► Consumed
//!               │
//!               └── now >= expires_at ──► Expired (derived, never written)
//! ```

use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use checkpoint_storage::{StorageBackend, StorageError};
use chrono::{DateTime, Utc};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::{config::TokenConfig, error::TokenError};

/// Key of the slot naming the current token.
pub const CURRENT_TOKEN_KEY: &[u8] = b"token:current";

const RECORD_PREFIX: &str = "token:record:";
const TOKEN_ID_BYTES: usize = 8;
const NONCE_BYTES: usize = 16;
const MAX_ID_LEN: usize = 64;
const MAX_SLOT_ATTEMPTS: usize = 8;

type Result<T> = std::result::Result<T, TokenError>;

fn record_key(id: &str) -> Vec<u8> {
    format!("{RECORD_PREFIX}{id}").into_bytes()
}

fn random_id(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn is_well_formed(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Returns a loggable prefix of a token id.
pub(crate) fn short_id(id: &str) -> &str {
    id.get(..4).unwrap_or(id)
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|_| TokenError::invariant_violation("token ttl is out of range"))
}

/// Observable state of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    /// Redeemable.
    Active,
    /// Redeemed once.
    Consumed,
    /// Past its expiry.
    Expired,
}

/// Snapshot of a token as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Token {
    /// Token id, as embedded in the scan link.
    pub id: String,
    /// Issue time.
    pub created_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
    /// State at the time of the read.
    pub state: TokenState,
    /// Who redeemed the token.
    pub consumer: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RecordState {
    Active,
    Consumed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenRecord {
    id: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    state: RecordState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    consumer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    consumed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    redemption: Option<String>,
}

impl TokenRecord {
    fn state_at(&self, now: DateTime<Utc>) -> TokenState {
        if now >= self.expires_at {
            TokenState::Expired
        } else {
            match self.state {
                RecordState::Active => TokenState::Active,
                RecordState::Consumed => TokenState::Consumed,
            }
        }
    }

    fn consumed(&self, consumer: &str, nonce: &str, now: DateTime<Utc>) -> Self {
        Self {
            state: RecordState::Consumed,
            consumer: Some(consumer.to_owned()),
            consumed_at: Some(now),
            redemption: Some(nonce.to_owned()),
            ..self.clone()
        }
    }

    fn check(&self, id: &str) -> Result<()> {
        if self.id != id {
            return Err(TokenError::invariant_violation(format!(
                "record under {} names token {}",
                short_id(id),
                short_id(&self.id)
            )));
        }
        let consumed_fields = self.consumer.is_some() && self.redemption.is_some();
        match self.state {
            RecordState::Consumed if !consumed_fields => Err(TokenError::invariant_violation(
                "consumed token record has no consumer",
            )),
            RecordState::Active if self.consumer.is_some() => Err(
                TokenError::invariant_violation("active token record names a consumer"),
            ),
            _ => Ok(()),
        }
    }

    fn to_token(&self, now: DateTime<Utc>) -> Token {
        Token {
            id: self.id.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            state: self.state_at(now),
            consumer: self.consumer.clone(),
        }
    }
}

fn encode(record: &TokenRecord) -> Result<Vec<u8>> {
    serde_json::to_vec(record)
        .map_err(|e| TokenError::invariant_violation(format!("token record not encodable: {e}")))
}

/// Issues and redeems one-time access tokens.
#[derive(Debug, Clone)]
pub struct TokenAuthority<S> {
    store: S,
    config: TokenConfig,
}

impl<S: StorageBackend> TokenAuthority<S> {
    /// Creates an authority over `store`.
    pub fn new(store: S, config: TokenConfig) -> Self {
        Self { store, config }
    }

    /// Returns the token settings in use.
    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    fn new_record(&self, now: DateTime<Utc>) -> Result<TokenRecord> {
        Ok(TokenRecord {
            id: random_id(TOKEN_ID_BYTES),
            created_at: now,
            expires_at: now + to_chrono(self.config.ttl())?,
            state: RecordState::Active,
            consumer: None,
            consumed_at: None,
            redemption: None,
        })
    }

    /// Stores a fresh record. A lost acknowledgement is settled by reading
    /// the record back; nobody else writes under a new id.
    async fn write_record(&self, record: &TokenRecord) -> Result<()> {
        let key = record_key(&record.id);
        let ttl = self.config.ttl() + self.config.record_retention();
        match self.store.set_with_ttl(key.clone(), encode(record)?, ttl).await {
            Err(e) if e.outcome_unknown() => match self.store.get(&key).await? {
                Some(_) => Ok(()),
                None => Err(e.into()),
            },
            result => Ok(result?),
        }
    }

    async fn load(&self, id: &str) -> Result<Option<(Bytes, TokenRecord)>> {
        let Some(raw) = self.store.get(&record_key(id)).await? else {
            return Ok(None);
        };
        let record: TokenRecord = serde_json::from_slice(&raw).map_err(|e| {
            TokenError::invariant_violation(format!(
                "token record {} not decodable: {e}",
                short_id(id)
            ))
        })?;
        record.check(id)?;
        Ok(Some((raw, record)))
    }

    async fn current_slot(&self) -> Result<Option<(Bytes, String)>> {
        let Some(raw) = self.store.get(CURRENT_TOKEN_KEY).await? else {
            return Ok(None);
        };
        let id = std::str::from_utf8(&raw)
            .map_err(|_| TokenError::invariant_violation("current token slot is not UTF-8"))?
            .to_owned();
        Ok(Some((raw, id)))
    }

    /// Issues a new token and makes it current.
    ///
    /// The previous current token stays redeemable by id until its own
    /// expiry.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Store`] if the store fails.
    #[tracing::instrument(skip(self))]
    pub async fn issue(&self) -> Result<Token> {
        let now = Utc::now();
        let record = self.new_record(now)?;
        self.write_record(&record).await?;
        self.store.set(CURRENT_TOKEN_KEY.to_vec(), record.id.clone().into_bytes()).await?;

        tracing::info!(token = %short_id(&record.id), expires_at = %record.expires_at, "Token issued");
        Ok(record.to_token(now))
    }

    /// Returns the current token, issuing one if the slot is empty or names
    /// a token that is no longer active.
    ///
    /// Concurrent callers race with compare-and-set on the slot; losers
    /// adopt the winner's token. An unacknowledged slot update is settled
    /// the same way, by re-reading the slot.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Store`] if the store fails, or if the slot
    /// keeps changing under contention.
    #[tracing::instrument(skip(self))]
    pub async fn get_active(&self) -> Result<Token> {
        let mut unacknowledged = None;
        for _ in 0..MAX_SLOT_ATTEMPTS {
            let slot = self.current_slot().await?;
            let now = Utc::now();

            if let Some((_, id)) = &slot
                && let Some((_, record)) = self.load(id).await?
                && record.state_at(now) == TokenState::Active
            {
                return Ok(record.to_token(now));
            }

            let record = self.new_record(now)?;
            self.write_record(&record).await?;
            let expected = slot.as_ref().map(|(raw, _)| &raw[..]);

            match self
                .store
                .compare_and_set(CURRENT_TOKEN_KEY, expected, record.id.clone().into_bytes())
                .await
            {
                Ok(()) => {
                    tracing::info!(token = %short_id(&record.id), "Token issued on demand");
                    return Ok(record.to_token(now));
                },
                Err(StorageError::Conflict) => continue,
                Err(e) if e.is_transient() => {
                    // The next pass adopts whichever active token the slot names.
                    tracing::debug!(error = %e, "Slot update unacknowledged, re-reading");
                    unacknowledged = Some(e);
                },
                Err(e) => return Err(e.into()),
            }
        }

        Err(TokenError::Store(unacknowledged.unwrap_or_else(StorageError::conflict)))
    }

    /// Returns the token with `token_id` without changing it.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`TokenAuthority::consume`].
    #[tracing::instrument(skip(self, token_id), fields(token = %short_id(token_id)))]
    pub async fn inspect(&self, token_id: &str) -> Result<Token> {
        if !is_well_formed(token_id) {
            return Err(TokenError::NotFound);
        }
        let Some((_, record)) = self.load(token_id).await? else {
            return Err(TokenError::NotFound);
        };
        let now = Utc::now();
        match record.state_at(now) {
            TokenState::Active => Ok(record.to_token(now)),
            TokenState::Consumed => Err(TokenError::AlreadyConsumed),
            TokenState::Expired => Err(TokenError::Expired),
        }
    }

    /// Redeems `token_id` for `consumer`.
    ///
    /// Exactly one of any number of concurrent callers succeeds. On success
    /// a replacement token is issued into the slot if the slot still names
    /// the consumed token.
    ///
    /// When the store does not acknowledge the redemption, the record is
    /// re-read: a record carrying this call's redemption nonce means the
    /// write landed, a record consumed under another nonce means another
    /// caller won, and an untouched record is redeemed again.
    ///
    /// # Errors
    ///
    /// - [`TokenError::NotFound`] if no record exists for the id
    /// - [`TokenError::Expired`] if the expiry has passed, whatever the state
    /// - [`TokenError::AlreadyConsumed`] if another caller redeemed it first
    /// - [`TokenError::Store`] if the store fails and re-reading cannot settle the outcome
    #[tracing::instrument(skip(self, token_id), fields(token = %short_id(token_id)))]
    pub async fn consume(&self, token_id: &str, consumer: &str) -> Result<Token> {
        if !is_well_formed(token_id) {
            return Err(TokenError::NotFound);
        }
        let key = record_key(token_id);
        let nonce = random_id(NONCE_BYTES);
        let mut unacknowledged = None;

        for _ in 0..MAX_SLOT_ATTEMPTS {
            let Some((raw, record)) = self.load(token_id).await? else {
                return Err(TokenError::NotFound);
            };
            let now = Utc::now();
            if record.redemption.as_deref() == Some(nonce.as_str()) {
                tracing::info!(consumer = %consumer, "Token redemption confirmed after lost acknowledgement");
                self.replace(token_id).await;
                return Ok(record.to_token(now));
            }
            match record.state_at(now) {
                TokenState::Expired => return Err(TokenError::Expired),
                TokenState::Consumed => return Err(TokenError::AlreadyConsumed),
                TokenState::Active => {},
            }

            let consumed = record.consumed(consumer, &nonce, now);
            let outcome = self
                .store
                .compare_and_set_with_ttl(
                    &key,
                    Some(&raw[..]),
                    encode(&consumed)?,
                    self.retained_for(&record, now),
                )
                .await
                .and_then(|()| {
                    fail::fail_point!("token-consume-lose-ack", |_| Err(StorageError::timeout()));
                    Ok(())
                });

            match outcome {
                Ok(()) => {
                    tracing::info!(consumer = %consumer, "Token consumed");
                    self.replace(token_id).await;
                    return Ok(consumed.to_token(now));
                },
                Err(StorageError::Conflict) => continue,
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "Redemption unacknowledged, re-reading");
                    unacknowledged = Some(e);
                },
                Err(e) => return Err(e.into()),
            }
        }

        Err(TokenError::Store(unacknowledged.unwrap_or_else(StorageError::conflict)))
    }

    /// Time until `record` may be evicted: its expiry plus the retention.
    fn retained_for(&self, record: &TokenRecord, now: DateTime<Utc>) -> Duration {
        let remaining = (record.expires_at - now).to_std().unwrap_or_default();
        (remaining + self.config.record_retention()).max(Duration::from_millis(1))
    }

    /// Issues a replacement for a consumed token. Failures are logged only;
    /// [`TokenAuthority::get_active`] issues lazily if this did not land.
    async fn replace(&self, consumed_id: &str) {
        let result = async {
            let record = self.new_record(Utc::now())?;
            self.write_record(&record).await?;
            self.store
                .compare_and_set(
                    CURRENT_TOKEN_KEY,
                    Some(consumed_id.as_bytes()),
                    record.id.clone().into_bytes(),
                )
                .await?;
            Ok::<_, TokenError>(record.id)
        }
        .await;

        match result {
            Ok(id) => tracing::info!(token = %short_id(&id), "Replacement token issued"),
            Err(TokenError::Store(StorageError::Conflict)) => {
                tracing::debug!("Current token already replaced");
            },
            Err(e) => tracing::warn!(error = %e, "Replacement token not issued"),
        }
    }
}
