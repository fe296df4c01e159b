//! Check-in control flow.
//!
//! Token-gated submissions pass the rate limiter, then the token authority,
//! then the ledger. Credential-gated submissions are verified before any of
//! that.

use checkpoint_authn::{AuthError, CredentialVerifier};
use checkpoint_storage::StorageBackend;

use crate::{
    access::{AccessKeyGuard, TokenLink},
    config::CheckpointConfig,
    error::{LedgerError, RateLimitError, Result},
    ledger::{Action, Event, EventJournal, EventLedger, Presence, TracingEventJournal},
    rate_limit::{RateLimiter, RouteClass},
    store::SharedStore,
    token::{Token, TokenAuthority},
};

/// Location recorded for token-gated check-ins at the office terminal.
pub const OFFICE_LOCATION: &str = "global";

/// Location recorded for remote work sessions.
pub const REMOTE_LOCATION: &str = "remote";

/// The four primitives wired together over one store.
#[derive(Debug, Clone)]
pub struct CheckInService<S, J = TracingEventJournal> {
    tokens: TokenAuthority<S>,
    ledger: EventLedger<S, J>,
    limiter: RateLimiter<S>,
    verifier: CredentialVerifier<S>,
    guard: AccessKeyGuard,
}

impl CheckInService<SharedStore> {
    /// Validates `config`, selects the store and builds the service.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Config`](crate::error::CheckpointError::Config) if the configuration is invalid.
    pub async fn from_config(config: &CheckpointConfig) -> Result<Self> {
        config.validate()?;
        let store = SharedStore::connect(&config.store).await;
        Ok(Self::new(store, config))
    }
}

impl<S: StorageBackend + Clone> CheckInService<S> {
    /// Builds the service over `store`. `config` is assumed valid.
    pub fn new(store: S, config: &CheckpointConfig) -> Self {
        Self {
            tokens: TokenAuthority::new(store.clone(), config.tokens.clone()),
            ledger: EventLedger::new(store.clone(), config.ledger),
            limiter: RateLimiter::new(store.clone(), config.rate_limit.clone()),
            verifier: CredentialVerifier::new(store, config.credentials.clone()),
            guard: AccessKeyGuard::from_config(&config.tokens),
        }
    }
}

impl<S: StorageBackend, J: EventJournal> CheckInService<S, J> {
    /// Replaces the ledger's journal.
    pub fn with_journal<K: EventJournal>(self, journal: K) -> CheckInService<S, K> {
        CheckInService {
            tokens: self.tokens,
            ledger: self.ledger.with_journal(journal),
            limiter: self.limiter,
            verifier: self.verifier,
            guard: self.guard,
        }
    }

    /// Returns the token authority.
    pub fn tokens(&self) -> &TokenAuthority<S> {
        &self.tokens
    }

    /// Returns the event ledger.
    pub fn ledger(&self) -> &EventLedger<S, J> {
        &self.ledger
    }

    /// Returns the rate limiter.
    pub fn limiter(&self) -> &RateLimiter<S> {
        &self.limiter
    }

    /// Returns the credential verifier.
    pub fn verifier(&self) -> &CredentialVerifier<S> {
        &self.verifier
    }

    /// Applies the rate limit for `route`, letting the request through on a
    /// store failure when configured to fail open.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::RateLimit`](crate::error::CheckpointError::RateLimit) if the client is over its limit,
    /// or if the store fails and the limiter fails closed.
    pub async fn admit(&self, route: RouteClass, client: &str) -> Result<()> {
        match self.limiter.check(route, client).await {
            Ok(_) => Ok(()),
            Err(RateLimitError::Store(e)) if self.limiter.config().fail_open => {
                tracing::warn!(route = %route, error = %e, "Rate limiter unavailable, failing open");
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the current token link for a display terminal.
    ///
    /// # Errors
    ///
    /// - [`AuthError::CredentialInvalid`] if the access key is missing or wrong
    /// - [`RateLimitError::Exceeded`] if the caller is over the API limit
    /// - [`CheckpointError::Token`](crate::error::CheckpointError::Token) if the store fails
    #[tracing::instrument(skip(self, access_key))]
    pub async fn current_token(&self, client: &str, access_key: Option<&str>) -> Result<TokenLink> {
        if !self.guard.admits(access_key) {
            tracing::warn!("Token fetch with a bad access key");
            return Err(AuthError::CredentialInvalid.into());
        }
        self.admit(RouteClass::Api, client).await?;
        let token = self.tokens.get_active().await?;
        Ok(TokenLink::render(&token, self.tokens.config()))
    }

    /// Issues a fresh token, replacing the current one.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Exceeded`] over the token creation limit and
    /// [`CheckpointError::Token`](crate::error::CheckpointError::Token) on store failure.
    #[tracing::instrument(skip(self))]
    pub async fn issue_token(&self, client: &str) -> Result<TokenLink> {
        self.admit(RouteClass::TokenCreation, client).await?;
        let token = self.tokens.issue().await?;
        Ok(TokenLink::render(&token, self.tokens.config()))
    }

    /// Checks that a scanned token is still redeemable.
    ///
    /// # Errors
    ///
    /// Returns the token's redemption failure, if any.
    pub async fn inspect_token(&self, token_id: &str) -> Result<Token> {
        Ok(self.tokens.inspect(token_id).await?)
    }

    /// Redeems `token_id` and records `action` for `person` at `location`.
    ///
    /// The token is spent even when the ledger then rejects the action; the
    /// scanner rescans the replacement.
    ///
    /// # Errors
    ///
    /// Rate limit, token and ledger failures, in that order of checking.
    #[tracing::instrument(skip(self, token_id))]
    pub async fn submit_with_token(
        &self,
        client: &str,
        token_id: &str,
        person: &str,
        location: &str,
        action: Action,
    ) -> Result<Event> {
        self.admit(RouteClass::CheckIn, client).await?;
        self.tokens.consume(token_id, person).await?;
        Ok(self.ledger.record_event(person, location, action).await?)
    }

    /// Records `action` for the holder of `credential`.
    ///
    /// # Errors
    ///
    /// Credential failures first, then rate limit and ledger failures.
    #[tracing::instrument(skip(self, credential))]
    pub async fn submit_authenticated(
        &self,
        credential: &str,
        client: &str,
        location: &str,
        action: Action,
    ) -> Result<Event> {
        let claims = self.verifier.verify(credential).await?;
        self.admit(RouteClass::CheckIn, client).await?;
        Ok(self.ledger.record_event(&claims.sub, location, action).await?)
    }

    /// Starts a remote work session for `person`.
    ///
    /// The open-session check and the remote `Enter` are two separate store
    /// operations, not one atomic step. An office check-in for the same
    /// person that commits between them is not seen, and both sessions end
    /// up open. Office check-ins never look at the remote session either.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Conflict`] if `person` is checked in anywhere.
    pub async fn remote_start(&self, person: &str) -> Result<Event> {
        if let Some(open) = self.ledger.open_sessions(person).await?.into_iter().next() {
            tracing::debug!(location = %open, "Remote start refused, session open");
            return Err(LedgerError::Conflict { action: Action::Enter, last: Some(Action::Enter) }
                .into());
        }
        Ok(self.ledger.record_event(person, REMOTE_LOCATION, Action::Enter).await?)
    }

    /// Ends the remote work session of `person`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Conflict`] if no remote session is open.
    pub async fn remote_end(&self, person: &str) -> Result<Event> {
        Ok(self.ledger.record_event(person, REMOTE_LOCATION, Action::Exit).await?)
    }

    /// Returns the locations where `person` is checked in.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Ledger`](crate::error::CheckpointError::Ledger) on store failure.
    pub async fn status(&self, person: &str) -> Result<Vec<String>> {
        Ok(self.ledger.open_sessions(person).await?)
    }

    /// Returns everyone currently checked in.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Ledger`](crate::error::CheckpointError::Ledger) on store failure.
    pub async fn who_is_here(&self) -> Result<Vec<Presence>> {
        Ok(self.ledger.currently_present().await?)
    }

    /// Returns the latest event for `person`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Ledger`](crate::error::CheckpointError::Ledger) on store failure.
    pub async fn last_event(&self, person: &str) -> Result<Option<Event>> {
        Ok(self.ledger.last_event(person).await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use checkpoint_storage::{
        MemoryBackend,
        testutil::{FaultMode, FlakyBackend},
    };

    use super::*;
    use crate::{
        config::{RateLimitConfig, RoutePolicy, TokenConfig},
        error::{CheckpointError, ErrorKind},
        ledger::MemoryEventJournal,
    };

    fn service() -> CheckInService<MemoryBackend> {
        CheckInService::new(MemoryBackend::new(), &CheckpointConfig::default())
    }

    #[tokio::test]
    async fn test_token_gated_check_in_and_out() {
        let service = service();

        let link = service.current_token("terminal", None).await.unwrap();
        let enter = service
            .submit_with_token("alice", &link.id, "alice", OFFICE_LOCATION, Action::Enter)
            .await
            .unwrap();
        assert_eq!(enter.action, Action::Enter);

        let next = service.current_token("terminal", None).await.unwrap();
        assert_ne!(next.id, link.id);

        service
            .submit_with_token("alice", &next.id, "alice", OFFICE_LOCATION, Action::Exit)
            .await
            .unwrap();
        assert!(service.who_is_here().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reused_token_asks_for_rescan() {
        let service = service();
        let link = service.current_token("terminal", None).await.unwrap();
        service
            .submit_with_token("alice", &link.id, "alice", OFFICE_LOCATION, Action::Enter)
            .await
            .unwrap();

        let err = service
            .submit_with_token("bob", &link.id, "bob", OFFICE_LOCATION, Action::Enter)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TokenAlreadyConsumed);
        assert!(err.user_message().contains("rescan"));
    }

    #[tokio::test]
    async fn test_conflict_still_spends_token() {
        let service = service();
        let first = service.current_token("t", None).await.unwrap();
        let err = service
            .submit_with_token("bob", &first.id, "bob", OFFICE_LOCATION, Action::Exit)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EventConflict);

        assert!(service.inspect_token(&first.id).await.is_err());
    }

    #[tokio::test]
    async fn test_access_key_required_when_configured() {
        let config = CheckpointConfig {
            tokens: TokenConfig::builder().access_key("k3y").build().unwrap(),
            ..CheckpointConfig::default()
        };
        let service = CheckInService::new(MemoryBackend::new(), &config);

        let denied = service.current_token("t", Some("nope")).await.unwrap_err();
        assert_eq!(denied.status_code(), 401);
        service.current_token("t", Some("k3y")).await.unwrap();
    }

    #[tokio::test]
    async fn test_authenticated_submission_uses_credential_subject() {
        let journal = MemoryEventJournal::new();
        let service = service().with_journal(journal.clone());
        let credential = service.verifier().sign("carol", "user").await.unwrap();

        let event = service
            .submit_authenticated(&credential, "10.0.0.9", OFFICE_LOCATION, Action::Enter)
            .await
            .unwrap();
        assert_eq!(event.person, "carol");
        assert_eq!(journal.events().len(), 1);
    }

    #[tokio::test]
    async fn test_bad_credential_stops_before_ledger() {
        let service = service();
        let err = service
            .submit_authenticated("not.a.jwt", "c", OFFICE_LOCATION, Action::Enter)
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), 401);
        assert!(service.who_is_here().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_session_rules() {
        let service = service();
        let link = service.current_token("t", None).await.unwrap();
        service
            .submit_with_token("dave", &link.id, "dave", OFFICE_LOCATION, Action::Enter)
            .await
            .unwrap();

        let refused = service.remote_start("dave").await.unwrap_err();
        assert_eq!(refused.kind(), ErrorKind::EventConflict);
        assert_eq!(service.remote_end("dave").await.unwrap_err().kind(), ErrorKind::EventConflict);

        service.remote_start("erin").await.unwrap();
        assert_eq!(service.status("erin").await.unwrap(), vec![REMOTE_LOCATION.to_owned()]);
        service.remote_end("erin").await.unwrap();
        assert!(service.status("erin").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_office_check_in_during_remote_session_is_accepted() {
        let service = service();
        service.remote_start("frank").await.unwrap();

        let link = service.current_token("t", None).await.unwrap();
        service
            .submit_with_token("frank", &link.id, "frank", OFFICE_LOCATION, Action::Enter)
            .await
            .unwrap();

        let mut open = service.status("frank").await.unwrap();
        open.sort();
        assert_eq!(open, vec![OFFICE_LOCATION.to_owned(), REMOTE_LOCATION.to_owned()]);
    }

    #[tokio::test]
    async fn test_check_in_rate_limit_guards_token() {
        let config = CheckpointConfig {
            rate_limit: RateLimitConfig::default()
                .with_policy(RouteClass::CheckIn, RoutePolicy::new(1, Duration::from_secs(60))),
            ..CheckpointConfig::default()
        };
        let service = CheckInService::new(MemoryBackend::new(), &config);

        let link = service.current_token("t", None).await.unwrap();
        service
            .submit_with_token("frank", &link.id, "frank", OFFICE_LOCATION, Action::Enter)
            .await
            .unwrap();

        let link = service.current_token("t", None).await.unwrap();
        let err = service
            .submit_with_token("frank", &link.id, "frank", OFFICE_LOCATION, Action::Exit)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
        assert!(err.user_message().starts_with("Too many requests"));

        // The limited request never reached the token authority.
        service.inspect_token(&link.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_open_when_limiter_store_fails() {
        let store = FlakyBackend::new();
        let service = CheckInService::new(store.clone(), &CheckpointConfig::default());

        store.set_mode(FaultMode::Unreachable);
        service.admit(RouteClass::CheckIn, "c").await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_closed_when_configured() {
        let store = FlakyBackend::new();
        let config = CheckpointConfig {
            rate_limit: RateLimitConfig { fail_open: false, ..RateLimitConfig::default() },
            ..CheckpointConfig::default()
        };
        let service = CheckInService::new(store.clone(), &config);

        store.set_mode(FaultMode::Unreachable);
        let err = service.admit(RouteClass::CheckIn, "c").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    }

    #[tokio::test]
    async fn test_from_config_rejects_invalid_config() {
        let mut config = CheckpointConfig::default();
        config.ledger.max_cas_attempts = 0;

        let err = CheckInService::from_config(&config).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Config(_)));
    }

    #[tokio::test]
    async fn test_from_config_defaults_to_in_process_store() {
        let service = CheckInService::from_config(&CheckpointConfig::default()).await.unwrap();
        service.remote_start("gina").await.unwrap();
        assert_eq!(service.who_is_here().await.unwrap().len(), 1);
    }
}
