//! Token, ledger and key rotation running over `FailoverBackend`.
//!
//! A `FlakyBackend` plays the distributed primary so lost replies and
//! outages can be switched on between steps of a flow. The in-process
//! fallback must never receive a write the primary may already hold.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::time::Duration;

use checkpoint_authn::{CredentialConfig, CredentialVerifier, SigningKeyMaterial, slot::SIGNING_SLOT_KEY};
use checkpoint_core::{
    Action, CheckInService, CheckpointConfig, EventLedger, LedgerConfig, LedgerError, TokenAuthority,
    TokenConfig, TokenError,
    ledger::INDEX_KEY,
    service::{OFFICE_LOCATION, REMOTE_LOCATION},
};
use checkpoint_storage::{
    MemoryBackend, StorageBackend,
    testutil::{FaultMode, FlakyBackend},
};
use checkpoint_storage_redis::{CircuitBreakerConfig, FailoverBackend};

type Store = FailoverBackend<FlakyBackend, MemoryBackend>;

fn store(failure_threshold: u32, recovery_timeout: Duration) -> Store {
    let breaker = CircuitBreakerConfig::builder()
        .failure_threshold(failure_threshold)
        .recovery_timeout(recovery_timeout)
        .build()
        .expect("valid breaker config");
    FailoverBackend::new(FlakyBackend::new(), MemoryBackend::new(), breaker)
}

#[tokio::test]
async fn redemption_with_lost_primary_ack_is_confirmed() {
    let store = store(5, Duration::from_secs(30));
    let authority = TokenAuthority::new(store.clone(), TokenConfig::default());
    let token = authority.issue().await.unwrap();

    store.primary().set_mode(FaultMode::LoseAcks);
    let consumed = authority.consume(&token.id, "alice").await.expect("redemption landed");
    assert_eq!(consumed.consumer.as_deref(), Some("alice"));

    store.primary().set_mode(FaultMode::Healthy);
    assert!(matches!(authority.consume(&token.id, "bob").await, Err(TokenError::AlreadyConsumed)));

    // The primary holds the redemption; the fallback never saw the token.
    let on_primary = TokenAuthority::new(store.primary().clone(), TokenConfig::default());
    assert!(matches!(on_primary.inspect(&token.id).await, Err(TokenError::AlreadyConsumed)));
    let on_fallback = TokenAuthority::new(store.fallback().clone(), TokenConfig::default());
    assert!(matches!(on_fallback.inspect(&token.id).await, Err(TokenError::NotFound)));
    assert!(!store.is_degraded());
}

#[tokio::test]
async fn ledger_commit_with_lost_primary_ack_is_confirmed() {
    let store = store(5, Duration::from_secs(30));
    let ledger = EventLedger::new(store.clone(), LedgerConfig::default());
    ledger.record_event("alice", "office", Action::Enter).await.unwrap();

    store.primary().set_mode(FaultMode::LoseAcks);
    let exit = ledger.record_event("alice", "office", Action::Exit).await.expect("commit landed");
    assert_eq!(exit.sequence, 2);

    // A client retry after the lost reply is a conflict, not a second Exit.
    let retry = ledger.record_event("alice", "office", Action::Exit).await.unwrap_err();
    assert!(matches!(retry, LedgerError::Conflict { action: Action::Exit, last: Some(Action::Exit) }));
    store.primary().set_mode(FaultMode::Healthy);

    assert_eq!(ledger.last_event("alice").await.unwrap().unwrap().id, exit.id);
    assert_eq!(store.fallback().get(INDEX_KEY).await.unwrap(), None);
    assert_eq!(store.metrics().fallback_calls, 0);
}

#[tokio::test]
async fn rotation_with_lost_primary_ack_is_confirmed() {
    let store = store(5, Duration::from_secs(30));
    let verifier = CredentialVerifier::new(store.clone(), CredentialConfig::default());
    verifier.bootstrap().await.unwrap();
    let credential = verifier.sign("alice", "user").await.unwrap();

    let next = SigningKeyMaterial::generate();
    let kid = next.kid().to_owned();
    store.primary().set_mode(FaultMode::LoseAcks);
    let slot = verifier.rotate(next).await.expect("rotation landed");
    store.primary().set_mode(FaultMode::Healthy);

    assert_eq!(slot.current.kid(), kid);
    assert_eq!(verifier.slot().await.unwrap().current.kid(), kid);
    assert_eq!(store.fallback().get(SIGNING_SLOT_KEY).await.unwrap(), None);

    // Credentials from before the rotation verify during the grace period.
    assert_eq!(verifier.verify(&credential).await.unwrap().sub, "alice");
}

#[tokio::test]
async fn outage_mid_flow_continues_in_process_then_recovers() {
    let store = store(2, Duration::from_millis(50));
    let service = CheckInService::new(store.clone(), &CheckpointConfig::default());

    let link = service.current_token("scanner", None).await.unwrap();
    service
        .submit_with_token("10.0.0.1", &link.id, "alice", OFFICE_LOCATION, Action::Enter)
        .await
        .unwrap();

    store.primary().set_mode(FaultMode::Unreachable);

    // Check-ins keep working against the in-process store.
    let degraded_link = service.current_token("scanner", None).await.unwrap();
    service
        .submit_with_token("10.0.0.2", &degraded_link.id, "bob", OFFICE_LOCATION, Action::Enter)
        .await
        .unwrap();
    service.remote_start("carol").await.unwrap();
    assert!(store.is_degraded());

    // State from before the outage lives only in the primary.
    let present: Vec<String> =
        service.who_is_here().await.unwrap().into_iter().map(|p| p.person).collect();
    assert_eq!(present, vec!["bob".to_owned(), "carol".to_owned()]);

    store.primary().set_mode(FaultMode::Healthy);
    tokio::time::sleep(Duration::from_millis(80)).await;

    let present = service.who_is_here().await.unwrap();
    assert!(!store.is_degraded());
    assert_eq!(present.len(), 1);
    assert_eq!(present[0].person, "alice");
    assert!(service.status("carol").await.unwrap().iter().all(|l| l != REMOTE_LOCATION));
}
