//! Concurrency tests for the check-in primitives.
//!
//! Every test races tasks on a multi-threaded runtime against one shared
//! `MemoryBackend`, standing in for worker processes sharing one store.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::{collections::HashSet, sync::Arc, time::Duration};

use checkpoint_core::{
    Action, CheckInService, CheckpointConfig, EventLedger, LedgerConfig, LedgerError,
    RateLimitConfig, RateLimiter, TokenAuthority, TokenConfig, TokenError,
    service::OFFICE_LOCATION,
};
use checkpoint_storage::MemoryBackend;
use tokio::task::JoinSet;

const CONCURRENCY: usize = 16;
const ROUNDS: usize = 20;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_consume_has_exactly_one_winner() {
    let authority = Arc::new(TokenAuthority::new(MemoryBackend::new(), TokenConfig::default()));

    for round in 0..ROUNDS {
        let token = authority.issue().await.expect("issue");

        let mut set = JoinSet::new();
        for scanner in 0..CONCURRENCY {
            let authority = Arc::clone(&authority);
            let id = token.id.clone();
            set.spawn(async move { authority.consume(&id, &format!("scanner-{scanner}")).await });
        }

        let mut winners = 0;
        let mut consumed = 0;
        while let Some(result) = set.join_next().await {
            match result.expect("task panicked") {
                Ok(_) => winners += 1,
                Err(TokenError::AlreadyConsumed) => consumed += 1,
                Err(e) => panic!("round {round}: unexpected error {e:?}"),
            }
        }
        assert_eq!(winners, 1, "round {round}");
        assert_eq!(consumed, CONCURRENCY - 1, "round {round}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lazy_issuers_adopt_one_token() {
    let authority = Arc::new(TokenAuthority::new(MemoryBackend::new(), TokenConfig::default()));

    let mut set = JoinSet::new();
    for _ in 0..CONCURRENCY {
        let authority = Arc::clone(&authority);
        set.spawn(async move { authority.get_active().await });
    }

    let mut ids = HashSet::new();
    while let Some(result) = set.join_next().await {
        ids.insert(result.expect("task panicked").expect("get_active").id);
    }
    assert_eq!(ids.len(), 1, "all callers must see the same token: {ids:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enters_for_one_pair_conflict() {
    let ledger = Arc::new(EventLedger::new(MemoryBackend::new(), LedgerConfig::default()));

    for round in 0..ROUNDS {
        let person = format!("person-{round}");

        let mut set = JoinSet::new();
        for _ in 0..CONCURRENCY {
            let ledger = Arc::clone(&ledger);
            let person = person.clone();
            set.spawn(async move { ledger.record_event(&person, "office", Action::Enter).await });
        }

        let mut winners = 0;
        while let Some(result) = set.join_next().await {
            match result.expect("task panicked") {
                Ok(event) => {
                    assert_eq!(event.sequence, 1);
                    winners += 1;
                },
                Err(LedgerError::Conflict { action: Action::Enter, last: Some(Action::Enter) }) => {},
                Err(e) => panic!("round {round}: unexpected error {e:?}"),
            }
        }
        assert_eq!(winners, 1, "round {round}");
    }

    assert_eq!(ledger.currently_present().await.unwrap().len(), ROUNDS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_events_all_indexed() {
    let ledger = Arc::new(EventLedger::new(
        MemoryBackend::new(),
        LedgerConfig { max_cas_attempts: 64 },
    ));

    let mut set = JoinSet::new();
    for n in 0..CONCURRENCY {
        let ledger = Arc::clone(&ledger);
        set.spawn(async move { ledger.record_event(&format!("p{n}"), "office", Action::Enter).await });
    }
    while let Some(result) = set.join_next().await {
        result.expect("task panicked").expect("record");
    }

    assert_eq!(ledger.currently_present().await.unwrap().len(), CONCURRENCY);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn limiters_sharing_a_store_share_the_window() {
    let store = MemoryBackend::new();
    let limit = 5u64;
    let window = Duration::from_secs(60);

    // One limiter per simulated worker process.
    let mut set = JoinSet::new();
    for _ in 0..CONCURRENCY {
        let limiter = RateLimiter::new(store.clone(), RateLimitConfig::default());
        set.spawn(async move { limiter.allow("203.0.113.9", limit, window).await });
    }

    let mut allowed = 0u64;
    let mut counts = HashSet::new();
    while let Some(result) = set.join_next().await {
        let decision = result.expect("task panicked").expect("allow");
        assert!(counts.insert(decision.count), "counts must be distinct");
        if decision.allowed {
            allowed += 1;
        } else {
            assert!(decision.retry_after > Duration::ZERO);
        }
    }
    assert_eq!(allowed, limit);
}

/// Two people scan the same code at once: one is checked in, the other is
/// told to rescan, and only the winner is present.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_scanners_one_token() {
    let service = Arc::new(CheckInService::new(MemoryBackend::new(), &CheckpointConfig::default()));
    let token = service.tokens().issue().await.expect("issue");

    let mut set = JoinSet::new();
    for user in ["userA", "userB"] {
        let service = Arc::clone(&service);
        let id = token.id.clone();
        set.spawn(async move {
            let result = service
                .submit_with_token(user, &id, user, OFFICE_LOCATION, Action::Enter)
                .await;
            (user, result)
        });
    }

    let mut winner = None;
    let mut loser_messages = Vec::new();
    while let Some(joined) = set.join_next().await {
        let (user, result) = joined.expect("task panicked");
        match result {
            Ok(_) => {
                assert!(winner.replace(user).is_none(), "two winners");
            },
            Err(e) => loser_messages.push(e.user_message()),
        }
    }

    let winner = winner.expect("one scanner must win");
    assert_eq!(loser_messages, vec!["Token already used, please rescan.".to_owned()]);

    let present = service.who_is_here().await.unwrap();
    assert_eq!(present.len(), 1);
    assert_eq!(present[0].person, winner);

    let replacement = service.tokens().get_active().await.unwrap();
    assert_ne!(replacement.id, token.id);
}
