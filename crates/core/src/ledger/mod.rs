//! Attendance event ledger.
//!
//! For every (person, location) pair the store holds the last committed
//! [`Event`]. Appending is a compare-and-set on that record, so concurrent
//! submissions for one pair serialize without any lock, and submissions for
//! different pairs never contend.
//!
//! Events for a pair must alternate `Enter`, `Exit`, `Enter`, ... starting
//! with `Enter`.

mod journal;

use std::{collections::BTreeSet, fmt};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use checkpoint_storage::{StorageBackend, StorageError};
use chrono::{DateTime, Utc};
pub use journal::{EventJournal, JournalError, MemoryEventJournal, TracingEventJournal};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::{config::LedgerConfig, error::LedgerError};

/// Key of the set of known (person, location) pairs.
pub const INDEX_KEY: &[u8] = b"ledger:index";

const LAST_PREFIX: &str = "ledger:last:";
const EVENT_ID_BYTES: usize = 12;

type Result<T> = std::result::Result<T, LedgerError>;

/// Direction of an attendance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Arrival.
    Enter,
    /// Departure.
    Exit,
}

impl Action {
    /// Returns `true` if `self` may follow `last` for the same pair.
    #[must_use]
    pub fn follows(self, last: Option<Action>) -> bool {
        match (last, self) {
            (None | Some(Action::Exit), Action::Enter) => true,
            (Some(Action::Enter), Action::Exit) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enter => f.write_str("enter"),
            Self::Exit => f.write_str("exit"),
        }
    }
}

/// A committed attendance event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Random id, used to recognise this event after a lost acknowledgement.
    pub id: String,
    /// Who.
    pub person: String,
    /// Where.
    pub location: String,
    /// Enter or exit.
    pub action: Action,
    /// Commit time.
    pub timestamp: DateTime<Utc>,
    /// Position in the pair's history, starting at 1.
    pub sequence: u64,
}

/// A person currently checked in somewhere.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Presence {
    /// Who.
    pub person: String,
    /// Where.
    pub location: String,
    /// Time of the `Enter` event.
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct Pair {
    person: String,
    location: String,
}

impl Pair {
    fn new(person: &str, location: &str) -> Self {
        Self { person: person.to_owned(), location: location.to_owned() }
    }

    fn last_key(&self) -> Vec<u8> {
        format!(
            "{LAST_PREFIX}{}:{}",
            URL_SAFE_NO_PAD.encode(&self.person),
            URL_SAFE_NO_PAD.encode(&self.location)
        )
        .into_bytes()
    }
}

fn new_event_id() -> String {
    let mut bytes = [0u8; EVENT_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn decode_event(raw: &[u8]) -> Result<Event> {
    serde_json::from_slice(raw)
        .map_err(|e| LedgerError::invariant_violation(format!("event record not decodable: {e}")))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| LedgerError::invariant_violation(format!("ledger record not encodable: {e}")))
}

/// Records attendance events with per-pair conflict detection.
#[derive(Debug, Clone)]
pub struct EventLedger<S, J = TracingEventJournal> {
    store: S,
    config: LedgerConfig,
    journal: J,
}

impl<S: StorageBackend> EventLedger<S> {
    /// Creates a ledger that journals through `tracing`.
    pub fn new(store: S, config: LedgerConfig) -> Self {
        Self { store, config, journal: TracingEventJournal }
    }
}

impl<S: StorageBackend, J: EventJournal> EventLedger<S, J> {
    /// Replaces the journal.
    pub fn with_journal<K: EventJournal>(self, journal: K) -> EventLedger<S, K> {
        EventLedger { store: self.store, config: self.config, journal }
    }

    /// Returns the journal.
    pub fn journal(&self) -> &J {
        &self.journal
    }

    async fn load_index(&self) -> Result<(Option<Bytes>, BTreeSet<Pair>)> {
        let raw = self.store.get(INDEX_KEY).await?;
        let pairs = match &raw {
            Some(bytes) => serde_json::from_slice(bytes).map_err(|e| {
                LedgerError::invariant_violation(format!("ledger index not decodable: {e}"))
            })?,
            None => BTreeSet::new(),
        };
        Ok((raw, pairs))
    }

    /// Adds `pair` to the index if it is not there yet.
    /// An unacknowledged update is settled by the next pass's re-read.
    async fn ensure_indexed(&self, pair: &Pair) -> Result<()> {
        let mut unacknowledged = None;
        for _ in 0..self.config.max_cas_attempts {
            let (raw, mut pairs) = self.load_index().await?;
            if !pairs.insert(pair.clone()) {
                return Ok(());
            }
            match self.store.compare_and_set(INDEX_KEY, raw.as_deref(), encode(&pairs)?).await {
                Ok(()) => return Ok(()),
                Err(StorageError::Conflict) => continue,
                Err(e) if e.is_transient() => unacknowledged = Some(e),
                Err(e) => return Err(e.into()),
            }
        }
        Err(match unacknowledged {
            Some(e) => e.into(),
            None => LedgerError::Contention { attempts: self.config.max_cas_attempts },
        })
    }

    async fn load_last(&self, key: &[u8]) -> Result<Option<(Bytes, Event)>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        let event = decode_event(&raw)?;
        Ok(Some((raw, event)))
    }

    /// Appends `action` for (`person`, `location`).
    ///
    /// Returns the committed event. Of two concurrent submissions of the
    /// same action for one pair, exactly one succeeds and the other sees the
    /// winner's event and fails with [`LedgerError::Conflict`].
    ///
    /// When the store does not acknowledge the write, the pair's last event
    /// is re-read. Finding this call's event id means the write landed.
    /// Finding a different event at the same position means another writer
    /// won, and the alternation rule is applied against that event. Finding
    /// a later position leaves the outcome unknown.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Conflict`] if `action` does not alternate with the pair's last action
    /// - [`LedgerError::Contention`] if every compare-and-set attempt lost a race
    /// - [`LedgerError::Store`] if the store fails and re-reading cannot settle the outcome
    #[tracing::instrument(skip(self), fields(action = %action))]
    pub async fn record_event(&self, person: &str, location: &str, action: Action) -> Result<Event> {
        let pair = Pair::new(person, location);
        let key = pair.last_key();
        let event_id = new_event_id();
        let mut unacknowledged: Option<(StorageError, u64)> = None;

        self.ensure_indexed(&pair).await?;

        for _ in 0..self.config.max_cas_attempts {
            let current = self.load_last(&key).await?;
            let last = current.as_ref().map(|(_, e)| e);

            if let Some((cause, sequence)) = &unacknowledged {
                match last {
                    Some(stored) if stored.id == event_id => {
                        tracing::info!("Event commit confirmed after lost acknowledgement");
                        self.publish(stored).await;
                        return Ok(stored.clone());
                    },
                    // Only the last event is kept, so ours may lie underneath.
                    Some(stored) if stored.sequence > *sequence => {
                        tracing::warn!(sequence, stored = stored.sequence, "Event commit outcome unknown");
                        return Err(cause.clone().into());
                    },
                    _ => {},
                }
            }

            if !action.follows(last.map(|e| e.action)) {
                let last = last.map(|e| e.action);
                tracing::debug!(last = ?last, "Event rejected");
                return Err(LedgerError::Conflict { action, last });
            }

            let event = Event {
                id: event_id.clone(),
                person: pair.person.clone(),
                location: pair.location.clone(),
                action,
                timestamp: Utc::now(),
                sequence: last.map_or(1, |e| e.sequence + 1),
            };
            let expected = current.as_ref().map(|(raw, _)| &raw[..]);

            let outcome = self
                .store
                .compare_and_set(&key, expected, encode(&event)?)
                .await
                .and_then(|()| {
                    fail::fail_point!("ledger-record-lose-ack", |_| Err(StorageError::timeout()));
                    Ok(())
                });

            match outcome {
                Ok(()) => {
                    self.publish(&event).await;
                    return Ok(event);
                },
                Err(StorageError::Conflict) => continue,
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "Event commit unacknowledged, re-reading");
                    unacknowledged = Some((e, event.sequence));
                },
                Err(e) => return Err(e.into()),
            }
        }

        if let Some((cause, _)) = unacknowledged {
            return Err(cause.into());
        }
        tracing::warn!(attempts = self.config.max_cas_attempts, "Ledger write gave up under contention");
        Err(LedgerError::Contention { attempts: self.config.max_cas_attempts })
    }

    async fn publish(&self, event: &Event) {
        tracing::info!(sequence = event.sequence, "Event recorded");
        if let Err(e) = self.journal.append(event).await {
            tracing::warn!(error = %e, event_id = %event.id, "Event journal append failed");
        }
    }

    /// Reads the last event of every indexed pair in one snapshot.
    async fn last_events(&self, filter: impl Fn(&Pair) -> bool) -> Result<Vec<Event>> {
        let (_, pairs) = self.load_index().await?;
        let keys: Vec<Vec<u8>> = pairs.iter().filter(|p| filter(p)).map(Pair::last_key).collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let values = self.store.get_many(&keys).await?;
        values.into_iter().flatten().map(|raw| decode_event(&raw)).collect()
    }

    /// Returns everyone whose last action at some location is `Enter`.
    ///
    /// All pair records are read at one point in time; a pair first written
    /// after the index was read is not included.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] on store failure.
    #[tracing::instrument(skip(self))]
    pub async fn currently_present(&self) -> Result<Vec<Presence>> {
        let mut present: Vec<Presence> = self
            .last_events(|_| true)
            .await?
            .into_iter()
            .filter(|e| e.action == Action::Enter)
            .map(|e| Presence { person: e.person, location: e.location, since: e.timestamp })
            .collect();
        present.sort();
        Ok(present)
    }

    /// Returns the latest event for `person` across all locations.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] on store failure.
    #[tracing::instrument(skip(self))]
    pub async fn last_event(&self, person: &str) -> Result<Option<Event>> {
        let events = self.last_events(|p| p.person == person).await?;
        Ok(events.into_iter().max_by_key(|e| (e.timestamp, e.sequence)))
    }

    /// Returns the locations where `person` is currently checked in.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] on store failure.
    #[tracing::instrument(skip(self))]
    pub async fn open_sessions(&self, person: &str) -> Result<Vec<String>> {
        Ok(self
            .last_events(|p| p.person == person)
            .await?
            .into_iter()
            .filter(|e| e.action == Action::Enter)
            .map(|e| e.location)
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use checkpoint_storage::{
        MemoryBackend,
        testutil::{FaultMode, FlakyBackend},
    };
    use rstest::rstest;

    use super::*;

    fn ledger() -> EventLedger<MemoryBackend> {
        EventLedger::new(MemoryBackend::new(), LedgerConfig::default())
    }

    struct FailingJournal;

    #[async_trait]
    impl EventJournal for FailingJournal {
        async fn append(&self, _event: &Event) -> std::result::Result<(), JournalError> {
            Err("database down".into())
        }
    }

    #[rstest]
    #[case::first_enter(None, Action::Enter, true)]
    #[case::first_exit(None, Action::Exit, false)]
    #[case::enter_after_exit(Some(Action::Exit), Action::Enter, true)]
    #[case::exit_after_enter(Some(Action::Enter), Action::Exit, true)]
    #[case::double_enter(Some(Action::Enter), Action::Enter, false)]
    #[case::double_exit(Some(Action::Exit), Action::Exit, false)]
    fn test_alternation_rule(
        #[case] last: Option<Action>,
        #[case] action: Action,
        #[case] allowed: bool,
    ) {
        assert_eq!(action.follows(last), allowed);
    }

    #[tokio::test]
    async fn test_enter_enter_conflicts_then_exit_succeeds() {
        let ledger = ledger();

        let first = ledger.record_event("alice", "office", Action::Enter).await.unwrap();
        assert_eq!(first.sequence, 1);

        let err = ledger.record_event("alice", "office", Action::Enter).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Conflict { action: Action::Enter, last: Some(Action::Enter) }
        ));

        let exit = ledger.record_event("alice", "office", Action::Exit).await.unwrap();
        assert_eq!(exit.sequence, 2);
    }

    #[tokio::test]
    async fn test_exit_without_history_conflicts() {
        let err = ledger().record_event("bob", "office", Action::Exit).await.unwrap_err();
        assert!(matches!(err, LedgerError::Conflict { action: Action::Exit, last: None }));
    }

    #[tokio::test]
    async fn test_pairs_are_independent() {
        let ledger = ledger();
        ledger.record_event("alice", "office", Action::Enter).await.unwrap();
        ledger.record_event("alice", "remote", Action::Enter).await.unwrap();
        ledger.record_event("bob", "office", Action::Enter).await.unwrap();

        let mut sessions = ledger.open_sessions("alice").await.unwrap();
        sessions.sort();
        assert_eq!(sessions, vec!["office".to_owned(), "remote".to_owned()]);
    }

    #[tokio::test]
    async fn test_separator_in_names_does_not_collide() {
        let ledger = ledger();
        ledger.record_event("a:b", "c", Action::Enter).await.unwrap();
        ledger.record_event("a", "b:c", Action::Enter).await.unwrap();

        assert_eq!(ledger.currently_present().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_currently_present_lists_only_entered_pairs() {
        let ledger = ledger();
        ledger.record_event("alice", "office", Action::Enter).await.unwrap();
        ledger.record_event("bob", "office", Action::Enter).await.unwrap();
        ledger.record_event("bob", "office", Action::Exit).await.unwrap();

        let present = ledger.currently_present().await.unwrap();
        assert_eq!(present.len(), 1);
        assert_eq!(present[0].person, "alice");
        assert_eq!(present[0].location, "office");
    }

    #[tokio::test]
    async fn test_empty_ledger_queries() {
        let ledger = ledger();
        assert!(ledger.currently_present().await.unwrap().is_empty());
        assert!(ledger.last_event("nobody").await.unwrap().is_none());
        assert!(ledger.open_sessions("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_last_event_spans_locations() {
        let ledger = ledger();
        ledger.record_event("alice", "office", Action::Enter).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        ledger.record_event("alice", "remote", Action::Enter).await.unwrap();

        let last = ledger.last_event("alice").await.unwrap().unwrap();
        assert_eq!(last.location, "remote");
    }

    #[tokio::test]
    async fn test_journal_receives_committed_events_only() {
        let journal = MemoryEventJournal::new();
        let ledger = ledger().with_journal(journal.clone());

        ledger.record_event("alice", "office", Action::Enter).await.unwrap();
        let _ = ledger.record_event("alice", "office", Action::Enter).await;
        ledger.record_event("alice", "office", Action::Exit).await.unwrap();

        let actions: Vec<Action> = journal.events().iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![Action::Enter, Action::Exit]);
    }

    #[tokio::test]
    async fn test_journal_failure_keeps_commit() {
        let ledger = ledger().with_journal(Arc::new(FailingJournal));

        ledger.record_event("alice", "office", Action::Enter).await.unwrap();
        assert!(matches!(
            ledger.record_event("alice", "office", Action::Enter).await,
            Err(LedgerError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_commit_confirmed_after_lost_acknowledgement() {
        let store = FlakyBackend::new();
        let ledger = EventLedger::new(store.clone(), LedgerConfig::default());
        ledger.record_event("alice", "office", Action::Enter).await.unwrap();

        store.set_mode(FaultMode::LoseAcks);
        let exit = ledger.record_event("alice", "office", Action::Exit).await.unwrap();
        store.set_mode(FaultMode::Healthy);

        assert_eq!(exit.sequence, 2);
        assert_eq!(ledger.last_event("alice").await.unwrap().unwrap().id, exit.id);
    }

    fn rival_event(action: Action, sequence: u64) -> Vec<u8> {
        let rival = Event {
            id: "rival".to_owned(),
            person: "alice".to_owned(),
            location: "office".to_owned(),
            action,
            timestamp: Utc::now(),
            sequence,
        };
        encode(&rival).unwrap()
    }

    #[tokio::test]
    async fn test_lost_ack_then_rival_same_action_conflicts() {
        let store = FlakyBackend::new();
        let ledger = EventLedger::new(store.clone(), LedgerConfig::default());
        ledger.record_event("alice", "office", Action::Enter).await.unwrap();

        let key = Pair::new("alice", "office").last_key();
        store.lose_next_race(&key, rival_event(Action::Exit, 2));

        let err = ledger.record_event("alice", "office", Action::Exit).await.unwrap_err();
        assert!(
            matches!(err, LedgerError::Conflict { action: Action::Exit, last: Some(Action::Exit) }),
            "got {err:?}"
        );
        assert_eq!(ledger.last_event("alice").await.unwrap().unwrap().id, "rival");
    }

    #[tokio::test]
    async fn test_lost_ack_without_landing_commits_on_retry() {
        let store = FlakyBackend::new();
        let ledger = EventLedger::new(store.clone(), LedgerConfig::default());
        let enter = ledger.record_event("alice", "office", Action::Enter).await.unwrap();

        let key = Pair::new("alice", "office").last_key();
        store.lose_next_race(&key, encode(&enter).unwrap());

        let exit = ledger.record_event("alice", "office", Action::Exit).await.unwrap();
        assert_eq!(exit.sequence, 2);
        assert_eq!(ledger.last_event("alice").await.unwrap().unwrap().id, exit.id);
    }

    #[tokio::test]
    async fn test_lost_ack_under_later_history_stays_unknown() {
        let store = FlakyBackend::new();
        let ledger = EventLedger::new(store.clone(), LedgerConfig::default());
        ledger.record_event("alice", "office", Action::Enter).await.unwrap();

        let key = Pair::new("alice", "office").last_key();
        store.lose_next_race(&key, rival_event(Action::Enter, 3));

        let err = ledger.record_event("alice", "office", Action::Exit).await.unwrap_err();
        assert!(matches!(err, LedgerError::Store(StorageError::Timeout)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_without_commit() {
        let store = FlakyBackend::new();
        let ledger = EventLedger::new(store.clone(), LedgerConfig::default());

        store.set_mode(FaultMode::Unreachable);
        let err = ledger.record_event("alice", "office", Action::Enter).await.unwrap_err();
        store.set_mode(FaultMode::Healthy);

        assert!(matches!(err, LedgerError::Store(e) if e.is_transient()));
        assert!(ledger.currently_present().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_record_is_invariant_violation() {
        let ledger = ledger();
        let pair = Pair::new("alice", "office");
        ledger.record_event("alice", "office", Action::Enter).await.unwrap();
        ledger.store.set(pair.last_key(), b"garbage".to_vec()).await.unwrap();

        let err = ledger.record_event("alice", "office", Action::Exit).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvariantViolation(_)));
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        fn arb_action() -> impl Strategy<Value = Action> {
            prop_oneof![Just(Action::Enter), Just(Action::Exit)]
        }

        proptest! {
            /// Any submission sequence is accepted exactly where a simple
            /// alternation model accepts it.
            #[test]
            fn ledger_matches_alternation_model(
                actions in proptest::collection::vec(arb_action(), 1..32),
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("runtime");

                rt.block_on(async {
                    let ledger = ledger();
                    let mut model: Option<Action> = None;
                    let mut committed = 0u64;

                    for action in actions {
                        let result = ledger.record_event("p", "l", action).await;
                        if action.follows(model) {
                            let event = result.unwrap();
                            committed += 1;
                            prop_assert_eq!(event.sequence, committed);
                            model = Some(action);
                        } else {
                            let is_conflict = matches!(result, Err(LedgerError::Conflict { .. }));
                            prop_assert!(is_conflict);
                        }
                    }

                    let present = !ledger.currently_present().await.unwrap().is_empty();
                    prop_assert_eq!(present, model == Some(Action::Enter));
                    Ok(())
                })?;
            }
        }
    }
}
