//! Downstream persistence of committed events.
//!
//! The store is authoritative for the alternation rule. A journal receives
//! each event after it is committed there, for reporting and export by an
//! external system. A journal failure never rolls back the commit.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::Event;

/// Error returned by a journal.
pub type JournalError = Box<dyn std::error::Error + Send + Sync>;

/// Sink for committed events.
#[async_trait]
pub trait EventJournal: Send + Sync {
    /// Persists one committed event.
    async fn append(&self, event: &Event) -> Result<(), JournalError>;
}

#[async_trait]
impl<J: EventJournal + ?Sized> EventJournal for Arc<J> {
    async fn append(&self, event: &Event) -> Result<(), JournalError> {
        (**self).append(event).await
    }
}

/// Emits each event as a structured `tracing` record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventJournal;

#[async_trait]
impl EventJournal for TracingEventJournal {
    async fn append(&self, event: &Event) -> Result<(), JournalError> {
        tracing::info!(
            event.id = %event.id,
            event.person = %event.person,
            event.location = %event.location,
            event.action = %event.action,
            event.sequence = event.sequence,
            event.timestamp = %event.timestamp.to_rfc3339(),
            "Attendance event"
        );
        Ok(())
    }
}

/// Keeps events in memory, in commit order.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventJournal {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MemoryEventJournal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every event appended so far.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventJournal for MemoryEventJournal {
    async fn append(&self, event: &Event) -> Result<(), JournalError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
