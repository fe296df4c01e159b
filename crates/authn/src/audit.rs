//! Audit trail for signing key administration.
//!
//! Every [`RotationAdmin`](crate::rotation::RotationAdmin) call produces one
//! [`AuditEvent`]: who acted, what they did, which key it concerned and how it
//! ended. Events go to an [`AuditLogger`]; the default writes them to
//! `tracing` under the `checkpoint::audit` target so they can be filtered
//! apart from operational logs.
//!
//! ```
//! use checkpoint_authn::audit::{AuditAction, AuditEvent, AuditOutcome};
//!
//! let event = AuditEvent::new("ops@example.com", AuditAction::Rotate)
//!     .kid("Xk3v9QpLr2A")
//!     .detail("retired_kid", "Mw81cZ0aPqE");
//! assert_eq!(event.outcome, AuditOutcome::Success);
//! ```

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Administrative action on the signing key slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// The slot was created with its first key.
    Bootstrap,
    /// The slot state was read.
    Status,
    /// The signing key was rotated.
    Rotate,
    /// The slot was checked for consistency.
    Verify,
    /// A retired key was removed.
    PurgePrevious,
}

impl AuditAction {
    /// Stable name used in log fields.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Status => "status",
            Self::Rotate => "rotate",
            Self::Verify => "verify",
            Self::PurgePrevious => "purge_previous",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an audited call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The call completed.
    Success,
    /// The call was evaluated without writing.
    DryRun,
    /// The call failed.
    Failure(String),
}

/// One audited call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    /// When the call finished.
    pub at: DateTime<Utc>,
    /// Operator identity.
    pub actor: String,
    /// What was done.
    pub action: AuditAction,
    /// Key the call concerned, if it got far enough to know.
    pub kid: Option<String>,
    /// Result.
    #[serde(flatten)]
    pub outcome: AuditOutcome,
    /// Extra context, e.g. the retired key id.
    pub detail: BTreeMap<&'static str, String>,
}

impl AuditEvent {
    /// A successful event stamped now.
    #[must_use]
    pub fn new(actor: impl Into<String>, action: AuditAction) -> Self {
        Self {
            at: Utc::now(),
            actor: actor.into(),
            action,
            kid: None,
            outcome: AuditOutcome::Success,
            detail: BTreeMap::new(),
        }
    }

    /// Sets the key id.
    #[must_use]
    pub fn kid(mut self, kid: impl Into<String>) -> Self {
        self.kid = Some(kid.into());
        self
    }

    /// Sets the outcome.
    #[must_use]
    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Marks the event failed with the error's message.
    #[must_use]
    pub fn failed(self, err: &impl std::fmt::Display) -> Self {
        self.outcome(AuditOutcome::Failure(err.to_string()))
    }

    /// Adds a detail entry.
    #[must_use]
    pub fn detail(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.detail.insert(key, value.into());
        self
    }
}

/// Sink for audit events.
#[async_trait]
pub trait AuditLogger: Send + Sync {
    /// Records one event.
    async fn log(&self, event: &AuditEvent);
}

#[async_trait]
impl<L: AuditLogger> AuditLogger for Arc<L> {
    async fn log(&self, event: &AuditEvent) {
        (**self).log(event).await;
    }
}

/// Writes events to `tracing`; failures at `WARN`, everything else at `INFO`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

#[async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, event: &AuditEvent) {
        let kid = event.kid.as_deref().unwrap_or("-");
        let detail = serde_json::to_string(&event.detail).unwrap_or_default();
        match &event.outcome {
            AuditOutcome::Failure(reason) => tracing::warn!(
                target: "checkpoint::audit",
                actor = %event.actor,
                action = event.action.as_str(),
                kid,
                reason = %reason,
                "key administration failed"
            ),
            outcome => tracing::info!(
                target: "checkpoint::audit",
                actor = %event.actor,
                action = event.action.as_str(),
                kid,
                dry_run = matches!(outcome, AuditOutcome::DryRun),
                detail = %detail,
                "key administration"
            ),
        }
    }
}

/// Keeps events in memory; clones share the buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditLogger {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditLogger {
    /// Creates an empty logger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl AuditLogger for MemoryAuditLogger {
    async fn log(&self, event: &AuditEvent) {
        self.events.lock().push(event.clone());
    }
}
