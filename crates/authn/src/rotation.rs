//! Operator-facing key rotation.
//!
//! [`RotationAdmin`] wraps a [`CredentialVerifier`] with the operations an
//! operator runs by hand: inspect the slot, rotate (optionally as a dry run),
//! check the slot for consistency and purge a retired key. Each operation
//! emits an [`AuditEvent`].

use checkpoint_storage::StorageBackend;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    audit::{AuditAction, AuditEvent, AuditLogger, AuditOutcome, TracingAuditLogger},
    error::{AuthError, Result},
    keys::SigningKeyMaterial,
    slot::{SigningKeySlot, SlotState},
    verifier::CredentialVerifier,
};

/// Snapshot of the signing key slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationStatus {
    /// Stable or rotating.
    pub state: SlotState,
    /// Id of the signing key.
    pub current_kid: String,
    /// Id of the retired key, while it is still stored.
    pub previous_kid: Option<String>,
    /// When the last rotation happened.
    pub rotated_at: Option<DateTime<Utc>>,
    /// When the retired key stops verifying.
    pub previous_valid_until: Option<DateTime<Utc>>,
}

impl RotationStatus {
    fn of(slot: &SigningKeySlot, now: DateTime<Utc>) -> Self {
        Self {
            state: slot.state(now),
            current_kid: slot.current.kid().to_owned(),
            previous_kid: slot.previous.as_ref().map(|k| k.kid().to_owned()),
            rotated_at: slot.rotated_at,
            previous_valid_until: slot.previous_valid_until,
        }
    }
}

/// Outcome of [`RotationAdmin::execute`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    /// `true` if nothing was written.
    pub dry_run: bool,
    /// Key that was (or would be) retired.
    pub retired_kid: String,
    /// Key that now signs (or would sign).
    pub new_kid: String,
    /// When the retired key stops verifying.
    pub previous_valid_until: DateTime<Utc>,
}

/// One consistency check performed by [`RotationAdmin::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotCheck {
    /// Short check name.
    pub name: &'static str,
    /// Whether the check passed.
    pub passed: bool,
    /// Failure detail, empty when passed.
    pub detail: String,
}

impl SlotCheck {
    fn from_result(name: &'static str, result: Result<()>) -> Self {
        match result {
            Ok(()) => Self { name, passed: true, detail: String::new() },
            Err(e) => Self { name, passed: false, detail: e.to_string() },
        }
    }
}

/// Outcome of [`RotationAdmin::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    /// Slot state at the time of the check.
    pub status: RotationStatus,
    /// Individual checks, in evaluation order.
    pub checks: Vec<SlotCheck>,
}

impl VerificationReport {
    /// Returns `true` if every check passed.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// Returns the failed checks.
    pub fn failures(&self) -> impl Iterator<Item = &SlotCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// Audited administrative surface over a [`CredentialVerifier`].
pub struct RotationAdmin<S, L = TracingAuditLogger> {
    verifier: CredentialVerifier<S>,
    audit: L,
}

impl<S: StorageBackend> RotationAdmin<S, TracingAuditLogger> {
    /// Creates an admin that audits through `tracing`.
    pub fn new(verifier: CredentialVerifier<S>) -> Self {
        Self::with_audit_logger(verifier, TracingAuditLogger)
    }
}

impl<S: StorageBackend, L: AuditLogger> RotationAdmin<S, L> {
    /// Creates an admin with a custom audit sink.
    pub fn with_audit_logger(verifier: CredentialVerifier<S>, audit: L) -> Self {
        Self { verifier, audit }
    }

    /// Returns the wrapped verifier.
    pub fn verifier(&self) -> &CredentialVerifier<S> {
        &self.verifier
    }

    async fn record_failure(&self, actor: &str, action: AuditAction, err: &AuthError) {
        self.audit.log(&AuditEvent::new(actor, action).failed(err)).await;
    }

    /// Creates the slot if it does not exist.
    ///
    /// # Errors
    ///
    /// See [`CredentialVerifier::bootstrap`].
    pub async fn bootstrap(&self, actor: &str) -> Result<RotationStatus> {
        let result = async {
            let created = self.verifier.bootstrap().await?;
            Ok::<_, AuthError>((created, self.verifier.slot().await?))
        }
        .await;

        match result {
            Ok((created, slot)) => {
                if created {
                    let event =
                        AuditEvent::new(actor, AuditAction::Bootstrap).kid(slot.current.kid());
                    self.audit.log(&event).await;
                }
                Ok(RotationStatus::of(&slot, Utc::now()))
            },
            Err(e) => {
                self.record_failure(actor, AuditAction::Bootstrap, &e).await;
                Err(e)
            },
        }
    }

    /// Reports the slot state.
    ///
    /// # Errors
    ///
    /// See [`CredentialVerifier::slot`].
    pub async fn status(&self, actor: &str) -> Result<RotationStatus> {
        match self.verifier.slot().await {
            Ok(slot) => {
                let status = RotationStatus::of(&slot, Utc::now());
                let event = AuditEvent::new(actor, AuditAction::Status)
                    .kid(&status.current_kid)
                    .detail("state", status.state.to_string());
                self.audit.log(&event).await;
                Ok(status)
            },
            Err(e) => {
                self.record_failure(actor, AuditAction::Status, &e).await;
                Err(e)
            },
        }
    }

    /// Generates a new key and rotates to it.
    ///
    /// With `dry_run` the rotation is evaluated against the current slot but
    /// nothing is written.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RotationPending`] while a previous rotation is in
    /// its grace period, and any error of [`CredentialVerifier::rotate`].
    pub async fn execute(&self, actor: &str, dry_run: bool) -> Result<RotationReport> {
        let result = self.try_execute(dry_run).await;
        match &result {
            Ok(report) => {
                let outcome = if dry_run { AuditOutcome::DryRun } else { AuditOutcome::Success };
                let event = AuditEvent::new(actor, AuditAction::Rotate)
                    .kid(&report.new_kid)
                    .outcome(outcome)
                    .detail("retired_kid", &report.retired_kid)
                    .detail("previous_valid_until", report.previous_valid_until.to_rfc3339());
                self.audit.log(&event).await;
            },
            Err(e) => self.record_failure(actor, AuditAction::Rotate, e).await,
        }
        result
    }

    async fn try_execute(&self, dry_run: bool) -> Result<RotationReport> {
        let slot = self.verifier.slot().await?;
        let now = Utc::now();
        if let SlotState::Rotating { deadline } = slot.state(now) {
            return Err(AuthError::RotationPending { deadline });
        }

        let new_key = SigningKeyMaterial::generate();
        let new_kid = new_key.kid().to_owned();

        if dry_run {
            let grace = chrono::Duration::from_std(self.verifier.config().grace_period())
                .map_err(|_| AuthError::invariant_violation("grace period is out of range"))?;
            return Ok(RotationReport {
                dry_run: true,
                retired_kid: slot.current.kid().to_owned(),
                new_kid,
                previous_valid_until: now + grace,
            });
        }

        let rotated = self.verifier.rotate(new_key).await?;
        let retired = rotated.previous.as_ref().map(|k| k.kid().to_owned());
        match (retired, rotated.previous_valid_until) {
            (Some(retired_kid), Some(previous_valid_until)) => Ok(RotationReport {
                dry_run: false,
                retired_kid,
                new_kid,
                previous_valid_until,
            }),
            _ => Err(AuthError::invariant_violation("rotated slot has no previous key")),
        }
    }

    /// Checks the slot for consistency.
    ///
    /// Failed checks are reported, not returned as errors.
    ///
    /// # Errors
    ///
    /// Returns an error only if the slot cannot be read.
    pub async fn verify(&self, actor: &str) -> Result<VerificationReport> {
        let slot = match self.verifier.slot().await {
            Ok(slot) => slot,
            Err(e) => {
                self.record_failure(actor, AuditAction::Verify, &e).await;
                return Err(e);
            },
        };
        let status = RotationStatus::of(&slot, Utc::now());

        let mut checks = vec![SlotCheck::from_result("current_key", slot.current.validate())];
        if let Some(previous) = &slot.previous {
            checks.push(SlotCheck::from_result("previous_key", previous.validate()));
            checks.push(SlotCheck::from_result(
                "distinct_kids",
                if previous.kid() == slot.current.kid() {
                    Err(AuthError::invariant_violation("current and previous kid are equal"))
                } else {
                    Ok(())
                },
            ));
            checks.push(SlotCheck::from_result(
                "previous_deadline",
                slot.previous_valid_until.map(|_| ()).ok_or_else(|| {
                    AuthError::invariant_violation("previous key has no retention deadline")
                }),
            ));
        }
        checks.push(SlotCheck::from_result(
            "grace_exceeds_ttl",
            self.verifier
                .config()
                .validate()
                .map_err(|e| AuthError::invariant_violation(e.to_string())),
        ));

        let report = VerificationReport { status, checks };
        let outcome = if report.is_healthy() {
            AuditOutcome::Success
        } else {
            let failed: Vec<_> = report.failures().map(|c| c.name).collect();
            AuditOutcome::Failure(format!("failed checks: {}", failed.join(", ")))
        };
        let event =
            AuditEvent::new(actor, AuditAction::Verify).kid(&report.status.current_kid).outcome(outcome);
        self.audit.log(&event).await;
        Ok(report)
    }

    /// Removes the previous key if its deadline has passed.
    ///
    /// # Errors
    ///
    /// See [`CredentialVerifier::purge_expired_previous`].
    pub async fn purge(&self, actor: &str) -> Result<Option<String>> {
        match self.verifier.purge_expired_previous().await {
            Ok(Some(kid)) => {
                self.audit.log(&AuditEvent::new(actor, AuditAction::PurgePrevious).kid(&kid)).await;
                Ok(Some(kid))
            },
            Ok(None) => Ok(None),
            Err(e) => {
                self.record_failure(actor, AuditAction::PurgePrevious, &e).await;
                Err(e)
            },
        }
    }
}
