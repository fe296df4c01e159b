//! The signing key slot.
//!
//! One record in the shared store holds the current key, the previous key
//! (during a rotation) and the previous key's retention deadline:
//!
//! ```text
//! Stable(current) ──rotate──→ Rotating(current = new, previous = old, deadline)
//!        ↑                                      │
//!        └──────────── deadline passes ─────────┘
//! ```
//!
//! The previous key is only ever used to verify, and only while
//! `now < previous_valid_until`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keys::SigningKeyMaterial;

/// Store key of the signing key slot.
pub const SIGNING_SLOT_KEY: &[u8] = b"credentials:signing-slot";

/// Rotation state derived from a slot at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotState {
    /// Only the current key verifies.
    Stable,
    /// The previous key still verifies until `deadline`.
    Rotating {
        /// When the previous key stops verifying.
        deadline: DateTime<Utc>,
    },
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Rotating { deadline } => write!(f, "rotating until {}", deadline.to_rfc3339()),
        }
    }
}

/// Persisted signing key slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SigningKeySlot {
    /// Key used for signing and first in line for verification.
    pub current: SigningKeyMaterial,
    /// Key retired by the last rotation, if not yet purged.
    #[serde(default)]
    pub previous: Option<SigningKeyMaterial>,
    /// When the last rotation happened.
    #[serde(default)]
    pub rotated_at: Option<DateTime<Utc>>,
    /// When `previous` stops verifying.
    #[serde(default)]
    pub previous_valid_until: Option<DateTime<Utc>>,
}

impl SigningKeySlot {
    /// Creates a stable slot around a single key.
    #[must_use]
    pub fn new(current: SigningKeyMaterial) -> Self {
        Self { current, previous: None, rotated_at: None, previous_valid_until: None }
    }

    /// Returns the state at `now`.
    #[must_use]
    pub fn state(&self, now: DateTime<Utc>) -> SlotState {
        match (&self.previous, self.previous_valid_until) {
            (Some(_), Some(deadline)) if now < deadline => SlotState::Rotating { deadline },
            _ => SlotState::Stable,
        }
    }

    /// Returns the previous key if it may still verify at `now`.
    #[must_use]
    pub fn usable_previous(&self, now: DateTime<Utc>) -> Option<&SigningKeyMaterial> {
        match self.state(now) {
            SlotState::Rotating { .. } => self.previous.as_ref(),
            SlotState::Stable => None,
        }
    }

    /// Returns `true` if a previous key is stored past its deadline.
    #[must_use]
    pub fn has_stale_previous(&self, now: DateTime<Utc>) -> bool {
        self.previous.is_some() && self.usable_previous(now).is_none()
    }

    /// Returns the slot after rotating to `next` at `now`.
    #[must_use]
    pub fn rotated(
        &self,
        next: SigningKeyMaterial,
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> Self {
        Self {
            current: next,
            previous: Some(self.current.clone()),
            rotated_at: Some(now),
            previous_valid_until: Some(now + grace),
        }
    }

    /// Returns the slot with the previous key removed.
    #[must_use]
    pub fn purged(&self) -> Self {
        Self {
            current: self.current.clone(),
            previous: None,
            rotated_at: self.rotated_at,
            previous_valid_until: None,
        }
    }
}
