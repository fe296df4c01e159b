//! Token fetch surface: the static access key check and scan links.

use chrono::{DateTime, Utc};
use serde::Serialize;
use subtle::ConstantTimeEq;

use crate::{config::TokenConfig, token::Token};

/// Compares two strings in time independent of where they differ.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let len = a.len().max(b.len());
    let mut left = vec![0u8; len];
    let mut right = vec![0xFFu8; len];
    left[..a.len()].copy_from_slice(a.as_bytes());
    right[..b.len()].copy_from_slice(b.as_bytes());

    (a.len().ct_eq(&b.len()) & left.ct_eq(&right)).into()
}

/// Gate for unauthenticated token fetches.
///
/// Without a configured key every caller is admitted.
#[derive(Clone, Default)]
pub struct AccessKeyGuard {
    key: Option<String>,
}

impl std::fmt::Debug for AccessKeyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessKeyGuard").field("enabled", &self.key.is_some()).finish()
    }
}

impl AccessKeyGuard {
    /// Creates a guard requiring `key`, or an open guard for `None`.
    #[must_use]
    pub fn new(key: Option<String>) -> Self {
        Self { key }
    }

    /// Creates the guard configured in `config`.
    #[must_use]
    pub fn from_config(config: &TokenConfig) -> Self {
        Self::new(config.access_key().map(str::to_owned))
    }

    /// Returns `true` if a key is required.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Returns `true` if `presented` grants access.
    #[must_use]
    pub fn admits(&self, presented: Option<&str>) -> bool {
        match (&self.key, presented) {
            (None, _) => true,
            (Some(expected), Some(presented)) => constant_time_eq(expected, presented),
            (Some(_), None) => false,
        }
    }
}

/// The current token as handed to a display terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenLink {
    /// Token id.
    pub id: String,
    /// Link a scanner opens.
    pub url: String,
    /// Issue time.
    pub created_at: DateTime<Utc>,
}

impl TokenLink {
    /// Renders the link for `token` from the configured template.
    #[must_use]
    pub fn render(token: &Token, config: &TokenConfig) -> Self {
        let url = config
            .link_template()
            .replace("{bot}", config.bot_username())
            .replace("{token}", &token.id);
        Self { id: token.id.clone(), url, created_at: token.created_at }
    }
}
