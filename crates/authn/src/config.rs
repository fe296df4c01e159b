//! Credential lifetime configuration.

use std::time::Duration;

use checkpoint_storage::ConfigError;
use serde::{Deserialize, Serialize};

/// Default lifetime of a session credential.
pub const DEFAULT_CREDENTIAL_TTL: Duration = Duration::from_secs(30 * 60);

/// Default time a retired signing key keeps verifying after rotation.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2 * 60 * 60);

fn default_credential_ttl() -> Duration {
    DEFAULT_CREDENTIAL_TTL
}

fn default_grace_period() -> Duration {
    DEFAULT_GRACE_PERIOD
}

/// Lifetimes governing credentials and key rotation.
///
/// The grace period must be longer than the credential TTL, otherwise a
/// credential signed just before a rotation could outlive the key that
/// verifies it.
///
/// ```toml
/// [credentials]
/// credential_ttl = "30m"
/// grace_period = "2h"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialConfig {
    #[serde(with = "humantime_serde", default = "default_credential_ttl")]
    credential_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_grace_period")]
    grace_period: Duration,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self { credential_ttl: DEFAULT_CREDENTIAL_TTL, grace_period: DEFAULT_GRACE_PERIOD }
    }
}

#[bon::bon]
impl CredentialConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if either duration is zero or the grace period
    /// does not exceed the credential TTL.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_CREDENTIAL_TTL)] credential_ttl: Duration,
        #[builder(default = DEFAULT_GRACE_PERIOD)] grace_period: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { credential_ttl, grace_period };
        config.validate()?;
        Ok(config)
    }

    /// Checks a configuration that was deserialized rather than built.
    ///
    /// # Errors
    ///
    /// See [`CredentialConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.credential_ttl.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "credential_ttl",
                value: "0s".into(),
            });
        }
        if self.grace_period <= self.credential_ttl {
            return Err(ConfigError::Invalid {
                field: "grace_period",
                reason: format!(
                    "must exceed credential_ttl ({}s), got {}s",
                    self.credential_ttl.as_secs_f64(),
                    self.grace_period.as_secs_f64()
                ),
            });
        }
        Ok(())
    }

    /// Returns the default credential lifetime.
    #[must_use]
    pub fn credential_ttl(&self) -> Duration {
        self.credential_ttl
    }

    /// Returns how long a retired key keeps verifying.
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }
}
