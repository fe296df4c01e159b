//! Service configuration.
//!
//! Every section deserializes from TOML with humantime durations and rejects
//! unknown fields. Sections built in code go through validating `bon`
//! builders; deserialized sections are checked with `validate()`.
//!
//! ```toml
//! [store.redis]
//! url = "redis://localhost:6379/0"
//!
//! [tokens]
//! bot_username = "checkpoint_bot"
//! ttl = "24h"
//!
//! [rate_limit.check_in]
//! limit = 10
//! window = "1m"
//!
//! [credentials]
//! credential_ttl = "30m"
//! grace_period = "2h"
//! ```

use std::time::Duration;

use checkpoint_authn::CredentialConfig;
use checkpoint_storage::ConfigError;
use checkpoint_storage_redis::{CircuitBreakerConfig, RedisBackendConfig};
use serde::{Deserialize, Serialize};

use crate::rate_limit::RouteClass;

/// Default lifetime of an access token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default time a token record outlives its expiry.
pub const DEFAULT_RECORD_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Default template for token links.
pub const DEFAULT_LINK_TEMPLATE: &str = "https://t.me/{bot}?start={token}";

/// Default bot username substituted into `{bot}`.
pub const DEFAULT_BOT_USERNAME: &str = "checkpoint_bot";

/// Default compare-and-set budget for ledger writes.
pub const DEFAULT_MAX_CAS_ATTEMPTS: u32 = 8;

fn default_token_ttl() -> Duration {
    DEFAULT_TOKEN_TTL
}

fn default_record_retention() -> Duration {
    DEFAULT_RECORD_RETENTION
}

fn default_link_template() -> String {
    DEFAULT_LINK_TEMPLATE.to_owned()
}

fn default_bot_username() -> String {
    DEFAULT_BOT_USERNAME.to_owned()
}

fn default_true() -> bool {
    true
}

fn default_max_cas_attempts() -> u32 {
    DEFAULT_MAX_CAS_ATTEMPTS
}

fn zero(field: &'static str) -> ConfigError {
    ConfigError::MustBePositive { field, value: "0s".into() }
}

/// Shared store selection.
///
/// Without a `redis` section the in-process store is used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Distributed backend, if any.
    #[serde(default)]
    pub redis: Option<RedisBackendConfig>,
    /// Breaker guarding the distributed backend.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl StoreConfig {
    /// Checks every nested section.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(redis) = &self.redis {
            redis.validate()?;
        }
        self.circuit_breaker.validate()
    }
}

/// Access token settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenConfig {
    #[serde(with = "humantime_serde", default = "default_token_ttl")]
    ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_record_retention")]
    record_retention: Duration,
    #[serde(default = "default_link_template")]
    link_template: String,
    #[serde(default = "default_bot_username")]
    bot_username: String,
    #[serde(default)]
    access_key: Option<String>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TOKEN_TTL,
            record_retention: DEFAULT_RECORD_RETENTION,
            link_template: default_link_template(),
            bot_username: default_bot_username(),
            access_key: None,
        }
    }
}

#[bon::bon]
impl TokenConfig {
    /// Creates a validated token configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the TTL is zero or the link template has
    /// no `{token}` placeholder.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_TOKEN_TTL)] ttl: Duration,
        #[builder(default = DEFAULT_RECORD_RETENTION)] record_retention: Duration,
        #[builder(into, default = default_link_template())] link_template: String,
        #[builder(into, default = default_bot_username())] bot_username: String,
        #[builder(into)] access_key: Option<String>,
    ) -> Result<Self, ConfigError> {
        let config = Self { ttl, record_retention, link_template, bot_username, access_key };
        config.validate()?;
        Ok(config)
    }

    /// Checks a configuration that was deserialized rather than built.
    ///
    /// # Errors
    ///
    /// See [`TokenConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl.is_zero() {
            return Err(zero("tokens.ttl"));
        }
        if !self.link_template.contains("{token}") {
            return Err(ConfigError::Invalid {
                field: "tokens.link_template",
                reason: "must contain a {token} placeholder".into(),
            });
        }
        if self.access_key.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::Invalid {
                field: "tokens.access_key",
                reason: "must not be empty; omit it to disable the check".into(),
            });
        }
        Ok(())
    }

    /// Returns the token lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns how long a record is kept after its token expires.
    #[must_use]
    pub fn record_retention(&self) -> Duration {
        self.record_retention
    }

    /// Returns the link template.
    #[must_use]
    pub fn link_template(&self) -> &str {
        &self.link_template
    }

    /// Returns the bot username.
    #[must_use]
    pub fn bot_username(&self) -> &str {
        &self.bot_username
    }

    /// Returns the static access key, if one is configured.
    #[must_use]
    pub fn access_key(&self) -> Option<&str> {
        self.access_key.as_deref()
    }
}

/// Limit applied to one route class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutePolicy {
    /// Requests allowed per window.
    pub limit: u64,
    /// Window length.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Penalty applied after a breach, if any.
    #[serde(with = "humantime_serde", default)]
    pub block_for: Option<Duration>,
}

impl RoutePolicy {
    /// Creates a policy without a block penalty.
    #[must_use]
    pub const fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window, block_for: None }
    }

    /// Returns the policy with a block penalty.
    #[must_use]
    pub const fn blocking_for(mut self, block_for: Duration) -> Self {
        self.block_for = Some(block_for);
        self
    }

    /// Returns the built-in policy for `route`.
    #[must_use]
    pub const fn default_for(route: RouteClass) -> Self {
        const BLOCK: Duration = Duration::from_secs(300);
        match route {
            RouteClass::Api => Self::new(100, Duration::from_secs(60)).blocking_for(BLOCK),
            RouteClass::TokenCreation => {
                Self::new(5, Duration::from_secs(300)).blocking_for(BLOCK)
            },
            RouteClass::UserManagement => {
                Self::new(20, Duration::from_secs(60)).blocking_for(BLOCK)
            },
            RouteClass::CheckIn => Self::new(10, Duration::from_secs(60)),
        }
    }

    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        if self.limit == 0 {
            return Err(ConfigError::BelowMinimum {
                field,
                min: "1".into(),
                value: self.limit.to_string(),
            });
        }
        if self.window.is_zero() {
            return Err(zero(field));
        }
        if self.block_for.is_some_and(|b| b.is_zero()) {
            return Err(zero(field));
        }
        Ok(())
    }
}

fn default_api() -> RoutePolicy {
    RoutePolicy::default_for(RouteClass::Api)
}

fn default_token_creation() -> RoutePolicy {
    RoutePolicy::default_for(RouteClass::TokenCreation)
}

fn default_user_management() -> RoutePolicy {
    RoutePolicy::default_for(RouteClass::UserManagement)
}

fn default_check_in() -> RoutePolicy {
    RoutePolicy::default_for(RouteClass::CheckIn)
}

/// Rate limiter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Let requests through when the store fails.
    #[serde(default = "default_true")]
    pub fail_open: bool,
    /// General API traffic.
    #[serde(default = "default_api")]
    pub api: RoutePolicy,
    /// Token issuance.
    #[serde(default = "default_token_creation")]
    pub token_creation: RoutePolicy,
    /// User administration.
    #[serde(default = "default_user_management")]
    pub user_management: RoutePolicy,
    /// Check-in submissions.
    #[serde(default = "default_check_in")]
    pub check_in: RoutePolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            fail_open: true,
            api: default_api(),
            token_creation: default_token_creation(),
            user_management: default_user_management(),
            check_in: default_check_in(),
        }
    }
}

impl RateLimitConfig {
    /// Returns the policy for `route`.
    #[must_use]
    pub fn policy(&self, route: RouteClass) -> RoutePolicy {
        match route {
            RouteClass::Api => self.api,
            RouteClass::TokenCreation => self.token_creation,
            RouteClass::UserManagement => self.user_management,
            RouteClass::CheckIn => self.check_in,
        }
    }

    /// Returns the configuration with `route` set to `policy`.
    #[must_use]
    pub fn with_policy(mut self, route: RouteClass, policy: RoutePolicy) -> Self {
        match route {
            RouteClass::Api => self.api = policy,
            RouteClass::TokenCreation => self.token_creation = policy,
            RouteClass::UserManagement => self.user_management = policy,
            RouteClass::CheckIn => self.check_in = policy,
        }
        self
    }

    /// Checks every route policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a zero limit, window or block duration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.api.validate("rate_limit.api")?;
        self.token_creation.validate("rate_limit.token_creation")?;
        self.user_management.validate("rate_limit.user_management")?;
        self.check_in.validate("rate_limit.check_in")
    }
}

/// Event ledger settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    /// Compare-and-set attempts before giving up under contention.
    #[serde(default = "default_max_cas_attempts")]
    pub max_cas_attempts: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { max_cas_attempts: DEFAULT_MAX_CAS_ATTEMPTS }
    }
}

impl LedgerConfig {
    /// Checks the attempt budget.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if `max_cas_attempts` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cas_attempts == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "ledger.max_cas_attempts",
                min: "1".into(),
                value: "0".into(),
            });
        }
        Ok(())
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Shared store.
    #[serde(default)]
    pub store: StoreConfig,
    /// Access tokens.
    #[serde(default)]
    pub tokens: TokenConfig,
    /// Rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Session credentials.
    #[serde(default)]
    pub credentials: CredentialConfig,
    /// Event ledger.
    #[serde(default)]
    pub ledger: LedgerConfig,
}

impl CheckpointConfig {
    /// Checks every section.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()?;
        self.tokens.validate()?;
        self.rate_limit.validate()?;
        self.credentials.validate()?;
        self.ledger.validate()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_defaults_validate() {
        CheckpointConfig::default().validate().unwrap();
    }

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config: CheckpointConfig = toml::from_str("").unwrap();
        assert_eq!(config, CheckpointConfig::default());
        assert!(config.store.redis.is_none());
        assert!(config.rate_limit.fail_open);
    }

    #[test]
    fn test_full_toml() {
        let config: CheckpointConfig = toml::from_str(
            r#"
            [store.redis]
            url = "redis://cache:6379/1"
            operation_timeout = "250ms"

            [store.circuit_breaker]
            failure_threshold = 5

            [tokens]
            ttl = "12h"
            bot_username = "office_bot"
            access_key = "s3cret"

            [rate_limit]
            fail_open = false

            [rate_limit.check_in]
            limit = 3
            window = "30s"
            block_for = "2m"

            [credentials]
            credential_ttl = "10m"
            grace_period = "1h"

            [ledger]
            max_cas_attempts = 4
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.tokens.ttl(), Duration::from_secs(12 * 3600));
        assert_eq!(config.tokens.access_key(), Some("s3cret"));
        assert!(!config.rate_limit.fail_open);
        assert_eq!(
            config.rate_limit.policy(RouteClass::CheckIn),
            RoutePolicy::new(3, Duration::from_secs(30)).blocking_for(Duration::from_secs(120))
        );
        assert_eq!(config.rate_limit.policy(RouteClass::Api).limit, 100);
        assert_eq!(config.ledger.max_cas_attempts, 4);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<CheckpointConfig, _> = toml::from_str("[tokens]\nlifetime = \"1h\"");
        assert!(result.is_err());
    }

    #[rstest]
    #[case::api(RouteClass::Api, 100, 60)]
    #[case::token_creation(RouteClass::TokenCreation, 5, 300)]
    #[case::user_management(RouteClass::UserManagement, 20, 60)]
    #[case::check_in(RouteClass::CheckIn, 10, 60)]
    fn test_default_route_policies(
        #[case] route: RouteClass,
        #[case] limit: u64,
        #[case] window_secs: u64,
    ) {
        let policy = RateLimitConfig::default().policy(route);
        assert_eq!(policy.limit, limit);
        assert_eq!(policy.window, Duration::from_secs(window_secs));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let config = RateLimitConfig::default()
            .with_policy(RouteClass::Api, RoutePolicy::new(0, Duration::from_secs(60)));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BelowMinimum { field: "rate_limit.api", .. })
        ));
    }

    #[test]
    fn test_link_template_needs_token_placeholder() {
        let err = TokenConfig::builder().link_template("https://t.me/x").build().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "tokens.link_template", .. }));
    }

    #[test]
    fn test_empty_access_key_rejected() {
        let err = TokenConfig::builder().access_key(String::new()).build().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "tokens.access_key", .. }));
    }

    #[test]
    fn test_zero_cas_budget_rejected() {
        assert!(LedgerConfig { max_cas_attempts: 0 }.validate().is_err());
    }
}
