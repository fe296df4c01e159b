//! Configuration for the Redis storage backend.

use std::time::Duration;

use checkpoint_storage::ConfigError;
use serde::{Deserialize, Serialize};

/// Default connection timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-operation timeout.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

/// Default prefix prepended to every key.
pub const DEFAULT_KEY_PREFIX: &str = "checkpoint:";

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_operation_timeout() -> Duration {
    DEFAULT_OPERATION_TIMEOUT
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_owned()
}

/// Configuration for [`RedisBackend`](crate::RedisBackend).
///
/// # Key Prefix
///
/// Every key is stored as `key_prefix ++ key`, so several deployments can
/// share one Redis database without colliding.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use checkpoint_storage_redis::RedisBackendConfig;
///
/// let config = RedisBackendConfig::builder()
///     .url("redis://localhost:6379/0")
///     .operation_timeout(Duration::from_millis(500))
///     .build()?;
/// assert_eq!(config.key_prefix(), "checkpoint:");
/// # Ok::<(), checkpoint_storage::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisBackendConfig {
    /// Connection URL, e.g. `redis://host:6379/0`.
    pub(crate) url: String,

    /// Time allowed for the initial connection.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub(crate) connect_timeout: Duration,

    /// Time allowed for each individual operation.
    #[serde(with = "humantime_serde", default = "default_operation_timeout")]
    pub(crate) operation_timeout: Duration,

    /// Prefix prepended to every key.
    #[serde(default = "default_key_prefix")]
    pub(crate) key_prefix: String,
}

#[bon::bon]
impl RedisBackendConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the URL is empty or does not use the
    /// `redis://`, `rediss://` or `unix://` scheme, or if a timeout is zero.
    #[builder]
    pub fn new(
        #[builder(into)] url: String,
        #[builder(default = DEFAULT_CONNECT_TIMEOUT)] connect_timeout: Duration,
        #[builder(default = DEFAULT_OPERATION_TIMEOUT)] operation_timeout: Duration,
        #[builder(into, default = DEFAULT_KEY_PREFIX.to_owned())] key_prefix: String,
    ) -> Result<Self, ConfigError> {
        let config = Self { url, connect_timeout, operation_timeout, key_prefix };
        config.validate()?;
        Ok(config)
    }

    /// Checks a configuration that was deserialized rather than built.
    ///
    /// # Errors
    ///
    /// See [`RedisBackendConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Invalid { field: "url", reason: "must not be empty".into() });
        }
        if !["redis://", "rediss://", "unix://"].iter().any(|s| self.url.starts_with(s)) {
            return Err(ConfigError::Invalid {
                field: "url",
                reason: "expected a redis://, rediss:// or unix:// URL".into(),
            });
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "connect_timeout",
                value: "0s".into(),
            });
        }
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "operation_timeout",
                value: "0s".into(),
            });
        }
        Ok(())
    }

    /// Returns the connection URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the connection timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the per-operation timeout.
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Returns the key prefix.
    #[must_use]
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_valid_config_uses_defaults() {
        let config = RedisBackendConfig::builder().url("redis://localhost:6379").build().unwrap();

        assert_eq!(config.url(), "redis://localhost:6379");
        assert_eq!(config.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.operation_timeout(), DEFAULT_OPERATION_TIMEOUT);
        assert_eq!(config.key_prefix(), DEFAULT_KEY_PREFIX);
    }

    #[rstest]
    #[case::empty("")]
    #[case::blank("   ")]
    #[case::http("http://localhost:6379")]
    fn test_invalid_url_rejected(#[case] url: &str) {
        let err = RedisBackendConfig::builder().url(url).build().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "url", .. }));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = RedisBackendConfig::builder()
            .url("redis://localhost")
            .operation_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MustBePositive { field: "operation_timeout", .. }));
    }

    #[test]
    fn test_deserialize_from_toml() {
        let config: RedisBackendConfig = toml::from_str(
            r#"
            url = "rediss://cache.internal:6380/2"
            operation_timeout = "750ms"
            key_prefix = "staging:"
            "#,
        )
        .unwrap();

        assert_eq!(config.operation_timeout(), Duration::from_millis(750));
        assert_eq!(config.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.key_prefix(), "staging:");
        config.validate().unwrap();
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        let result: Result<RedisBackendConfig, _> =
            toml::from_str("url = \"redis://x\"\npool_size = 4");
        assert!(result.is_err());
    }

    #[test]
    fn test_serde_json_roundtrip() {
        let config = RedisBackendConfig::builder().url("redis://localhost").build().unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: RedisBackendConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
