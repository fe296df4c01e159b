//! Redis-backed storage backend implementation.
//!
//! This module provides [`RedisBackend`], which implements the
//! [`StorageBackend`](checkpoint_storage::StorageBackend) trait on top of a
//! multiplexed Redis connection.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use checkpoint_storage::{Counter, StorageBackend, StorageError, StorageResult};
use redis::{RedisResult, aio::ConnectionManager};

use crate::{
    config::RedisBackendConfig,
    error::{RedisStorageError, Result},
    scripts,
};

/// Redis refuses `PX 0`, so sub-millisecond TTLs are rounded up.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Redis-backed implementation of [`StorageBackend`].
///
/// # Atomicity
///
/// Single-key reads and writes map to one Redis command each.
/// Compare-and-set and windowed increments run as Lua scripts, and
/// [`get_many`](StorageBackend::get_many) is one `MGET`, so every primitive
/// is atomic on the server.
///
/// # Timeouts
///
/// Each operation is bounded by the configured operation timeout. A timed-out
/// mutation may still have been applied; callers see
/// [`StorageError::Timeout`] and must re-read if they need the outcome.
///
/// # Thread Safety
///
/// `RedisBackend` is cheap to clone. All clones share one multiplexed
/// connection that reconnects on its own after a drop.
///
/// # Example
///
/// ```no_run
/// // Requires a running Redis server.
/// use checkpoint_storage::StorageBackend;
/// use checkpoint_storage_redis::{RedisBackend, RedisBackendConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = RedisBackendConfig::builder().url("redis://localhost:6379").build()?;
///     let backend = RedisBackend::connect(config).await?;
///
///     backend.compare_and_set(b"slot", None, b"v1".to_vec()).await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    key_prefix: Vec<u8>,
    operation_timeout: Duration,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("key_prefix", &String::from_utf8_lossy(&self.key_prefix))
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be parsed, or if no connection is
    /// established within the connect timeout.
    pub async fn connect(config: RedisBackendConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let connection =
            tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
                .await
                .map_err(|_| RedisStorageError::ConnectTimeout)??;

        tracing::info!(
            key_prefix = %config.key_prefix,
            operation_timeout_ms = config.operation_timeout.as_millis() as u64,
            "connected to Redis",
        );

        Ok(Self {
            connection,
            key_prefix: config.key_prefix.into_bytes(),
            operation_timeout: config.operation_timeout,
        })
    }

    fn prefixed(&self, key: &[u8]) -> Vec<u8> {
        let mut full = Vec::with_capacity(self.key_prefix.len() + key.len());
        full.extend_from_slice(&self.key_prefix);
        full.extend_from_slice(key);
        full
    }

    /// Runs one round trip on a clone of the shared connection, bounded by
    /// the operation timeout.
    async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> StorageResult<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.operation_timeout, f(self.connection.clone())).await {
            Ok(result) => result.map_err(|e| StorageError::from(RedisStorageError::from(e))),
            Err(_) => {
                tracing::warn!(
                    op,
                    timeout_ms = self.operation_timeout.as_millis() as u64,
                    "Redis operation exceeded its timeout",
                );
                Err(StorageError::timeout())
            },
        }
    }

    async fn cas(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl_ms: u64,
    ) -> StorageResult<()> {
        let key = self.prefixed(key);
        let (flag, expected) = match expected {
            Some(value) => ("1", value.to_vec()),
            None => ("0", Vec::new()),
        };

        let applied: i64 = self
            .run("compare_and_set", |mut conn| async move {
                let mut invocation = scripts::COMPARE_AND_SET.key(key);
                invocation.arg(flag).arg(expected).arg(new_value).arg(ttl_ms);
                let reply: RedisResult<i64> = invocation.invoke_async(&mut conn).await;
                reply
            })
            .await?;

        match applied {
            1 => Ok(()),
            0 => Err(StorageError::Conflict),
            other => Err(RedisStorageError::UnexpectedReply(other.to_string()).into()),
        }
    }
}

#[async_trait]
impl StorageBackend for RedisBackend {
    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        let key = self.prefixed(key);
        let value: Option<Vec<u8>> = self
            .run("get", |mut conn| async move {
                let reply: RedisResult<Option<Vec<u8>>> =
                    redis::cmd("GET").arg(key).query_async(&mut conn).await;
                reply
            })
            .await?;
        Ok(value.map(Bytes::from))
    }

    #[tracing::instrument(skip(self, keys), fields(keys = keys.len()))]
    async fn get_many(&self, keys: &[Vec<u8>]) -> StorageResult<Vec<Option<Bytes>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(self.prefixed(key));
        }

        let values: Vec<Option<Vec<u8>>> = self
            .run("get_many", |mut conn| async move {
                let reply: RedisResult<Vec<Option<Vec<u8>>>> = cmd.query_async(&mut conn).await;
                reply
            })
            .await?;

        if values.len() != keys.len() {
            return Err(RedisStorageError::UnexpectedReply(format!(
                "MGET returned {} values for {} keys",
                values.len(),
                keys.len()
            ))
            .into());
        }
        Ok(values.into_iter().map(|v| v.map(Bytes::from)).collect())
    }

    #[tracing::instrument(skip(self, key, value), fields(key_len = key.len(), value_len = value.len()))]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        let key = self.prefixed(&key);
        self.run("set", |mut conn| async move {
            let reply: RedisResult<()> =
                redis::cmd("SET").arg(key).arg(value).query_async(&mut conn).await;
            reply
        })
        .await
    }

    #[tracing::instrument(skip(self, key, value), fields(key_len = key.len(), ttl_ms = ttl.as_millis() as u64))]
    async fn set_with_ttl(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()> {
        let key = self.prefixed(&key);
        let ttl_ms = ttl_millis(ttl);
        self.run("set_with_ttl", |mut conn| async move {
            let reply: RedisResult<()> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await;
            reply
        })
        .await
    }

    #[tracing::instrument(skip(self, key, expected, new_value), fields(key_len = key.len(), insert = expected.is_none()))]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        self.cas(key, expected, new_value, 0).await
    }

    #[tracing::instrument(skip(self, key, expected, new_value), fields(key_len = key.len(), insert = expected.is_none()))]
    async fn compare_and_set_with_ttl(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()> {
        self.cas(key, expected, new_value, ttl_millis(ttl)).await
    }

    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn increment(&self, key: &[u8], ttl: Duration) -> StorageResult<Counter> {
        let key = self.prefixed(key);
        // A zero window must expire at once, so it is not rounded up here.
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);

        let reply: Vec<i64> = self
            .run("increment", |mut conn| async move {
                let reply: RedisResult<Vec<i64>> =
                    scripts::INCREMENT.key(key).arg(ttl_ms).invoke_async(&mut conn).await;
                reply
            })
            .await?;

        match reply.as_slice() {
            [value, remaining] if *value > 0 => Ok(Counter::new(
                u64::try_from(*value).unwrap_or_default(),
                Duration::from_millis(u64::try_from(*remaining).unwrap_or_default()),
            )),
            other => Err(RedisStorageError::UnexpectedReply(format!("{other:?}")).into()),
        }
    }

    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn ttl(&self, key: &[u8]) -> StorageResult<Option<Duration>> {
        let key = self.prefixed(key);
        let remaining: i64 = self
            .run("ttl", |mut conn| async move {
                let reply: RedisResult<i64> =
                    redis::cmd("PTTL").arg(key).query_async(&mut conn).await;
                reply
            })
            .await?;

        // -2: no such key, -1: no expiry
        Ok(u64::try_from(remaining).ok().map(Duration::from_millis))
    }

    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        let key = self.prefixed(key);
        self.run("delete", |mut conn| async move {
            let reply: RedisResult<()> = redis::cmd("DEL").arg(key).query_async(&mut conn).await;
            reply
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<()> {
        let pong: String = self
            .run("health_check", |mut conn| async move {
                let reply: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
                reply
            })
            .await?;

        if pong == "PONG" {
            Ok(())
        } else {
            Err(RedisStorageError::UnexpectedReply(pong).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_rounds_up_to_one() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_micros(200)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }
}
