//! The shared store, selected once at startup.
//!
//! [`SharedStore`] wraps every backend the service can run on. Components
//! are generic over [`StorageBackend`], so request-handling code never looks
//! at which variant is in use.
//!
//! | Variant | Scope of guarantees |
//! |---------|---------------------|
//! | [`SharedStore::Distributed`] | All processes sharing the Redis instance; degrades to process-local while Redis is unreachable |
//! | [`SharedStore::InProcess`] | This process only |

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use checkpoint_storage::{Counter, MemoryBackend, StorageBackend, StorageResult};
use checkpoint_storage_redis::{FailoverBackend, FailoverMetrics, RedisBackend};

use crate::config::StoreConfig;

/// Runtime-selected store backend.
#[derive(Debug, Clone)]
pub enum SharedStore {
    /// Redis with an in-process fallback.
    Distributed(FailoverBackend<RedisBackend, MemoryBackend>),
    /// In-process store only.
    InProcess(MemoryBackend),
}

impl SharedStore {
    /// Builds the store described by `config`.
    ///
    /// Falls back to the in-process variant, with a warning, when Redis is
    /// not configured or the initial connection fails. Never fails itself.
    pub async fn connect(config: &StoreConfig) -> Self {
        let Some(redis) = config.redis.clone() else {
            tracing::warn!(
                "no distributed store configured; rate limits and token redemption are \
                 enforced per process",
            );
            return Self::in_process();
        };

        match RedisBackend::connect(redis).await {
            Ok(primary) => Self::Distributed(FailoverBackend::new(
                primary,
                MemoryBackend::new(),
                config.circuit_breaker.clone(),
            )),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "distributed store unreachable at startup; using the in-process store",
                );
                Self::in_process()
            },
        }
    }

    /// Creates an in-process store.
    #[must_use]
    pub fn in_process() -> Self {
        Self::InProcess(MemoryBackend::new())
    }

    /// Returns `true` if this is the distributed variant.
    #[must_use]
    pub fn is_distributed(&self) -> bool {
        matches!(self, Self::Distributed(_))
    }

    /// Returns `true` while calls are being served without cross-process
    /// guarantees.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        match self {
            Self::Distributed(b) => b.is_degraded(),
            Self::InProcess(_) => true,
        }
    }

    /// Returns failover counters for the distributed variant.
    #[must_use]
    pub fn failover_metrics(&self) -> Option<FailoverMetrics> {
        match self {
            Self::Distributed(b) => Some(b.metrics()),
            Self::InProcess(_) => None,
        }
    }
}

#[async_trait]
impl StorageBackend for SharedStore {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        match self {
            Self::Distributed(b) => b.get(key).await,
            Self::InProcess(b) => b.get(key).await,
        }
    }

    async fn get_many(&self, keys: &[Vec<u8>]) -> StorageResult<Vec<Option<Bytes>>> {
        match self {
            Self::Distributed(b) => b.get_many(keys).await,
            Self::InProcess(b) => b.get_many(keys).await,
        }
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        match self {
            Self::Distributed(b) => b.set(key, value).await,
            Self::InProcess(b) => b.set(key, value).await,
        }
    }

    async fn set_with_ttl(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()> {
        match self {
            Self::Distributed(b) => b.set_with_ttl(key, value, ttl).await,
            Self::InProcess(b) => b.set_with_ttl(key, value, ttl).await,
        }
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        match self {
            Self::Distributed(b) => b.compare_and_set(key, expected, new_value).await,
            Self::InProcess(b) => b.compare_and_set(key, expected, new_value).await,
        }
    }

    async fn compare_and_set_with_ttl(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()> {
        match self {
            Self::Distributed(b) => b.compare_and_set_with_ttl(key, expected, new_value, ttl).await,
            Self::InProcess(b) => b.compare_and_set_with_ttl(key, expected, new_value, ttl).await,
        }
    }

    async fn increment(&self, key: &[u8], ttl: Duration) -> StorageResult<Counter> {
        match self {
            Self::Distributed(b) => b.increment(key, ttl).await,
            Self::InProcess(b) => b.increment(key, ttl).await,
        }
    }

    async fn ttl(&self, key: &[u8]) -> StorageResult<Option<Duration>> {
        match self {
            Self::Distributed(b) => b.ttl(key).await,
            Self::InProcess(b) => b.ttl(key).await,
        }
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        match self {
            Self::Distributed(b) => b.delete(key).await,
            Self::InProcess(b) => b.delete(key).await,
        }
    }

    async fn health_check(&self) -> StorageResult<()> {
        match self {
            Self::Distributed(b) => b.health_check().await,
            Self::InProcess(b) => b.health_check().await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use checkpoint_storage_redis::RedisBackendConfig;

    use super::*;

    #[tokio::test]
    async fn test_unconfigured_store_is_in_process() {
        let store = SharedStore::connect(&StoreConfig::default()).await;
        assert!(!store.is_distributed());
        assert!(store.is_degraded());
        assert!(store.failover_metrics().is_none());

        store.set(b"k".to_vec(), b"v".to_vec()).await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap().unwrap().as_ref(), b"v");
    }

    #[tokio::test]
    async fn test_unreachable_redis_falls_back_at_startup() {
        let redis = RedisBackendConfig::builder()
            .url("redis://127.0.0.1:1")
            .connect_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let config = StoreConfig { redis: Some(redis), ..StoreConfig::default() };

        let store = SharedStore::connect(&config).await;
        assert!(!store.is_distributed());
        store.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_atomic_primitives_pass_through() {
        let store = SharedStore::in_process();

        store.compare_and_set(b"slot", None, b"a".to_vec()).await.unwrap();
        assert!(store.compare_and_set(b"slot", None, b"b".to_vec()).await.is_err());

        let first = store.increment(b"hits", Duration::from_secs(60)).await.unwrap();
        let second = store.increment(b"hits", Duration::from_secs(60)).await.unwrap();
        assert!(first.is_first());
        assert_eq!(second.value, 2);
    }
}
