//! Degraded-mode routing between a distributed and an in-process store.
//!
//! [`FailoverBackend`] sends every call to the primary while it is healthy.
//! Every transient primary failure is counted by the [`CircuitBreaker`]. Once
//! the breaker opens, calls skip the primary entirely until a probe succeeds.
//!
//! Reads that fail transiently are served by the fallback. A mutation moves
//! to the fallback only when the primary never received it (a
//! [`Connection`](checkpoint_storage::StorageError::Connection) error) or the
//! circuit is open. After a
//! [`Timeout`](checkpoint_storage::StorageError::Timeout) the mutation may
//! have landed on the primary, so it is not replayed: the timeout is returned
//! and the caller re-reads to learn the outcome.
//!
//! While degraded, state in the fallback is local to this process: tokens,
//! events and counters written there are invisible to other instances and
//! are not copied back when the primary recovers.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use checkpoint_storage::{Counter, StorageBackend, StorageResult};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics};

/// Counters describing failover activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverMetrics {
    /// Calls answered by the primary.
    pub primary_calls: u64,
    /// Calls answered by the fallback.
    pub fallback_calls: u64,
    /// Breaker snapshot.
    pub circuit: CircuitBreakerMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

#[derive(Debug, Default)]
struct Counters {
    primary_calls: AtomicU64,
    fallback_calls: AtomicU64,
    degraded: AtomicBool,
}

/// A [`StorageBackend`] that prefers `P` and degrades to `F`.
///
/// # Example
///
/// ```
/// use checkpoint_storage::{MemoryBackend, StorageBackend};
/// use checkpoint_storage_redis::{CircuitBreakerConfig, FailoverBackend};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// // Any backend can be the primary; production uses `RedisBackend`.
/// let store = FailoverBackend::new(
///     MemoryBackend::new(),
///     MemoryBackend::new(),
///     CircuitBreakerConfig::default(),
/// );
/// store.set(b"k".to_vec(), b"v".to_vec()).await.unwrap();
/// assert!(!store.is_degraded());
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct FailoverBackend<P, F> {
    primary: P,
    fallback: F,
    breaker: CircuitBreaker,
    counters: Arc<Counters>,
}

impl<P, F> FailoverBackend<P, F>
where
    P: StorageBackend,
    F: StorageBackend,
{
    /// Creates a failover backend with a closed circuit.
    #[must_use]
    pub fn new(primary: P, fallback: F, breaker: CircuitBreakerConfig) -> Self {
        Self {
            primary,
            fallback,
            breaker: CircuitBreaker::new(breaker),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Returns the primary backend.
    #[must_use]
    pub fn primary(&self) -> &P {
        &self.primary
    }

    /// Returns the fallback backend.
    #[must_use]
    pub fn fallback(&self) -> &F {
        &self.fallback
    }

    /// Returns `true` while the last routed call was served by the fallback.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.counters.degraded.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of routing counters.
    #[must_use]
    pub fn metrics(&self) -> FailoverMetrics {
        FailoverMetrics {
            primary_calls: self.counters.primary_calls.load(Ordering::Relaxed),
            fallback_calls: self.counters.fallback_calls.load(Ordering::Relaxed),
            circuit: self.breaker.metrics(),
        }
    }

    fn mark_degraded(&self, op: &'static str, reason: &dyn std::fmt::Display) {
        if !self.counters.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                op,
                reason = %reason,
                "shared store unavailable, serving from in-process store; \
                 state is no longer shared across instances",
            );
        }
    }

    fn mark_recovered(&self) {
        if self.counters.degraded.swap(false, Ordering::Relaxed) {
            tracing::info!("shared store reachable again, leaving degraded mode");
        }
    }

    /// Routes one call: primary when the breaker allows it, fallback on an
    /// open circuit or a transient primary failure the call may be replayed
    /// after.
    async fn route<'a, T, PF, FF>(
        &'a self,
        op: &'static str,
        access: Access,
        on_primary: impl FnOnce(&'a P) -> PF,
        on_fallback: impl FnOnce(&'a F) -> FF,
    ) -> StorageResult<T>
    where
        PF: Future<Output = StorageResult<T>>,
        FF: Future<Output = StorageResult<T>>,
    {
        if self.breaker.admit().uses_primary() {
            match on_primary(&self.primary).await {
                Err(err) if err.is_transient() => {
                    self.breaker.on_outage();
                    if access == Access::Write && err.outcome_unknown() {
                        tracing::warn!(op, error = %err, "shared store write unacknowledged");
                        return Err(err);
                    }
                    self.mark_degraded(op, &err);
                },
                result => {
                    self.breaker.on_answer();
                    self.mark_recovered();
                    self.counters.primary_calls.fetch_add(1, Ordering::Relaxed);
                    return result;
                },
            }
        } else {
            self.mark_degraded(op, &"circuit open");
        }

        self.counters.fallback_calls.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(op, "served by in-process store");
        on_fallback(&self.fallback).await
    }
}

#[async_trait]
impl<P, F> StorageBackend for FailoverBackend<P, F>
where
    P: StorageBackend,
    F: StorageBackend,
{
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        self.route("get", Access::Read, |p| p.get(key), |f| f.get(key)).await
    }

    async fn get_many(&self, keys: &[Vec<u8>]) -> StorageResult<Vec<Option<Bytes>>> {
        self.route("get_many", Access::Read, |p| p.get_many(keys), |f| f.get_many(keys)).await
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        let (k, v) = (key.clone(), value.clone());
        self.route("set", Access::Write, |p| p.set(key, value), |f| f.set(k, v)).await
    }

    async fn set_with_ttl(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()> {
        let (k, v) = (key.clone(), value.clone());
        self.route(
            "set_with_ttl",
            Access::Write,
            |p| p.set_with_ttl(key, value, ttl),
            |f| f.set_with_ttl(k, v, ttl),
        )
        .await
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        let v = new_value.clone();
        self.route(
            "compare_and_set",
            Access::Write,
            |p| p.compare_and_set(key, expected, new_value),
            |f| f.compare_and_set(key, expected, v),
        )
        .await
    }

    async fn compare_and_set_with_ttl(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()> {
        let v = new_value.clone();
        self.route(
            "compare_and_set_with_ttl",
            Access::Write,
            |p| p.compare_and_set_with_ttl(key, expected, new_value, ttl),
            |f| f.compare_and_set_with_ttl(key, expected, v, ttl),
        )
        .await
    }

    async fn increment(&self, key: &[u8], ttl: Duration) -> StorageResult<Counter> {
        self.route("increment", Access::Write, |p| p.increment(key, ttl), |f| f.increment(key, ttl)).await
    }

    async fn ttl(&self, key: &[u8]) -> StorageResult<Option<Duration>> {
        self.route("ttl", Access::Read, |p| p.ttl(key), |f| f.ttl(key)).await
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.route("delete", Access::Write, |p| p.delete(key), |f| f.delete(key)).await
    }

    /// Reports the health of the primary without routing.
    ///
    /// The combined store can always serve requests, but operators need to
    /// know whether it is doing so in degraded mode.
    async fn health_check(&self) -> StorageResult<()> {
        self.primary.health_check().await
    }
}
