//! In-memory storage backend implementation.
//!
//! This module provides [`MemoryBackend`], the in-process variant of
//! [`StorageBackend`]. It backs tests and development setups, and it is the
//! degraded-mode fallback when the distributed backend is unreachable.
//!
//! # Features
//!
//! - **Thread-safe**: A single [`parking_lot::RwLock`] guards values and expiries together, so
//!   every compare-and-set and increment is atomic
//! - **TTL support**: Expired keys read as absent immediately; a background task removes them
//! - **Snapshot reads**: [`get_many`](StorageBackend::get_many) reads all keys under one lock
//!
//! # Example
//!
//! ```
//! use checkpoint_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MemoryBackend::new();
//!
//!     backend.set(b"greeting".to_vec(), b"hello".to_vec()).await.unwrap();
//!     let value = backend.get(b"greeting").await.unwrap();
//!
//!     assert_eq!(value.unwrap().as_ref(), b"hello");
//! }
//! ```
//!
//! # Limitations
//!
//! - Data is not persisted and is lost when the process exits
//! - Guarantees hold within one process only; two processes each running a `MemoryBackend` do not
//!   see each other's writes

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::{select, sync::watch, time::sleep};

use crate::{
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    types::Counter,
};

/// How often the background task sweeps expired keys.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Holds the shutdown signal sender. When dropped, the watch channel
/// closes and the cleanup task exits.
struct ShutdownGuard {
    shutdown_tx: watch::Sender<()>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        // Best-effort signal; the receiver may already be gone.
        let _ = self.shutdown_tx.send(());
    }
}

/// A stored value and its optional expiry.
#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

/// In-memory storage backend.
///
/// # Cloning
///
/// `MemoryBackend` is cheaply cloneable via [`Arc`]. All clones share the
/// same underlying data.
///
/// # Shutdown
///
/// The background TTL cleanup task stops automatically when all clones are
/// dropped. [`shutdown`](Self::shutdown) stops it explicitly.
#[derive(Clone)]
pub struct MemoryBackend {
    entries: Arc<RwLock<BTreeMap<Vec<u8>, Entry>>>,
    shutdown_guard: Arc<ShutdownGuard>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend").field("keys", &self.entries.read().len()).finish()
    }
}

impl MemoryBackend {
    /// Creates a new in-memory backend and spawns its TTL cleanup task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let backend = Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_guard: Arc::new(ShutdownGuard { shutdown_tx }),
        };

        // The task holds only a weak handle so that dropping every clone
        // releases the map and the guard.
        let entries = Arc::downgrade(&backend.entries);
        tokio::spawn(async move {
            cleanup_expired_keys(entries, shutdown_rx).await;
        });

        backend
    }

    /// Explicitly signals the background TTL cleanup task to stop.
    ///
    /// Data operations keep working; expired keys still read as absent but
    /// are no longer physically removed.
    pub fn shutdown(&self) {
        let _ = self.shutdown_guard.shutdown_tx.send(());
    }

    /// Returns the number of physically stored keys, including expired ones
    /// not yet swept.
    #[must_use]
    pub fn stored_len(&self) -> usize {
        self.entries.read().len()
    }

    fn write_cas(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        fail::fail_point!("memory-cas-unreachable", |_| {
            Err(StorageError::connection("injected outage before compare-and-set"))
        });
        let now = Instant::now();
        let mut entries = self.entries.write();

        let current = entries.get(key).filter(|e| e.is_live(now));
        let matches = match (expected, current) {
            (None, None) => true,
            (Some(exp), Some(cur)) => exp == &cur.value[..],
            _ => false,
        };
        if !matches {
            return Err(StorageError::Conflict);
        }

        let expires_at = match ttl {
            Some(ttl) => Some(now + ttl),
            None => current.and_then(|e| e.expires_at),
        };
        entries.insert(key.to_vec(), Entry { value: Bytes::from(new_value), expires_at });
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Background sweep removing expired keys.
///
/// Exits when the shutdown signal fires or the backend has been dropped.
async fn cleanup_expired_keys(
    entries: std::sync::Weak<RwLock<BTreeMap<Vec<u8>, Entry>>>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        select! {
            _ = sleep(CLEANUP_INTERVAL) => {}
            _ = shutdown_rx.changed() => {
                return;
            }
        }

        let Some(entries) = entries.upgrade() else {
            return;
        };

        let now = Instant::now();
        let mut guard = entries.write();
        let before = guard.len();
        guard.retain(|_, entry| entry.is_live(now));
        let removed = before - guard.len();
        if removed > 0 {
            tracing::trace!(removed, "swept expired keys");
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        let now = Instant::now();
        let entries = self.entries.read();
        Ok(entries.get(key).filter(|e| e.is_live(now)).map(|e| e.value.clone()))
    }

    #[tracing::instrument(skip(self, keys), fields(count = keys.len()))]
    async fn get_many(&self, keys: &[Vec<u8>]) -> StorageResult<Vec<Option<Bytes>>> {
        let now = Instant::now();
        let entries = self.entries.read();
        Ok(keys
            .iter()
            .map(|key| entries.get(key).filter(|e| e.is_live(now)).map(|e| e.value.clone()))
            .collect())
    }

    #[tracing::instrument(skip(self, key, value), fields(key_len = key.len()))]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.entries.write().insert(key, Entry { value: Bytes::from(value), expires_at: None });
        Ok(())
    }

    #[tracing::instrument(skip(self, key, value), fields(key_len = key.len()))]
    async fn set_with_ttl(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()> {
        let expires_at = Some(Instant::now() + ttl);
        self.entries.write().insert(key, Entry { value: Bytes::from(value), expires_at });
        Ok(())
    }

    #[tracing::instrument(skip(self, key, expected, new_value), fields(key_len = key.len()))]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        self.write_cas(key, expected, new_value, None)
    }

    #[tracing::instrument(skip(self, key, expected, new_value), fields(key_len = key.len()))]
    async fn compare_and_set_with_ttl(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()> {
        self.write_cas(key, expected, new_value, Some(ttl))
    }

    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn increment(&self, key: &[u8], ttl: Duration) -> StorageResult<Counter> {
        fail::fail_point!("memory-increment-unreachable", |_| {
            Err(StorageError::connection("injected outage before increment"))
        });
        let now = Instant::now();
        let mut entries = self.entries.write();

        let (value, expires_at) = match entries.get(key).filter(|e| e.is_live(now)) {
            Some(entry) => {
                let current = std::str::from_utf8(&entry.value)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(|| StorageError::serialization("value is not a counter"))?;
                (current.saturating_add(1), entry.expires_at)
            },
            None => (1, Some(now + ttl)),
        };

        entries.insert(
            key.to_vec(),
            Entry { value: Bytes::from(value.to_string().into_bytes()), expires_at },
        );

        let expires_in = expires_at.map_or(ttl, |at| at.saturating_duration_since(now));
        Ok(Counter::new(value, expires_in))
    }

    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn ttl(&self, key: &[u8]) -> StorageResult<Option<Duration>> {
        let now = Instant::now();
        let entries = self.entries.read();
        Ok(entries.get(key).filter(|e| e.is_live(now)).and_then(|e| e.remaining(now)))
    }

    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<()> {
        fail::fail_point!("memory-health-check", |_| {
            Err(StorageError::internal("injected health check failure"))
        });
        // Acquiring the read lock proves the map is not wedged.
        let _unused = self.entries.read();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::insert_into_empty(None, None, true)]
    #[case::insert_over_existing(Some(&b"v1"[..]), None, false)]
    #[case::swap_matching(Some(&b"v1"[..]), Some(&b"v1"[..]), true)]
    #[case::swap_stale(Some(&b"v2"[..]), Some(&b"v1"[..]), false)]
    #[case::swap_missing(None, Some(&b"v1"[..]), false)]
    #[tokio::test]
    async fn test_compare_and_set_preconditions(
        #[case] current: Option<&'static [u8]>,
        #[case] expected: Option<&'static [u8]>,
        #[case] applies: bool,
    ) {
        let backend = MemoryBackend::new();
        if let Some(current) = current {
            backend.set(b"k".to_vec(), current.to_vec()).await.unwrap();
        }

        let result = backend.compare_and_set(b"k", expected, b"new".to_vec()).await;
        assert_eq!(result.is_ok(), applies, "{result:?}");
        if !applies {
            assert!(matches!(result, Err(StorageError::Conflict)));
            assert_eq!(backend.get(b"k").await.unwrap().as_deref(), current);
        }
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let backend = MemoryBackend::new();

        backend.set(b"key1".to_vec(), b"value1".to_vec()).await.unwrap();
        let value = backend.get(b"key1").await.unwrap();
        assert_eq!(value, Some(Bytes::from("value1")));

        backend.delete(b"key1").await.unwrap();
        let value = backend.get(b"key1").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_ttl_expiry_reads_absent() {
        let backend = MemoryBackend::new();

        backend
            .set_with_ttl(b"temp".to_vec(), b"value".to_vec(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(backend.get(b"temp").await.unwrap().is_some());

        sleep(Duration::from_millis(150)).await;

        assert_eq!(backend.get(b"temp").await.unwrap(), None);
        assert_eq!(backend.ttl(b"temp").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_clears_ttl() {
        let backend = MemoryBackend::new();

        backend
            .set_with_ttl(b"key".to_vec(), b"v1".to_vec(), Duration::from_millis(100))
            .await
            .unwrap();
        backend.set(b"key".to_vec(), b"v2".to_vec()).await.unwrap();

        sleep(Duration::from_millis(150)).await;
        assert_eq!(backend.get(b"key").await.unwrap(), Some(Bytes::from("v2")));
    }

    #[tokio::test]
    async fn test_clone_shares_data() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();

        backend.set(b"shared".to_vec(), b"yes".to_vec()).await.unwrap();
        assert_eq!(clone.get(b"shared").await.unwrap(), Some(Bytes::from("yes")));
    }

    #[tokio::test]
    async fn test_compare_and_set_success() {
        let backend = MemoryBackend::new();
        backend.set(b"k".to_vec(), b"old".to_vec()).await.unwrap();

        backend.compare_and_set(b"k", Some(b"old"), b"new".to_vec()).await.unwrap();
        assert_eq!(backend.get(b"k").await.unwrap(), Some(Bytes::from("new")));
    }

    #[tokio::test]
    async fn test_compare_and_set_conflict() {
        let backend = MemoryBackend::new();
        backend.set(b"k".to_vec(), b"actual".to_vec()).await.unwrap();

        let result = backend.compare_and_set(b"k", Some(b"stale"), b"new".to_vec()).await;
        assert!(matches!(result, Err(StorageError::Conflict)));
        assert_eq!(backend.get(b"k").await.unwrap(), Some(Bytes::from("actual")));
    }

    #[tokio::test]
    async fn test_compare_and_set_insert_if_absent() {
        let backend = MemoryBackend::new();

        backend.compare_and_set(b"k", None, b"first".to_vec()).await.unwrap();
        let second = backend.compare_and_set(b"k", None, b"second".to_vec()).await;
        assert!(matches!(second, Err(StorageError::Conflict)));
    }

    #[tokio::test]
    async fn test_compare_and_set_treats_expired_as_absent() {
        let backend = MemoryBackend::new();
        backend
            .set_with_ttl(b"k".to_vec(), b"stale".to_vec(), Duration::from_millis(50))
            .await
            .unwrap();
        sleep(Duration::from_millis(80)).await;

        let with_old = backend.compare_and_set(b"k", Some(b"stale"), b"x".to_vec()).await;
        assert!(matches!(with_old, Err(StorageError::Conflict)));
        backend.compare_and_set(b"k", None, b"fresh".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn test_compare_and_set_preserves_ttl() {
        let backend = MemoryBackend::new();
        backend
            .set_with_ttl(b"k".to_vec(), b"a".to_vec(), Duration::from_millis(100))
            .await
            .unwrap();

        backend.compare_and_set(b"k", Some(b"a"), b"b".to_vec()).await.unwrap();
        assert!(backend.ttl(b"k").await.unwrap().is_some());

        sleep(Duration::from_millis(150)).await;
        assert_eq!(backend.get(b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_compare_and_set_with_ttl_replaces_ttl() {
        let backend = MemoryBackend::new();
        backend.set(b"k".to_vec(), b"a".to_vec()).await.unwrap();
        assert_eq!(backend.ttl(b"k").await.unwrap(), None);

        backend
            .compare_and_set_with_ttl(b"k", Some(b"a"), b"b".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        let ttl = backend.ttl(b"k").await.unwrap().expect("ttl should be set");
        assert!(ttl <= Duration::from_secs(60));
        assert!(ttl > Duration::from_secs(59));
    }

    #[tokio::test]
    async fn test_increment_opens_and_extends_window() {
        let backend = MemoryBackend::new();
        let window = Duration::from_secs(60);

        let first = backend.increment(b"hits", window).await.unwrap();
        assert_eq!(first.value, 1);
        assert!(first.is_first());
        assert_eq!(first.expires_in, window);

        let second = backend.increment(b"hits", window).await.unwrap();
        assert_eq!(second.value, 2);
        assert!(second.expires_in <= window);
    }

    #[tokio::test]
    async fn test_increment_restarts_after_expiry() {
        let backend = MemoryBackend::new();
        let window = Duration::from_millis(80);

        backend.increment(b"hits", window).await.unwrap();
        backend.increment(b"hits", window).await.unwrap();
        sleep(Duration::from_millis(120)).await;

        let restarted = backend.increment(b"hits", window).await.unwrap();
        assert_eq!(restarted.value, 1);
    }

    #[tokio::test]
    async fn test_increment_rejects_non_counter() {
        let backend = MemoryBackend::new();
        backend.set(b"k".to_vec(), b"not-a-number".to_vec()).await.unwrap();

        let result = backend.increment(b"k", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(StorageError::Serialization { .. })));
    }

    #[tokio::test]
    async fn test_get_many_preserves_order_and_gaps() {
        let backend = MemoryBackend::new();
        backend.set(b"a".to_vec(), b"1".to_vec()).await.unwrap();
        backend.set(b"c".to_vec(), b"3".to_vec()).await.unwrap();

        let values =
            backend.get_many(&[b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]).await.unwrap();
        assert_eq!(values, vec![Some(Bytes::from("3")), None, Some(Bytes::from("1"))]);
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_expired_keys() {
        let backend = MemoryBackend::new();
        backend
            .set_with_ttl(b"gone".to_vec(), b"v".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();
        backend.set(b"kept".to_vec(), b"v".to_vec()).await.unwrap();

        sleep(CLEANUP_INTERVAL + Duration::from_millis(300)).await;
        assert_eq!(backend.stored_len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_cleanup_task() {
        let backend = MemoryBackend::new();
        backend
            .set_with_ttl(b"ttl_key".to_vec(), b"value".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();

        backend.shutdown();
        sleep(CLEANUP_INTERVAL + Duration::from_millis(300)).await;

        // Expired but never swept.
        assert_eq!(backend.stored_len(), 1);
        assert_eq!(backend.get(b"ttl_key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.shutdown();
        backend.shutdown();

        backend.set(b"key".to_vec(), b"value".to_vec()).await.unwrap();
        assert_eq!(backend.get(b"key").await.unwrap(), Some(Bytes::from("value")));
    }

    #[tokio::test]
    async fn test_health_check() {
        let backend = MemoryBackend::new();
        assert!(backend.health_check().await.is_ok());
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            /// N increments inside one window always yield exactly 1..=N.
            #[test]
            fn increments_are_dense_and_monotonic(n in 1usize..64) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("runtime");

                rt.block_on(async {
                    let backend = MemoryBackend::new();
                    let window = Duration::from_secs(60);
                    for expected in 1..=n as u64 {
                        let counter = backend.increment(b"counter", window).await.unwrap();
                        prop_assert_eq!(counter.value, expected);
                    }
                    Ok(())
                })?;
            }

            /// Insert-if-absent over any sequence of values keeps the first one.
            #[test]
            fn insert_if_absent_keeps_first_value(
                values in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..16), 1..10),
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("runtime");

                rt.block_on(async {
                    let backend = MemoryBackend::new();
                    for value in &values {
                        let _ = backend.compare_and_set(b"k", None, value.clone()).await;
                    }
                    let stored = backend.get(b"k").await.unwrap().unwrap();
                    prop_assert_eq!(stored.to_vec(), values[0].clone());
                    Ok(())
                })?;
            }
        }
    }
}
