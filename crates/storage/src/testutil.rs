//! Shared test utilities for storage backend testing.
//!
//! Feature-gated behind `testutil` so none of it leaks into production
//! builds.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! checkpoint-storage = { path = "../storage", features = ["testutil"] }
//! ```
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use checkpoint_storage::testutil::{FaultMode, FlakyBackend, make_key};
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    StorageBackend,
    error::{StorageError, StorageResult},
    memory::MemoryBackend,
    types::Counter,
};

/// Create a deterministic test key from a prefix and index.
///
/// Produces keys like `"prefix:000042"`.
#[must_use]
pub fn make_key(prefix: &str, idx: usize) -> Vec<u8> {
    format!("{prefix}:{idx:06}").into_bytes()
}

/// Create a test value tagged with a task ID and sequence number.
///
/// Produces values like `"task3-val42"`, useful for telling concurrent
/// writers apart.
#[must_use]
pub fn make_tagged_value(task: usize, seq: usize) -> Vec<u8> {
    format!("task{task}-val{seq}").into_bytes()
}

/// Failure behaviour of a [`FlakyBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FaultMode {
    /// Every call is forwarded to the inner backend.
    Healthy = 0,
    /// Every call fails with [`StorageError::Connection`] without touching
    /// the inner backend.
    Unreachable = 1,
    /// Mutations are applied to the inner backend, then reported as
    /// [`StorageError::Timeout`]. Reads are served normally.
    LoseAcks = 2,
}

impl FaultMode {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Unreachable,
            2 => Self::LoseAcks,
            _ => Self::Healthy,
        }
    }
}

/// A [`MemoryBackend`] wrapper whose failure behaviour can be switched at
/// runtime.
///
/// Stands in for a distributed backend that goes away or drops
/// acknowledgements.
#[derive(Clone, Debug)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    mode: Arc<AtomicU8>,
    calls: Arc<AtomicUsize>,
    rival: Arc<Mutex<Option<(Vec<u8>, Vec<u8>)>>>,
}

impl FlakyBackend {
    /// Creates a healthy flaky backend over a fresh [`MemoryBackend`].
    #[must_use]
    pub fn new() -> Self {
        Self::wrap(MemoryBackend::new())
    }

    /// Wraps an existing backend so tests can inspect it directly.
    #[must_use]
    pub fn wrap(inner: MemoryBackend) -> Self {
        Self {
            inner,
            mode: Arc::new(AtomicU8::new(FaultMode::Healthy as u8)),
            calls: Arc::new(AtomicUsize::new(0)),
            rival: Arc::new(Mutex::new(None)),
        }
    }

    /// Switches the failure behaviour for all clones.
    pub fn set_mode(&self, mode: FaultMode) {
        self.mode.store(mode as u8, Ordering::SeqCst);
    }

    /// Returns the current failure behaviour.
    #[must_use]
    pub fn mode(&self) -> FaultMode {
        FaultMode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    /// Returns the number of calls that reached this backend.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Makes the next compare-and-set on `key` lose to a competing writer.
    ///
    /// That call stores `value` instead of its own new value and reports
    /// [`StorageError::Timeout`], as if its request was lost and another
    /// client's write landed before the caller could re-read.
    pub fn lose_next_race(&self, key: &[u8], value: Vec<u8>) {
        *self.rival.lock() = Some((key.to_vec(), value));
    }

    fn take_rival(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut rival = self.rival.lock();
        match rival.as_ref() {
            Some((k, _)) if k == key => rival.take().map(|(_, value)| value),
            _ => None,
        }
    }

    /// Returns the wrapped backend.
    #[must_use]
    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    fn enter(&self) -> StorageResult<FaultMode> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode() {
            FaultMode::Unreachable => Err(StorageError::connection("injected: backend unreachable")),
            mode => Ok(mode),
        }
    }

    fn ack<T>(mode: FaultMode, result: StorageResult<T>) -> StorageResult<T> {
        match (mode, result) {
            (FaultMode::LoseAcks, Ok(_)) => Err(StorageError::timeout()),
            (_, result) => result,
        }
    }
}

impl Default for FlakyBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        self.enter()?;
        self.inner.get(key).await
    }

    async fn get_many(&self, keys: &[Vec<u8>]) -> StorageResult<Vec<Option<Bytes>>> {
        self.enter()?;
        self.inner.get_many(keys).await
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        let mode = self.enter()?;
        Self::ack(mode, self.inner.set(key, value).await)
    }

    async fn set_with_ttl(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()> {
        let mode = self.enter()?;
        Self::ack(mode, self.inner.set_with_ttl(key, value, ttl).await)
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        let mode = self.enter()?;
        if let Some(value) = self.take_rival(key) {
            self.inner.set(key.to_vec(), value).await?;
            return Err(StorageError::timeout());
        }
        Self::ack(mode, self.inner.compare_and_set(key, expected, new_value).await)
    }

    async fn compare_and_set_with_ttl(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()> {
        let mode = self.enter()?;
        if let Some(value) = self.take_rival(key) {
            self.inner.set_with_ttl(key.to_vec(), value, ttl).await?;
            return Err(StorageError::timeout());
        }
        Self::ack(mode, self.inner.compare_and_set_with_ttl(key, expected, new_value, ttl).await)
    }

    async fn increment(&self, key: &[u8], ttl: Duration) -> StorageResult<Counter> {
        let mode = self.enter()?;
        Self::ack(mode, self.inner.increment(key, ttl).await)
    }

    async fn ttl(&self, key: &[u8]) -> StorageResult<Option<Duration>> {
        self.enter()?;
        self.inner.ttl(key).await
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        let mode = self.enter()?;
        Self::ack(mode, self.inner.delete(key).await)
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.enter()?;
        self.inner.health_check().await
    }
}

/// Assert that a [`StorageResult`] is a [`StorageError::Conflict`].
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use checkpoint_storage::{assert_conflict, StorageError, StorageResult};
///
/// let result: StorageResult<()> = Err(StorageError::Conflict);
/// assert_conflict!(result);
/// ```
#[macro_export]
macro_rules! assert_conflict {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Conflict)),
            "expected StorageError::Conflict, got: {:?}",
            $result,
        );
    };
    ($result:expr, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Conflict)),
            "{}: expected StorageError::Conflict, got: {:?}",
            $msg,
            $result,
        );
    };
}

/// Assert that a [`StorageResult`] is a transient error (`Connection` or
/// `Timeout`).
#[macro_export]
macro_rules! assert_transient {
    ($result:expr) => {
        assert!(
            matches!(&$result, Err(e) if e.is_transient()),
            "expected a transient StorageError, got: {:?}",
            $result,
        );
    };
}

/// Assert that a [`StorageResult`] is `Ok` and return the inner value.
#[macro_export]
macro_rules! assert_storage_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got StorageError: {e:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("{}: expected Ok, got StorageError: {e:?}", $msg),
        }
    };
}
