//! Storage backend trait definition.
//!
//! This module defines the [`StorageBackend`] trait, the single capability
//! interface through which every Checkpoint component touches shared state.
//!
//! # Design Philosophy
//!
//! - **Keys and values are bytes**: No assumptions about serialization format
//! - **Atomic primitives only**: Coordination is expressed as compare-and-set and atomic increment,
//!   never as locks held by the caller
//! - **TTL-aware**: Every read treats an expired key as absent
//! - **Variant-agnostic**: The distributed and in-process backends are interchangeable
//!
//! Domain logic (tokens, events, rate windows, signing keys) lives in the
//! components built on top of this trait, not in the backends.
//!
//! # Implementing a Backend
//!
//! 1. Implement [`StorageBackend`]
//! 2. Make [`compare_and_set`](StorageBackend::compare_and_set) and
//!    [`increment`](StorageBackend::increment) atomic with respect to every other operation on the
//!    same key
//! 3. Map backend-specific errors to [`StorageError`](crate::StorageError), using `Connection` or
//!    `Timeout` only when the backend itself is unhealthy
//!
//! See [`MemoryBackend`](crate::MemoryBackend) for a reference implementation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::StorageResult, types::Counter};

/// Abstract atomic key/value store.
///
/// Backends are `Send + Sync` and support concurrent operations. Operations
/// on the same key are linearizable; operations on different keys carry no
/// ordering guarantee.
///
/// # Key Operations
///
/// | Method | Description |
/// |--------|-------------|
/// | [`get`](StorageBackend::get) | Retrieve a single value by key |
/// | [`get_many`](StorageBackend::get_many) | Point-in-time read of several keys |
/// | [`set`](StorageBackend::set) | Store a key-value pair without expiry |
/// | [`set_with_ttl`](StorageBackend::set_with_ttl) | Store with automatic expiration |
/// | [`compare_and_set`](StorageBackend::compare_and_set) | Atomic compare-and-swap |
/// | [`compare_and_set_with_ttl`](StorageBackend::compare_and_set_with_ttl) | Compare-and-swap that also resets the TTL |
/// | [`increment`](StorageBackend::increment) | Atomic windowed counter |
/// | [`ttl`](StorageBackend::ttl) | Remaining lifetime of a key |
/// | [`delete`](StorageBackend::delete) | Remove a key |
/// | [`health_check`](StorageBackend::health_check) | Verify backend availability |
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use checkpoint_storage::{MemoryBackend, StorageBackend};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let backend = MemoryBackend::new();
///
/// backend.set(b"key".to_vec(), b"value".to_vec()).await.unwrap();
/// let value = backend.get(b"key").await.unwrap();
/// assert_eq!(value, Some(Bytes::from("value")));
/// # });
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a value by key.
    ///
    /// Returns `Ok(None)` if the key does not exist or has expired.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Retrieves several keys as one point-in-time snapshot.
    ///
    /// The returned vector has one entry per requested key, in request order.
    /// No write that lands between the first and last key may be partially
    /// observed: either every key reflects it or none does.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get_many(&self, keys: &[Vec<u8>]) -> StorageResult<Vec<Option<Bytes>>>;

    /// Stores a key-value pair, overwriting any existing value and clearing
    /// any TTL.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()>;

    /// Stores a key-value pair that expires after `ttl`.
    ///
    /// After expiry the key reads as absent. Physical removal may happen
    /// later.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration)
    -> StorageResult<()>;

    /// Atomically sets a key's value if it matches the expected current value.
    ///
    /// # Semantics
    ///
    /// - **`expected: None`**: insert-if-absent. Succeeds only when the key does not exist (or has
    ///   expired).
    /// - **`expected: Some(value)`**: update-if-unchanged. Succeeds only when the current value is
    ///   a byte-for-byte match of `value`.
    ///
    /// On success the key's remaining TTL is preserved; a key created by an
    /// insert-if-absent has no TTL.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`](crate::StorageError::Conflict) when the
    /// precondition does not hold. A transient error leaves the outcome
    /// unknown; re-read to find out.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()>;

    /// Like [`compare_and_set`](StorageBackend::compare_and_set), but replaces
    /// the key's TTL with `ttl` on success.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn compare_and_set_with_ttl(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()>;

    /// Atomically increments a counter and returns the post-increment value.
    ///
    /// When the key is absent or expired the counter restarts at `1` and
    /// expires after `ttl`; otherwise the existing TTL is kept. The returned
    /// [`Counter`] is the value this call produced, never a value read
    /// separately.
    ///
    /// # Errors
    ///
    /// Returns a `Serialization` error if the key holds a non-counter value.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn increment(&self, key: &[u8], ttl: Duration) -> StorageResult<Counter>;

    /// Returns the remaining TTL of a live key.
    ///
    /// `Ok(None)` means the key is absent, expired, or has no expiry.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn ttl(&self, key: &[u8]) -> StorageResult<Option<Duration>>;

    /// Deletes a key. Deleting a missing key is not an error.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Verifies the backend can serve requests.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn health_check(&self) -> StorageResult<()>;
}

#[async_trait]
impl<B: StorageBackend + ?Sized> StorageBackend for std::sync::Arc<B> {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        (**self).get(key).await
    }

    async fn get_many(&self, keys: &[Vec<u8>]) -> StorageResult<Vec<Option<Bytes>>> {
        (**self).get_many(keys).await
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        (**self).set(key, value).await
    }

    async fn set_with_ttl(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()> {
        (**self).set_with_ttl(key, value, ttl).await
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        (**self).compare_and_set(key, expected, new_value).await
    }

    async fn compare_and_set_with_ttl(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()> {
        (**self).compare_and_set_with_ttl(key, expected, new_value, ttl).await
    }

    async fn increment(&self, key: &[u8], ttl: Duration) -> StorageResult<Counter> {
        (**self).increment(key, ttl).await
    }

    async fn ttl(&self, key: &[u8]) -> StorageResult<Option<Duration>> {
        (**self).ttl(key).await
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        (**self).delete(key).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        (**self).health_check().await
    }
}
