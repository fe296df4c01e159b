//! Redis-backed implementation of [`StorageBackend`](checkpoint_storage::StorageBackend) for
//! Checkpoint.
//!
//! This crate provides [`RedisBackend`], the distributed variant of the shared
//! store, and [`FailoverBackend`], which pairs it with an in-process store so
//! that a Redis outage degrades the service instead of stopping it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  FailoverBackend<P, F>                      │
//! │       (implements StorageBackend, owns CircuitBreaker)      │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │   RedisBackend (primary)     │   MemoryBackend (fallback)   │
//! │   GET/MGET/SET/PTTL/DEL      │   checkpoint-storage         │
//! │   Lua: CAS, windowed INCR    │                              │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! // Requires a running Redis server.
//! use checkpoint_storage::{MemoryBackend, StorageBackend};
//! use checkpoint_storage_redis::{
//!     CircuitBreakerConfig, FailoverBackend, RedisBackend, RedisBackendConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RedisBackendConfig::builder().url("redis://localhost:6379").build()?;
//!     let redis = RedisBackend::connect(config).await?;
//!
//!     let store =
//!         FailoverBackend::new(redis, MemoryBackend::new(), CircuitBreakerConfig::default());
//!     store.set(b"key".to_vec(), b"value".to_vec()).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Degraded Mode
//!
//! When Redis is unreachable, [`FailoverBackend`] answers from the in-process
//! store and logs a warning. Guarantees then hold only within one process.
//! A write whose Redis acknowledgement was lost is never replayed in-process;
//! it fails with a timeout so the caller can re-read.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
pub mod circuit_breaker;
mod config;
mod error;
mod failover;
mod scripts;

/// Redis-backed storage backend.
pub use backend::RedisBackend;
/// Circuit breaker types for routing around an unreachable primary.
pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_PROBE_SUCCESSES, DEFAULT_RECOVERY_TIMEOUT,
};
/// Configuration type and default constants for the Redis backend.
pub use config::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_KEY_PREFIX, DEFAULT_OPERATION_TIMEOUT, RedisBackendConfig,
};
/// Redis-specific error types and result alias.
pub use error::{RedisStorageError, Result};
/// Degraded-mode routing backend.
pub use failover::{FailoverBackend, FailoverMetrics};
