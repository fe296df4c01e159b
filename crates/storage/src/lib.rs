//! Shared atomic key/value store for Checkpoint services.
//!
//! This crate provides the [`StorageBackend`] trait and related types. Every
//! piece of cross-request state in Checkpoint (access tokens, the attendance
//! ledger, rate-limit windows, the signing key slot) lives behind this trait,
//! and every coordination step is one of its atomic primitives.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Service Layer                            │
//! │           (bot dispatch, web handlers, admin CLI)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   Component Layer                           │
//! │  TokenAuthority │ EventLedger │ RateLimiter │ Credentials   │
//! ├─────────────────────────────────────────────────────────────┤
//! │                 checkpoint-storage                          │
//! │              StorageBackend trait                           │
//! │      (get, get_many, set, CAS, increment, ttl)              │
//! ├──────────────┬──────────────────────────────────────────────┤
//! │ MemoryBackend│   RedisBackend (checkpoint-storage-redis)    │
//! │ (in-process) │             (distributed)                    │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//!
//! use checkpoint_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!
//!     // Insert-if-absent, then update-if-unchanged
//!     backend.compare_and_set(b"slot", None, b"v1".to_vec()).await?;
//!     backend.compare_and_set(b"slot", Some(b"v1"), b"v2".to_vec()).await?;
//!
//!     // Windowed counter
//!     let counter = backend.increment(b"hits", Duration::from_secs(60)).await?;
//!     assert_eq!(counter.value, 1);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with shared test helpers ([`FlakyBackend`]
//!   fault injection, key generators, assertion macros).
//! - **`failpoints`**: Compiles `fail` points into the memory backend.
//!
//! [`FlakyBackend`]: crate::testutil::FlakyBackend

#![deny(unsafe_code)]

pub mod backend;
pub mod error;
pub mod memory;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;
pub mod types;

// Re-export primary types at crate root for convenience
pub use backend::StorageBackend;
pub use error::{BoxError, ConfigError, StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use types::Counter;
