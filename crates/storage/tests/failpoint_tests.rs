//! Outage injection on `MemoryBackend`.
//!
//! ```bash
//! cargo test -p checkpoint-storage --features failpoints --test failpoint_tests
//! ```

#![cfg(feature = "failpoints")]
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::time::Duration;

use bytes::Bytes;
use checkpoint_storage::{MemoryBackend, StorageBackend, StorageError};

#[tokio::test]
async fn injected_cas_outage_is_transient_and_writes_nothing() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("memory-cas-unreachable", "1*return").unwrap();

    let backend = MemoryBackend::new();
    let err = backend.compare_and_set(b"slot", None, b"v1".to_vec()).await.unwrap_err();
    assert!(matches!(err, StorageError::Connection { .. }), "{err:?}");
    assert!(err.is_transient());
    assert_eq!(backend.get(b"slot").await.unwrap(), None);

    // The fail point fired once; the retry goes through.
    backend.compare_and_set(b"slot", None, b"v1".to_vec()).await.unwrap();
    assert_eq!(backend.get(b"slot").await.unwrap(), Some(Bytes::from_static(b"v1")));

    scenario.teardown();
}

#[tokio::test]
async fn injected_increment_outage_leaves_counter_untouched() {
    let scenario = fail::FailScenario::setup();
    let backend = MemoryBackend::new();
    let window = Duration::from_secs(60);

    backend.increment(b"hits", window).await.unwrap();
    fail::cfg("memory-increment-unreachable", "return").unwrap();
    assert!(backend.increment(b"hits", window).await.unwrap_err().is_transient());

    fail::remove("memory-increment-unreachable");
    assert_eq!(backend.increment(b"hits", window).await.unwrap().value, 2);

    scenario.teardown();
}

#[tokio::test]
async fn injected_health_check_failure() {
    let scenario = fail::FailScenario::setup();
    let backend = MemoryBackend::new();

    assert!(backend.health_check().await.is_ok());
    fail::cfg("memory-health-check", "return").unwrap();
    assert!(backend.health_check().await.is_err());

    scenario.teardown();
}
