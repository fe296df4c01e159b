#![cfg(feature = "failpoints")]
#![allow(clippy::expect_used, clippy::unwrap_used)]
//! Fail-point injection tests for key rotation.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p checkpoint-authn --features failpoints --test failpoint_tests
//! ```

use checkpoint_authn::{CredentialConfig, CredentialVerifier, SigningKeyMaterial};
use checkpoint_storage::MemoryBackend;

#[tokio::test]
async fn rotate_lost_ack_failpoint_still_reports_rotation() {
    let scenario = fail::FailScenario::setup();
    let verifier = CredentialVerifier::new(MemoryBackend::new(), CredentialConfig::default());
    let credential = verifier.sign("alice", "user").await.unwrap();

    fail::cfg("rotate-lose-ack", "return").expect("failed to configure fail point");

    let next = SigningKeyMaterial::generate();
    let kid = next.kid().to_owned();
    let slot = verifier.rotate(next).await.expect("rotation landed despite the lost ack");

    assert_eq!(slot.current.kid(), kid);
    assert_eq!(verifier.verify(&credential).await.unwrap().sub, "alice");

    scenario.teardown();
}

#[tokio::test]
async fn rotate_without_failpoint_succeeds() {
    let scenario = fail::FailScenario::setup();
    let verifier = CredentialVerifier::new(MemoryBackend::new(), CredentialConfig::default());

    verifier.rotate(SigningKeyMaterial::generate()).await.unwrap();

    scenario.teardown();
}
