//! Value types returned by storage operations.

use std::time::Duration;

/// Result of an atomic [`increment`](crate::StorageBackend::increment).
///
/// `value` is the post-increment count. `expires_in` is how long the current
/// window has left; it is the full TTL when this call created the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    /// Count after this increment was applied.
    pub value: u64,
    /// Remaining lifetime of the counter key.
    pub expires_in: Duration,
}

impl Counter {
    /// Creates a counter snapshot.
    #[must_use]
    pub fn new(value: u64, expires_in: Duration) -> Self {
        Self { value, expires_in }
    }

    /// Returns `true` if this increment opened a new window.
    #[must_use]
    pub fn is_first(&self) -> bool {
        self.value == 1
    }
}
