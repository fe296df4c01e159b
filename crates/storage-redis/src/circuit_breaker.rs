//! Circuit breaker guarding the distributed store.
//!
//! While Redis is down every call would wait out the operation timeout before
//! [`FailoverBackend`](crate::FailoverBackend) could answer it in-process. The
//! breaker counts consecutive outages, sends traffic straight to the fallback
//! once the count reaches the threshold, and lets probes through after the
//! recovery timeout.
//!
//! ```text
//!            outages >= failure_threshold
//!   Closed ──────────────────────────────→ Open
//!     ↑                                     │ recovery_timeout
//!     │ probe_successes reached             ↓
//!     └──────────────────────────────── HalfOpen ──probe outage──→ Open
//! ```

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use checkpoint_storage::ConfigError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Consecutive outages that open the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// How long an open circuit bypasses the distributed store.
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Successful probes needed to close a half-open circuit.
pub const DEFAULT_PROBE_SUCCESSES: u32 = 1;

/// Where the breaker currently sends traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Everything goes to the distributed store.
    Closed,
    /// Everything goes to the fallback until `until`.
    Open {
        /// End of the bypass period.
        until: Instant,
    },
    /// Calls go to the distributed store as probes.
    HalfOpen,
}

impl CircuitState {
    fn name(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open { .. } => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Breaker thresholds, read from the `[store.circuit_breaker]` table:
///
/// ```toml
/// [store.circuit_breaker]
/// failure_threshold = 3
/// recovery_timeout = "10s"
/// probe_successes = 1
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CircuitBreakerConfig {
    failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    recovery_timeout: Duration,
    probe_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            probe_successes: DEFAULT_PROBE_SUCCESSES,
        }
    }
}

#[bon::bon]
impl CircuitBreakerConfig {
    /// Builds a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any threshold or the timeout is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_FAILURE_THRESHOLD)] failure_threshold: u32,
        #[builder(default = DEFAULT_RECOVERY_TIMEOUT)] recovery_timeout: Duration,
        #[builder(default = DEFAULT_PROBE_SUCCESSES)] probe_successes: u32,
    ) -> Result<Self, ConfigError> {
        let config = Self { failure_threshold, recovery_timeout, probe_successes };
        config.validate()?;
        Ok(config)
    }

    /// Validates a deserialized configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any threshold or the timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in
            [("failure_threshold", self.failure_threshold), ("probe_successes", self.probe_successes)]
        {
            if value == 0 {
                return Err(ConfigError::BelowMinimum { field, min: "1".into(), value: "0".into() });
            }
        }
        if self.recovery_timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "recovery_timeout",
                value: "0s".into(),
            });
        }
        Ok(())
    }

    /// Consecutive outages that open the circuit.
    #[must_use]
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Bypass period of an open circuit.
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    /// Successful probes needed to close.
    #[must_use]
    pub fn probe_successes(&self) -> u32 {
        self.probe_successes
    }
}

/// Decision for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Send to the distributed store.
    Primary,
    /// Send to the distributed store to test recovery.
    Probe,
    /// Skip the distributed store.
    Bypass,
}

impl Admission {
    /// Returns `true` unless the call must skip the distributed store.
    #[must_use]
    pub fn uses_primary(self) -> bool {
        !matches!(self, Self::Bypass)
    }
}

/// Counters exposed through [`CircuitBreaker::metrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    /// State at the time of the snapshot.
    pub state: CircuitState,
    /// Transitions since creation.
    pub state_transitions: u64,
    /// Calls sent to the fallback by an open circuit.
    pub bypassed_requests: u64,
    /// Calls admitted as probes.
    pub probes: u64,
    /// Outages (closed) or successful probes (half-open) in a row.
    pub streak: u32,
}

#[derive(Debug)]
struct Inner {
    config: CircuitBreakerConfig,
    state: CircuitState,
    streak: u32,
    state_transitions: u64,
    bypassed_requests: u64,
    probes: u64,
}

impl Inner {
    fn move_to(&mut self, next: CircuitState) {
        let from = self.state.name();
        self.state = next;
        self.streak = 0;
        self.state_transitions += 1;

        let recovery_secs = self.config.recovery_timeout.as_secs();
        match next {
            CircuitState::Open { .. } => tracing::warn!(
                from,
                recovery_secs,
                "circuit opened, serving shared state from the in-process store"
            ),
            CircuitState::HalfOpen => tracing::info!(from, "probing distributed store"),
            CircuitState::Closed => tracing::info!(from, "distributed store recovered"),
        }
    }

    fn open(&mut self) {
        self.move_to(CircuitState::Open { until: Instant::now() + self.config.recovery_timeout });
    }

    fn observed_state(&self) -> CircuitState {
        match self.state {
            CircuitState::Open { until } if Instant::now() >= until => CircuitState::HalfOpen,
            state => state,
        }
    }
}

/// Breaker shared by clones of one [`FailoverBackend`](crate::FailoverBackend).
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    inner: Arc<Mutex<Inner>>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                config,
                state: CircuitState::Closed,
                streak: 0,
                state_transitions: 0,
                bypassed_requests: 0,
                probes: 0,
            })),
        }
    }

    /// Decides where the next call goes.
    ///
    /// The first call after the recovery timeout moves the circuit to
    /// half-open.
    pub fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        if let CircuitState::Open { until } = inner.state {
            if Instant::now() < until {
                inner.bypassed_requests += 1;
                return Admission::Bypass;
            }
            inner.move_to(CircuitState::HalfOpen);
        }

        if inner.state == CircuitState::HalfOpen {
            inner.probes += 1;
            Admission::Probe
        } else {
            Admission::Primary
        }
    }

    /// Records an answer from the distributed store, including definite
    /// errors such as a compare-and-set conflict.
    pub fn on_answer(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.streak = 0,
            CircuitState::HalfOpen => {
                inner.streak += 1;
                if inner.streak >= inner.config.probe_successes {
                    inner.move_to(CircuitState::Closed);
                }
            },
            // Admitted before the circuit opened.
            CircuitState::Open { .. } => {},
        }
    }

    /// Records a transient failure of the distributed store.
    pub fn on_outage(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.streak += 1;
                if inner.streak >= inner.config.failure_threshold {
                    inner.open();
                }
            },
            CircuitState::HalfOpen => inner.open(),
            CircuitState::Open { .. } => {},
        }
    }

    /// Current state. An expired open circuit reads as half-open.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().observed_state()
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            state: inner.observed_state(),
            state_transitions: inner.state_transitions,
            bypassed_requests: inner.bypassed_requests,
            probes: inner.probes,
            streak: inner.streak,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    const SHORT: Duration = Duration::from_millis(10);

    fn breaker(failure_threshold: u32, recovery_timeout: Duration, probe_successes: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout,
            probe_successes,
        })
    }

    fn wait_out(timeout: Duration) {
        std::thread::sleep(timeout + Duration::from_millis(5));
    }

    #[test]
    fn new_breaker_admits_to_primary() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default());
        assert_eq!(cb.admit(), Admission::Primary);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn outages_below_threshold_keep_circuit_closed() {
        let cb = breaker(3, Duration::from_secs(30), 1);
        cb.on_outage();
        cb.on_outage();
        cb.on_answer();
        cb.on_outage();
        cb.on_outage();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().streak, 2);
    }

    #[test]
    fn threshold_opens_and_bypasses() {
        let cb = breaker(2, Duration::from_secs(30), 1);
        cb.on_outage();
        cb.on_outage();

        assert_eq!(cb.admit(), Admission::Bypass);
        assert_eq!(cb.admit(), Admission::Bypass);

        let m = cb.metrics();
        assert!(matches!(m.state, CircuitState::Open { .. }));
        assert_eq!(m.bypassed_requests, 2);
        assert_eq!(m.state_transitions, 1);
    }

    #[test]
    fn expired_open_circuit_reads_half_open() {
        let cb = breaker(1, SHORT, 1);
        cb.on_outage();
        wait_out(SHORT);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.admit(), Admission::Probe);
    }

    #[rstest]
    #[case::one_probe(1, 1)]
    #[case::two_probes(2, 2)]
    fn probes_close_the_circuit(#[case] probe_successes: u32, #[case] answers: u32) {
        let cb = breaker(1, SHORT, probe_successes);
        cb.on_outage();
        wait_out(SHORT);

        for n in 1..=answers {
            assert!(cb.admit().uses_primary());
            cb.on_answer();
            let expected = if n == answers { CircuitState::Closed } else { CircuitState::HalfOpen };
            assert_eq!(cb.state(), expected);
        }

        let m = cb.metrics();
        assert_eq!(m.state_transitions, 3);
        assert_eq!(m.probes, u64::from(answers));
    }

    #[test]
    fn failed_probe_reopens() {
        let cb = breaker(1, SHORT, 1);
        cb.on_outage();
        wait_out(SHORT);
        assert_eq!(cb.admit(), Admission::Probe);

        cb.on_outage();
        assert!(matches!(cb.state(), CircuitState::Open { .. }));
        assert_eq!(cb.admit(), Admission::Bypass);
    }

    #[test]
    fn late_answer_does_not_close_open_circuit() {
        let cb = breaker(1, Duration::from_secs(30), 1);
        cb.on_outage();
        cb.on_answer();
        assert!(matches!(cb.state(), CircuitState::Open { .. }));
    }

    #[test]
    fn builder_defaults_match_default() {
        assert_eq!(CircuitBreakerConfig::builder().build().unwrap(), CircuitBreakerConfig::default());
    }

    #[rstest]
    #[case::failure_threshold("failure_threshold = 0", "failure_threshold")]
    #[case::probe_successes("probe_successes = 0", "probe_successes")]
    #[case::recovery_timeout("recovery_timeout = \"0s\"", "recovery_timeout")]
    fn zero_values_rejected(#[case] toml_src: &str, #[case] field: &str) {
        let config: CircuitBreakerConfig = toml::from_str(toml_src).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().starts_with(field), "unexpected error: {err}");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: CircuitBreakerConfig =
            toml::from_str("failure_threshold = 5\nrecovery_timeout = \"1m\"").unwrap();
        assert_eq!(config.failure_threshold(), 5);
        assert_eq!(config.recovery_timeout(), Duration::from_secs(60));
        assert_eq!(config.probe_successes(), DEFAULT_PROBE_SUCCESSES);
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(toml::from_str::<CircuitBreakerConfig>("half_open = 2").is_err());
    }
}
