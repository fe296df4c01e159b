//! Fixed-window rate limiting shared across processes.
//!
//! Each (route, client) pair owns a counter in the store. A request
//! increments the counter first and only then compares the returned count
//! with the limit, so two processes can never both see "one slot left". The
//! counter's TTL is the window: the first increment after it lapses starts a
//! fresh window at 1.
//!
//! Routes may carry a block penalty. A breach writes a block marker with the
//! penalty as TTL, and the client is rejected without counting until it
//! expires.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use checkpoint_storage::StorageBackend;
use serde::{Deserialize, Serialize};

use crate::{config::RateLimitConfig, error::RateLimitError};

/// Store keys owned by the limiter.
///
/// The segment after `ratelimit:` names the namespace, and route segments
/// never contain `:`, so keys from different namespaces cannot collide
/// whatever the client string holds.
#[derive(Debug, Clone, Copy)]
enum LimitKey<'a> {
    /// Ad-hoc window counted by [`RateLimiter::allow`].
    Client(&'a str),
    /// Window of a route policy.
    Route(RouteClass, &'a str),
    /// Block marker after a route breach.
    Block(RouteClass, &'a str),
}

impl LimitKey<'_> {
    fn to_bytes(self) -> Vec<u8> {
        match self {
            Self::Client(client) => format!("ratelimit:client:{client}"),
            Self::Route(route, client) => format!("ratelimit:route:{route}:{client}"),
            Self::Block(route, client) => format!("ratelimit:block:{route}:{client}"),
        }
        .into_bytes()
    }
}

type Result<T> = std::result::Result<T, RateLimitError>;

/// Class of request a limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteClass {
    /// General API traffic.
    Api,
    /// Token issuance.
    TokenCreation,
    /// User administration.
    UserManagement,
    /// Check-in submissions.
    CheckIn,
}

impl RouteClass {
    /// Returns the route's key segment.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::TokenCreation => "token_creation",
            Self::UserManagement => "user_mgmt",
            Self::CheckIn => "checkin",
        }
    }
}

impl fmt::Display for RouteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one counted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Count after this request, or zero if it was not counted.
    pub count: u64,
    /// Time until the client may retry; zero when allowed.
    pub retry_after: Duration,
}

/// Snapshot of limiter activity in this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitMetrics {
    /// Requests let through.
    pub allowed: u64,
    /// Requests over the limit.
    pub rejected: u64,
    /// Requests turned away by a block marker.
    pub blocked: u64,
}

#[derive(Debug, Default)]
struct Counters {
    allowed: AtomicU64,
    rejected: AtomicU64,
    blocked: AtomicU64,
}

/// Returns the client identity for an HTTP request.
///
/// Uses the first address of `X-Forwarded-For` when present, else the peer
/// address.
#[must_use]
pub fn client_key_from_forwarded(forwarded_for: Option<&str>, peer: Option<&str>) -> String {
    forwarded_for
        .and_then(|header| header.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty())
        .or(peer)
        .unwrap_or("unknown")
        .to_owned()
}

/// Store-backed fixed-window limiter.
#[derive(Debug, Clone)]
pub struct RateLimiter<S> {
    store: S,
    config: RateLimitConfig,
    counters: Arc<Counters>,
}

impl<S: StorageBackend> RateLimiter<S> {
    /// Creates a limiter over `store`.
    pub fn new(store: S, config: RateLimitConfig) -> Self {
        Self { store, config, counters: Arc::new(Counters::default()) }
    }

    /// Returns the limits in use.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Returns a snapshot of this process's counters.
    #[must_use]
    pub fn metrics(&self) -> RateLimitMetrics {
        RateLimitMetrics {
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            blocked: self.counters.blocked.load(Ordering::Relaxed),
        }
    }

    /// Counts one request for `client_key` and decides whether it fits in
    /// `limit` requests per `window`.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Store`] if the increment fails.
    #[tracing::instrument(skip(self))]
    pub async fn allow(&self, client_key: &str, limit: u64, window: Duration) -> Result<RateDecision> {
        self.count(&LimitKey::Client(client_key).to_bytes(), limit, window).await
    }

    async fn count(&self, key: &[u8], limit: u64, window: Duration) -> Result<RateDecision> {
        let counter = self.store.increment(key, window).await?;

        if counter.value <= limit {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
            return Ok(RateDecision {
                allowed: true,
                count: counter.value,
                retry_after: Duration::ZERO,
            });
        }

        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        let retry_after = if counter.expires_in.is_zero() { window } else { counter.expires_in };
        Ok(RateDecision { allowed: false, count: counter.value, retry_after })
    }

    /// Applies the policy of `route` to `client`.
    ///
    /// # Errors
    ///
    /// - [`RateLimitError::Exceeded`] if the client is over the limit or blocked
    /// - [`RateLimitError::Store`] if the store fails
    #[tracing::instrument(skip(self), fields(route = %route))]
    pub async fn check(&self, route: RouteClass, client: &str) -> Result<RateDecision> {
        let policy = self.config.policy(route);
        let block_key = LimitKey::Block(route, client).to_bytes();

        if policy.block_for.is_some()
            && let Some(remaining) = self.store.ttl(&block_key).await?
        {
            self.counters.blocked.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(retry_after_ms = remaining.as_millis() as u64, "Client blocked");
            return Err(RateLimitError::Exceeded { retry_after: remaining });
        }

        let counter_key = LimitKey::Route(route, client).to_bytes();
        let decision = self.count(&counter_key, policy.limit, policy.window).await?;
        if decision.allowed {
            return Ok(decision);
        }

        let retry_after = match policy.block_for {
            Some(block_for) => {
                self.store.set_with_ttl(block_key, b"1".to_vec(), block_for).await?;
                tracing::warn!(
                    block_secs = block_for.as_secs(),
                    count = decision.count,
                    "Rate limit exceeded, client blocked"
                );
                block_for.max(decision.retry_after)
            },
            None => {
                tracing::info!(count = decision.count, "Rate limit exceeded");
                decision.retry_after
            },
        };
        Err(RateLimitError::Exceeded { retry_after })
    }
}
