//! # Checkpoint Core
//!
//! Attendance check-in primitives over one shared atomic store.
//!
//! - [`TokenAuthority`]: single-use access tokens, redeemed exactly once
//! - [`EventLedger`]: Enter/Exit events with per-(person, location) conflict detection
//! - [`RateLimiter`]: fixed-window counters shared across processes
//! - [`CheckInService`]: the control flow tying them to the credential verifier
//!
//! All coordination goes through compare-and-set and atomic increment on a
//! [`StorageBackend`](checkpoint_storage::StorageBackend); no component holds
//! a lock across a store call or caches shared state between calls.
//!
//! ## Example
//!
//! ```no_run
//! use checkpoint_core::{Action, CheckInService, CheckpointConfig, service::OFFICE_LOCATION};
//!
//! # async fn example() -> checkpoint_core::Result<()> {
//! let service = CheckInService::from_config(&CheckpointConfig::default()).await?;
//!
//! let link = service.current_token("terminal-1", None).await?;
//! let event = service
//!     .submit_with_token("10.0.0.7", &link.id, "alice", OFFICE_LOCATION, Action::Enter)
//!     .await?;
//! assert_eq!(event.sequence, 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - **`failpoints`**: Compiles `fail` points that drop the acknowledgement of token redemption,
//!   ledger and key rotation writes.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod access;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod rate_limit;
pub mod service;
pub mod store;
pub mod token;

pub use access::{AccessKeyGuard, TokenLink};
pub use config::{CheckpointConfig, LedgerConfig, RateLimitConfig, RoutePolicy, StoreConfig, TokenConfig};
pub use dispatch::{Command, Reply, dispatch};
pub use error::{CheckpointError, ErrorKind, LedgerError, RateLimitError, Result, TokenError};
pub use ledger::{Action, Event, EventJournal, EventLedger, MemoryEventJournal, Presence, TracingEventJournal};
pub use rate_limit::{RateDecision, RateLimiter, RouteClass, client_key_from_forwarded};
pub use service::CheckInService;
pub use store::SharedStore;
pub use token::{Token, TokenAuthority, TokenState};
