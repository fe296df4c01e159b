//! Error types for the Redis storage backend.
//!
//! Maps Redis client failures onto the generic
//! [`StorageError`](checkpoint_storage::StorageError) so the failover layer
//! can tell "Redis is gone" apart from "Redis said no".

use checkpoint_storage::StorageError;
use redis::RedisError;
use thiserror::Error;

/// Result type alias for Redis backend construction.
pub type Result<T> = std::result::Result<T, RedisStorageError>;

/// Errors specific to the Redis storage backend.
#[derive(Debug, Error)]
pub enum RedisStorageError {
    /// Error from the Redis client.
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    /// Connecting did not finish within the configured timeout.
    #[error("Connecting to Redis timed out")]
    ConnectTimeout,

    /// A script returned a reply this backend does not understand.
    #[error("Unexpected script reply: {0}")]
    UnexpectedReply(String),
}

impl From<RedisStorageError> for StorageError {
    fn from(err: RedisStorageError) -> Self {
        match err {
            RedisStorageError::Redis(source) => redis_error_to_storage_error(source),
            RedisStorageError::ConnectTimeout => StorageError::timeout(),
            RedisStorageError::UnexpectedReply(message) => {
                tracing::error!(reply = %message, "Redis script returned an unexpected reply");
                StorageError::internal(format!("Unexpected script reply: {message}"))
            },
        }
    }
}

/// Converts a client error to a storage error.
///
/// A refused connection means the command was never sent. A timeout or a
/// connection lost mid-command leaves its outcome unknown and maps to
/// [`StorageError::Timeout`]. Everything else is a definite failure.
fn redis_error_to_storage_error(err: RedisError) -> StorageError {
    if err.is_connection_refusal() {
        StorageError::connection("Redis unreachable").with_source(err)
    } else if err.is_timeout() || err.is_connection_dropped() || err.is_io_error() {
        tracing::warn!(error = %err, "Redis command outcome unknown");
        StorageError::timeout()
    } else if err.kind() == redis::ErrorKind::TypeError
        || err.to_string().contains("not an integer")
    {
        StorageError::serialization("Redis value has an unexpected type").with_source(err)
    } else {
        StorageError::internal("Redis command failed").with_source(err)
    }
}
