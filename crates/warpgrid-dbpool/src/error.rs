//! Error types for the connection pool.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Failures reported by a [`DatabaseLink`](crate::connection::DatabaseLink)
/// or [`Connector`](crate::connection::Connector).
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("prepare failed: {0}")]
    Prepare(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("link closed")]
    Closed,
}

/// Failures looking up the database host through a
/// [`Resolve`](crate::resolve::Resolve) implementation.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("HostNotFound: {0}")]
    HostNotFound(String),

    #[error("DNS lookup for {host} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced to callers of the [`ConnectionPool`](crate::pool::ConnectionPool).
#[derive(Debug, Error)]
pub enum PoolError {
    /// Host resolution or link establishment failed.
    #[error("connection unavailable for {host}: {reason}")]
    ConnectionUnavailable { host: String, reason: String },

    /// `release()` or `discard()` on a connection not checked out from this pool.
    #[error("invalid release: connection {id} is not checked out from this pool")]
    InvalidRelease { id: u64 },

    /// An idle connection failed its liveness check and the reconnect failed too.
    #[error("stale connection {id}: {reason}")]
    StaleConnection { id: u64, reason: String },

    #[error("connection pool exhausted (max_size: {max_size}, waited {waited:?})")]
    PoolExhausted { max_size: usize, waited: Duration },

    #[error("connection pool is draining, no new connections accepted")]
    Draining,

    #[error("unsupported database type: {0}")]
    UnsupportedDatabase(String),

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Errors loading or validating [`PoolSettings`](crate::config::PoolSettings).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors starting or joining worker threads.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to start worker runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("worker startup failed: {0}")]
    Startup(#[from] PoolError),

    #[error("worker {0} panicked")]
    Panicked(usize),
}
