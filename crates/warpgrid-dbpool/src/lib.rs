//! warpgrid-dbpool: per-worker database connection pooling for WarpGrid.
//!
//! Each cooperative worker owns one [`ConnectionPool`]:
//! - **resolve**: the database host is resolved once and the address reused
//! - **pool**: FIFO idle queue, lazy growth, optional upper bound, drain
//! - **connection**: pooled connections with a per-connection statement cache
//! - **postgres**: `tokio-postgres` backed [`Connector`]
//! - **worker**: single-threaded runtimes that host a pool and its handlers
//! - **config**: `dbpool.toml` parsing with environment overrides

pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod postgres;
pub mod resolve;
pub mod worker;

pub use config::{DatabaseConfig, PoolConfig, PoolSettings};
pub use connection::{ConnectTarget, Connection, Connector, DatabaseLink, DatabaseType};
pub use error::{ConfigError, LinkError, PoolError, PoolResult, ResolveError, WorkerError};
pub use pool::{ConnectionPool, PoolStats};
pub use postgres::{PgConnector, PgLink};
pub use resolve::{HostResolver, Resolve, SystemResolver};
pub use worker::{Worker, join_workers, spawn_workers};
