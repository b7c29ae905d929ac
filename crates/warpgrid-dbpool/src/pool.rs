//! Per-worker connection pool.
//!
//! Hands out [`Connection`]s in FIFO order, opening a new one only when the
//! idle queue is empty. The database host is resolved once per pool.
//!
//! # Concurrency model
//!
//! A pool lives on one cooperative worker (a `current_thread` runtime
//! driving a `LocalSet`) and is shared between that worker's handler tasks
//! through an `Rc`. Interior state uses `Cell`/`RefCell`; no borrow is ever
//! held across an `.await`, so queue manipulation runs to completion between
//! yield points and needs no lock. The pool is `!Sync` and its `Rc` handle is
//! `!Send`, so it cannot leak onto another worker thread. Run one pool per
//! worker; see [`crate::worker`].
//!
//! ```text
//! handler calls acquire(Postgres)
//!   → draining?                         → Err(Draining)
//!   → bounded and no free slot in time  → Err(PoolExhausted)
//!   → idle queue non-empty              → pop front (ping first if validating)
//!   → idle queue empty                  → resolve host (once), connect
//!       → connect fails                 → Err(ConnectionUnavailable)
//!   → drain started meanwhile           → close, Err(Draining)
//! handler calls release(conn)
//!   → not checked out here              → Err(InvalidRelease)
//!   → draining                          → close
//!   → otherwise                         → push back
//! handler drops conn                    → close, slot freed
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::SemaphorePermit;
use tokio::time::Instant;

use crate::config::{DatabaseConfig, PoolConfig, PoolSettings};
use crate::connection::{Checkouts, ConnectTarget, Connection, Connector, DatabaseType};
use crate::error::{PoolError, PoolResult};
use crate::resolve::{HostResolver, Resolve, SystemResolver};

/// How often `drain()` re-checks for outstanding connections.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Point-in-time pool counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently checked out.
    pub active: usize,
    /// Connections sitting idle in the pool.
    pub idle: usize,
    /// Total connections (active + idle).
    pub total: usize,
    /// Connections opened over the pool's lifetime.
    pub created: u64,
    /// Acquisitions served from the idle queue.
    pub reused: u64,
    /// Acquisitions that timed out waiting for a slot.
    pub wait_count: u64,
}

/// Lazily grown pool of database connections for one worker.
pub struct ConnectionPool<C: Connector, R = SystemResolver> {
    database: DatabaseConfig,
    config: PoolConfig,
    connector: C,
    host: HostResolver<R>,
    /// Idle connections, oldest release at the front.
    idle: RefCell<VecDeque<Connection<C::Link>>>,
    /// Connections currently held by callers, and the `max_size` slots.
    checkouts: Rc<Checkouts>,
    next_connection_id: Cell<u64>,
    draining: Cell<bool>,
    created: Cell<u64>,
    reused: Cell<u64>,
    wait_count: Cell<u64>,
}

impl<C: Connector> ConnectionPool<C, SystemResolver> {
    /// Create a pool that resolves its host through system DNS.
    pub fn new(settings: PoolSettings, connector: C) -> Self {
        Self::with_resolver(settings, connector, SystemResolver)
    }
}

impl<C: Connector, R: Resolve> ConnectionPool<C, R> {
    /// Create a pool with an injected host resolver.
    pub fn with_resolver(settings: PoolSettings, connector: C, resolver: R) -> Self {
        let PoolSettings { database, pool } = settings;
        let checkouts = Rc::new(Checkouts::new(pool.max_size));
        Self {
            host: HostResolver::new(&database.host, resolver),
            database,
            config: pool,
            connector,
            idle: RefCell::new(VecDeque::new()),
            checkouts,
            next_connection_id: Cell::new(1),
            draining: Cell::new(false),
            created: Cell::new(0),
            reused: Cell::new(0),
            wait_count: Cell::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn database(&self) -> &DatabaseConfig {
        &self.database
    }

    pub fn is_draining(&self) -> bool {
        self.draining.get()
    }

    /// Number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.idle.borrow().len()
    }

    /// Resolve the database host once and cache it.
    ///
    /// Intended for the worker-startup hook; later calls return the cached
    /// address without touching DNS.
    pub async fn resolve_host(&self) -> PoolResult<IpAddr> {
        self.host.resolve().await
    }

    /// Check out a connection.
    ///
    /// Returns the longest-idle connection if there is one, otherwise opens
    /// a new one. Dropping the returned future before it completes cancels
    /// the acquisition without consuming a slot.
    pub async fn acquire(&self, database_type: DatabaseType) -> PoolResult<Connection<C::Link>> {
        if self.draining.get() {
            return Err(PoolError::Draining);
        }
        if database_type != self.connector.database_type() {
            return Err(PoolError::UnsupportedDatabase(database_type.to_string()));
        }

        let permit = self.wait_for_slot().await?;
        if self.draining.get() {
            return Err(PoolError::Draining);
        }

        let idle = self.idle.borrow_mut().pop_front();
        let mut conn = match idle {
            Some(conn) => self.reuse(conn).await?,
            None => self.open().await?,
        };
        if self.draining.get() {
            tracing::debug!(id = conn.id(), "closing connection opened while draining");
            conn.close();
            return Err(PoolError::Draining);
        }
        conn.touch();

        // The slot stays taken until the connection comes back.
        if let Some(permit) = permit {
            permit.forget();
        }
        self.checkouts.check_out(conn.id());
        Ok(conn)
    }

    /// Return a connection for reuse.
    ///
    /// Fails with [`PoolError::InvalidRelease`] if `conn` was not checked out
    /// from this pool. The idle queue is left untouched and `conn` is dropped,
    /// which closes it and frees its slot in the pool that opened it.
    pub fn release(&self, mut conn: Connection<C::Link>) -> PoolResult<()> {
        self.check_in(&conn)?;

        if self.draining.get() {
            tracing::debug!(id = conn.id(), "closing connection released during drain");
            conn.close();
            return Ok(());
        }

        conn.touch();
        let id = conn.id();
        let idle = {
            let mut queue = self.idle.borrow_mut();
            queue.push_back(conn);
            queue.len()
        };
        tracing::debug!(id = id, idle = idle, "returned connection to pool");
        Ok(())
    }

    /// Close a checked-out connection instead of returning it, e.g. after the
    /// caller saw its link break.
    pub fn discard(&self, conn: Connection<C::Link>) -> PoolResult<()> {
        self.check_in(&conn)?;
        tracing::debug!(id = conn.id(), "discarded checked-out connection");
        conn.close();
        Ok(())
    }

    /// Close idle connections unused for longer than `idle_timeout`.
    ///
    /// Returns the number closed.
    pub fn reap_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let expired = {
            let mut queue = self.idle.borrow_mut();
            let (keep, expired): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(|conn| conn.idle_for() < idle_timeout);
            *queue = keep;
            expired
        };

        let reaped = expired.len();
        for conn in expired {
            conn.close();
        }
        if reaped > 0 {
            tracing::info!(
                host = %self.database.host,
                reaped = reaped,
                remaining_idle = self.idle_count(),
                "reaped idle connections"
            );
        }
        reaped
    }

    /// Stop handing out connections and close everything the pool holds.
    ///
    /// New `acquire()` calls fail with [`PoolError::Draining`] immediately.
    /// Waits up to `drain_timeout` for checked-out connections to be
    /// released (they are closed on release), then closes the idle queue.
    /// Returns how many connections were still checked out at the deadline.
    pub async fn drain(&self) -> usize {
        self.draining.set(true);
        if let Some(slots) = self.checkouts.slots() {
            slots.close();
        }
        tracing::info!(
            drain_timeout = ?self.config.drain_timeout,
            "connection pool draining started"
        );

        let deadline = Instant::now() + self.config.drain_timeout;
        loop {
            let active = self.checkouts.len();
            if active == 0 {
                tracing::info!("all checked-out connections returned");
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    remaining = active,
                    "drain timeout expired with connections still checked out"
                );
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let idle: Vec<_> = self.idle.borrow_mut().drain(..).collect();
        let closed = idle.len();
        for conn in idle {
            conn.close();
        }

        let outstanding = self.checkouts.len();
        tracing::info!(
            closed_idle = closed,
            outstanding = outstanding,
            "connection pool drain complete"
        );
        outstanding
    }

    pub fn stats(&self) -> PoolStats {
        let active = self.checkouts.len();
        let idle = self.idle.borrow().len();
        PoolStats {
            active,
            idle,
            total: active + idle,
            created: self.created.get(),
            reused: self.reused.get(),
            wait_count: self.wait_count.get(),
        }
    }

    /// Log pool statistics at `tracing::info` level.
    pub fn log_stats(&self) {
        let stats = self.stats();
        tracing::info!(
            host = %self.database.host,
            database = %self.database.database,
            active = stats.active,
            idle = stats.idle,
            total = stats.total,
            created = stats.created,
            reused = stats.reused,
            wait_count = stats.wait_count,
            "pool statistics"
        );
    }

    // ── Internals ───────────────────────────────────────────────────

    async fn wait_for_slot(&self) -> PoolResult<Option<SemaphorePermit<'_>>> {
        let (Some(slots), Some(max_size)) = (self.checkouts.slots(), self.config.max_size) else {
            return Ok(None);
        };

        match tokio::time::timeout(self.config.acquire_timeout, slots.acquire()).await {
            Ok(Ok(permit)) => Ok(Some(permit)),
            Ok(Err(_)) => Err(PoolError::Draining),
            Err(_) => {
                self.wait_count.set(self.wait_count.get() + 1);
                tracing::debug!(
                    max_size = max_size,
                    waited = ?self.config.acquire_timeout,
                    "connection pool exhausted"
                );
                Err(PoolError::PoolExhausted {
                    max_size,
                    waited: self.config.acquire_timeout,
                })
            }
        }
    }

    /// Hand out an idle connection, validating it first if configured.
    async fn reuse(&self, mut conn: Connection<C::Link>) -> PoolResult<Connection<C::Link>> {
        if !self.config.validate_on_acquire || conn.ping().await {
            self.reused.set(self.reused.get() + 1);
            tracing::debug!(id = conn.id(), "reused idle connection from pool");
            return Ok(conn);
        }

        let stale_id = conn.id();
        tracing::info!(id = stale_id, "idle connection failed liveness check, reconnecting");
        conn.close();
        self.open().await.map_err(|e| PoolError::StaleConnection {
            id: stale_id,
            reason: e.to_string(),
        })
    }

    /// Open a brand-new connection to the resolved host.
    async fn open(&self) -> PoolResult<Connection<C::Link>> {
        let addr = self.resolve_host().await?;
        let target = ConnectTarget::new(&self.database, addr);

        let link = match tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(&target),
        )
        .await
        {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                tracing::warn!(host = %self.database.host, addr = %addr, error = %e, "connect failed");
                return Err(PoolError::ConnectionUnavailable {
                    host: self.database.host.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                tracing::warn!(
                    host = %self.database.host,
                    addr = %addr,
                    timeout = ?self.config.connect_timeout,
                    "connect timed out"
                );
                return Err(PoolError::ConnectionUnavailable {
                    host: self.database.host.clone(),
                    reason: format!("connect timed out after {:?}", self.config.connect_timeout),
                });
            }
        };

        let id = self.next_connection_id.get();
        self.next_connection_id.set(id + 1);
        self.created.set(self.created.get() + 1);
        tracing::debug!(
            id = id,
            host = %self.database.host,
            addr = %addr,
            port = self.database.port,
            database = %self.database.database,
            "created new connection"
        );
        Ok(Connection::new(id, Rc::clone(&self.checkouts), link))
    }

    /// Remove `conn` from the checked-out set and free its slot.
    fn check_in(&self, conn: &Connection<C::Link>) -> PoolResult<()> {
        if !conn.belongs_to(&self.checkouts) || !self.checkouts.check_in(conn.id()) {
            tracing::warn!(id = conn.id(), "release of connection not checked out from this pool");
            return Err(PoolError::InvalidRelease { id: conn.id() });
        }
        Ok(())
    }
}

impl<C: Connector, R> std::fmt::Debug for ConnectionPool<C, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("database", &self.database)
            .field("config", &self.config)
            .field("idle", &self.idle.borrow().len())
            .field("checked_out", &self.checkouts.len())
            .field("draining", &self.draining.get())
            .finish_non_exhaustive()
    }
}
