//! Pooled connections and the transport traits behind them.
//!
//! A [`Connection`] owns one live [`DatabaseLink`] plus the statements
//! prepared on it. Links are opened by a [`Connector`], which the pool calls
//! only when its idle queue is empty.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::IpAddr;
use std::rc::Rc;
use std::str::FromStr;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::config::DatabaseConfig;
use crate::error::{LinkError, PoolError};

/// Database backend a pool hands out connections for.
///
/// Only Postgres exists today; the type is threaded through `acquire()` so
/// callers already name the backend they expect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum DatabaseType {
    #[default]
    Postgres,
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseType::Postgres => write!(f, "postgres"),
        }
    }
}

impl FromStr for DatabaseType {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pgsql" => Ok(DatabaseType::Postgres),
            _ => Err(PoolError::UnsupportedDatabase(s.to_string())),
        }
    }
}

/// Everything a [`Connector`] needs to open one link.
///
/// `addr` is the pool's memoized resolution of `host`; connectors must dial
/// `addr` and keep `host` for logging and TLS names only.
#[derive(Clone)]
pub struct ConnectTarget {
    pub host: String,
    pub addr: IpAddr,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
}

impl ConnectTarget {
    pub fn new(config: &DatabaseConfig, addr: IpAddr) -> Self {
        Self {
            host: config.host.clone(),
            addr,
            port: config.port,
            user: config.user.clone(),
            password: config.password.clone(),
            database: config.database.clone(),
        }
    }
}

impl std::fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectTarget")
            .field("host", &self.host)
            .field("addr", &self.addr)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

/// One live link to the database.
///
/// Futures returned here are not required to be `Send`: links live on a
/// single cooperative worker and never migrate between threads.
pub trait DatabaseLink {
    /// Server-side prepared statement handle.
    type Statement: Clone;
    /// One result row.
    type Row;
    /// Bind parameter type accepted by [`DatabaseLink::execute`].
    type Param: ?Sized;

    fn prepare(&mut self, query: &str) -> impl Future<Output = Result<Self::Statement, LinkError>>;

    fn execute(
        &mut self,
        statement: &Self::Statement,
        params: &[&Self::Param],
    ) -> impl Future<Output = Result<Vec<Self::Row>, LinkError>>;

    /// Cheap round trip. Returns `true` if the link is usable.
    fn ping(&mut self) -> impl Future<Output = bool>;

    /// Close the underlying transport.
    fn close(&mut self);
}

/// Opens new links. Injected into the pool so tests can count connects.
pub trait Connector {
    type Link: DatabaseLink;

    fn database_type(&self) -> DatabaseType;

    fn connect(&self, target: &ConnectTarget) -> impl Future<Output = Result<Self::Link, LinkError>>;
}

/// Checked-out ids and bounded slots, shared by a pool and every connection
/// it opened.
///
/// A connection checks itself back in on drop, so a handler that bails out
/// between `acquire()` and `release()` never strands a slot.
pub(crate) struct Checkouts {
    ids: RefCell<HashSet<u64>>,
    slots: Option<Semaphore>,
}

impl Checkouts {
    pub(crate) fn new(max_size: Option<usize>) -> Self {
        Self {
            ids: RefCell::new(HashSet::new()),
            slots: max_size.map(Semaphore::new),
        }
    }

    pub(crate) fn slots(&self) -> Option<&Semaphore> {
        self.slots.as_ref()
    }

    pub(crate) fn check_out(&self, id: u64) {
        self.ids.borrow_mut().insert(id);
    }

    /// Returns `false` if `id` was not checked out.
    pub(crate) fn check_in(&self, id: u64) -> bool {
        let removed = self.ids.borrow_mut().remove(&id);
        if removed {
            if let Some(slots) = &self.slots {
                slots.add_permits(1);
            }
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.borrow().len()
    }
}

/// A database link checked out of (or idle inside) a
/// [`ConnectionPool`](crate::pool::ConnectionPool).
///
/// Owning a `Connection` is what "checked out" means: the pool moves it to
/// the caller on `acquire()` and takes it back on `release()`, so a
/// connection can never be held by two handlers at once. Dropping a
/// checked-out connection closes its link and frees its slot in the pool.
pub struct Connection<L: DatabaseLink> {
    id: u64,
    checkouts: Rc<Checkouts>,
    link: L,
    /// Query text → prepared statement. Never evicted.
    statements: HashMap<String, L::Statement>,
    created_at: Instant,
    last_used: Instant,
}

impl<L: DatabaseLink> Connection<L> {
    pub(crate) fn new(id: u64, checkouts: Rc<Checkouts>, link: L) -> Self {
        let now = Instant::now();
        Self {
            id,
            checkouts,
            link,
            statements: HashMap::new(),
            created_at: now,
            last_used: now,
        }
    }

    /// Pool-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this connection was opened by the pool owning `checkouts`.
    pub(crate) fn belongs_to(&self, checkouts: &Rc<Checkouts>) -> bool {
        Rc::ptr_eq(&self.checkouts, checkouts)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the connection last left or re-entered the pool.
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Prepare `query` on this connection, reusing an earlier preparation of
    /// the exact same text.
    pub async fn prepare(&mut self, query: &str) -> Result<L::Statement, LinkError> {
        if let Some(statement) = self.statements.get(query) {
            return Ok(statement.clone());
        }

        let statement = self.link.prepare(query).await?;
        self.statements.insert(query.to_string(), statement.clone());
        tracing::debug!(
            id = self.id,
            cached = self.statements.len(),
            "prepared statement cached"
        );
        Ok(statement)
    }

    pub async fn execute(
        &mut self,
        statement: &L::Statement,
        params: &[&L::Param],
    ) -> Result<Vec<L::Row>, LinkError> {
        self.link.execute(statement, params).await
    }

    /// Prepare (through the cache) and execute in one call.
    pub async fn query(&mut self, query: &str, params: &[&L::Param]) -> Result<Vec<L::Row>, LinkError> {
        let statement = self.prepare(query).await?;
        self.link.execute(&statement, params).await
    }

    /// Number of distinct query texts prepared on this connection.
    pub fn cached_statements(&self) -> usize {
        self.statements.len()
    }

    pub(crate) async fn ping(&mut self) -> bool {
        self.link.ping().await
    }

    pub(crate) fn close(mut self) {
        self.link.close();
        tracing::debug!(id = self.id, "connection closed");
    }
}

impl<L: DatabaseLink> Drop for Connection<L> {
    fn drop(&mut self) {
        if self.checkouts.check_in(self.id) {
            tracing::warn!(id = self.id, "checked-out connection dropped without release");
        }
    }
}

impl<L: DatabaseLink> std::fmt::Debug for Connection<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("cached_statements", &self.statements.len())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockConnector;
    use super::*;

    async fn open(connector: &MockConnector) -> Connection<super::mock::MockLink> {
        let target = ConnectTarget::new(
            &DatabaseConfig::new("localhost", "user", "users"),
            "127.0.0.1".parse().unwrap(),
        );
        let link = connector.connect(&target).await.unwrap();
        Connection::new(1, Rc::new(Checkouts::new(None)), link)
    }

    #[test]
    fn database_type_parses_known_names() {
        assert_eq!("postgres".parse::<DatabaseType>().unwrap(), DatabaseType::Postgres);
        assert_eq!("PostgreSQL".parse::<DatabaseType>().unwrap(), DatabaseType::Postgres);
        assert_eq!(DatabaseType::Postgres.to_string(), "postgres");
    }

    #[test]
    fn database_type_rejects_unknown_names() {
        let err = "mysql".parse::<DatabaseType>().unwrap_err();
        assert!(matches!(err, PoolError::UnsupportedDatabase(ref name) if name == "mysql"));
    }

    #[test]
    fn connect_target_debug_hides_password() {
        let config = DatabaseConfig::new("db.local", "user", "users").with_password("hunter2");
        let target = ConnectTarget::new(&config, "10.0.0.1".parse().unwrap());
        let rendered = format!("{target:?}");
        assert!(rendered.contains("10.0.0.1"));
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn prepare_is_memoized_per_query_text() {
        let connector = MockConnector::new();
        let mut conn = open(&connector).await;

        conn.prepare("SELECT 1").await.unwrap();
        conn.prepare("SELECT 1").await.unwrap();
        conn.prepare("SELECT 2").await.unwrap();

        assert_eq!(connector.state.prepares.get(), 2);
        assert_eq!(conn.cached_statements(), 2);
    }

    #[tokio::test]
    async fn query_prepares_once_and_executes_each_time() {
        let connector = MockConnector::new();
        let mut conn = open(&connector).await;
        let sql = "SELECT id, firstName, lastName FROM users LIMIT $1";

        let rows = conn.query(sql, &["10"]).await.unwrap();
        assert_eq!(rows, vec![format!("{sql} 10")]);
        conn.query(sql, &["5"]).await.unwrap();

        assert_eq!(connector.state.prepares.get(), 1);
        assert_eq!(connector.state.executes.get(), 2);
    }

    #[tokio::test]
    async fn dropping_checked_out_connection_checks_it_in() {
        let connector = MockConnector::new();
        let checkouts = Rc::new(Checkouts::new(Some(1)));
        let link = connector
            .connect(&ConnectTarget::new(
                &DatabaseConfig::new("localhost", "user", "users"),
                "127.0.0.1".parse().unwrap(),
            ))
            .await
            .unwrap();

        let permit = checkouts.slots().unwrap().try_acquire().unwrap();
        permit.forget();
        let conn = Connection::new(7, Rc::clone(&checkouts), link);
        checkouts.check_out(conn.id());
        assert_eq!(checkouts.slots().unwrap().available_permits(), 0);

        drop(conn);

        assert_eq!(checkouts.len(), 0);
        assert_eq!(checkouts.slots().unwrap().available_permits(), 1);
        assert!(!checkouts.check_in(7), "second check-in is a no-op");
    }

    #[tokio::test]
    async fn close_closes_link() {
        let connector = MockConnector::new();
        let conn = open(&connector).await;
        conn.close();
        assert_eq!(connector.state.closes.get(), 1);
    }
}
