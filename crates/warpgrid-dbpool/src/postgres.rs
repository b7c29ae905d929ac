//! Postgres links on `tokio-postgres`.
//!
//! [`PgConnector`] dials the pool's resolved address (never re-resolving the
//! hostname) and spawns the protocol driver onto the current runtime, so it
//! must be called from inside a worker's runtime.

use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row, Statement};

use crate::connection::{ConnectTarget, Connector, DatabaseLink, DatabaseType};
use crate::error::LinkError;

/// Opens plaintext Postgres links.
#[derive(Clone, Debug, Default)]
pub struct PgConnector {
    application_name: Option<String>,
}

impl PgConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: report `name` as `application_name` to the server.
    pub fn with_application_name(self, name: &str) -> Self {
        Self {
            application_name: Some(name.to_string()),
        }
    }

    fn pg_config(&self, target: &ConnectTarget) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&target.addr.to_string())
            .port(target.port)
            .user(&target.user)
            .dbname(&target.database);
        if let Some(password) = &target.password {
            config.password(password);
        }
        if let Some(name) = &self.application_name {
            config.application_name(name);
        }
        config
    }
}

impl Connector for PgConnector {
    type Link = PgLink;

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    async fn connect(&self, target: &ConnectTarget) -> Result<PgLink, LinkError> {
        tracing::debug!(
            host = %target.host,
            addr = %target.addr,
            port = target.port,
            database = %target.database,
            "connecting to postgres"
        );

        let (client, connection) = self
            .pg_config(target)
            .connect(NoTls)
            .await
            .map_err(|e| LinkError::Connect(format_pg_error(&e)))?;

        let host = target.host.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(host = %host, error = %e, "postgres connection driver exited");
            }
        });

        Ok(PgLink {
            client: Some(client),
        })
    }
}

/// One `tokio-postgres` client. `None` once closed.
pub struct PgLink {
    client: Option<Client>,
}

impl PgLink {
    fn client(&self) -> Result<&Client, LinkError> {
        match &self.client {
            Some(client) if !client.is_closed() => Ok(client),
            _ => Err(LinkError::Closed),
        }
    }
}

impl std::fmt::Debug for PgLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgLink")
            .field("closed", &self.client().is_err())
            .finish()
    }
}

impl DatabaseLink for PgLink {
    type Statement = Statement;
    type Row = Row;
    type Param = dyn ToSql + Sync;

    async fn prepare(&mut self, query: &str) -> Result<Statement, LinkError> {
        self.client()?
            .prepare(query)
            .await
            .map_err(|e| LinkError::Prepare(format_pg_error(&e)))
    }

    async fn execute(
        &mut self,
        statement: &Statement,
        params: &[&Self::Param],
    ) -> Result<Vec<Row>, LinkError> {
        self.client()?
            .query(statement, params)
            .await
            .map_err(|e| LinkError::Query(format_pg_error(&e)))
    }

    async fn ping(&mut self) -> bool {
        match self.client() {
            Ok(client) => client.simple_query("").await.is_ok(),
            Err(_) => false,
        }
    }

    fn close(&mut self) {
        // Dropping the last client handle terminates the connection driver task.
        if self.client.take().is_some() {
            tracing::trace!("postgres link closed");
        }
    }
}

/// Render a Postgres error with its SQLSTATE when the server sent one.
fn format_pg_error(error: &tokio_postgres::Error) -> String {
    match error.as_db_error() {
        Some(db_error) => format!("{} (code: {})", db_error.message(), db_error.code().code()),
        None => error.to_string(),
    }
}
