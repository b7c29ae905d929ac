//! dbpool-bench: drive the WarpGrid database pool against a live Postgres.
//!
//! Spawns cooperative workers, each with its own pool, and runs concurrent
//! handlers that acquire a connection, execute one of the users queries,
//! and release it.
//!
//! # Usage
//!
//! ```text
//! dbpool-bench check --config dbpool.toml
//! dbpool-bench run --config dbpool.toml --workers 4 --concurrency 64 --requests 10000
//! ```

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_postgres::types::ToSql;
use tracing::{info, warn};
use warpgrid_dbpool::{
    ConnectionPool, DatabaseType, PgConnector, PoolError, PoolSettings, PoolStats, Worker,
    join_workers, spawn_workers,
};

const APPLICATION_NAME: &str = "dbpool-bench";

const USERS_LIMIT: &str = "SELECT id, firstName, lastName FROM users LIMIT $1";
const USERS_ALL: &str = "SELECT id, firstName, lastName FROM users";
const USERS_UPDATE: &str = "UPDATE users SET firstName = $1, lastName = $2 WHERE id = $3";

#[derive(Parser)]
#[command(name = "dbpool-bench", about = "WarpGrid database pool benchmark")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve the host, open one connection and run a trivial query.
    Check {
        /// Pool settings file.
        #[arg(long, default_value = "dbpool.toml")]
        config: PathBuf,
    },

    /// Run concurrent handlers across workers and report throughput.
    Run {
        /// Pool settings file.
        #[arg(long, default_value = "dbpool.toml")]
        config: PathBuf,

        /// Worker threads, each with its own pool.
        #[arg(long, default_value = "4")]
        workers: usize,

        /// Concurrent handlers per worker.
        #[arg(long, default_value = "16")]
        concurrency: usize,

        /// Requests per worker.
        #[arg(long, default_value = "1000")]
        requests: usize,

        /// Query each request runs.
        #[arg(long, value_enum, default_value = "limit")]
        query: Workload,

        /// Row limit for the `limit` workload.
        #[arg(long, default_value = "10")]
        limit: i64,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Workload {
    /// `SELECT ... LIMIT $1`
    Limit,
    /// `SELECT ...` over the whole table.
    All,
    /// `UPDATE users ... WHERE id = $3`
    Update,
}

#[derive(Clone, Copy)]
struct RunOptions {
    concurrency: usize,
    requests: usize,
    query: Workload,
    limit: i64,
}

#[derive(Debug, Serialize)]
struct WorkerReport {
    worker: usize,
    requests: usize,
    errors: usize,
    rows: u64,
    elapsed_ms: u128,
    created: u64,
    reused: u64,
    wait_count: u64,
}

#[derive(Debug, Serialize)]
struct BenchReport {
    workers: Vec<WorkerReport>,
    requests: usize,
    errors: usize,
    elapsed_ms: u128,
    requests_per_sec: f64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dbpool_bench=debug,warpgrid_dbpool=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Check { config } => run_check(&config),
        Command::Run {
            config,
            workers,
            concurrency,
            requests,
            query,
            limit,
            json,
        } => {
            anyhow::ensure!(workers > 0, "--workers must be at least 1");
            anyhow::ensure!(concurrency > 0, "--concurrency must be at least 1");
            let options = RunOptions {
                concurrency,
                requests,
                query,
                limit,
            };
            run_bench(&config, workers, options, json)
        }
    }
}

fn load_settings(path: &Path) -> anyhow::Result<PoolSettings> {
    PoolSettings::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn new_pool(settings: PoolSettings) -> ConnectionPool<PgConnector> {
    ConnectionPool::new(
        settings,
        PgConnector::new().with_application_name(APPLICATION_NAME),
    )
}

fn run_check(config: &Path) -> anyhow::Result<()> {
    let settings = load_settings(config)?;
    info!(
        host = %settings.database.host,
        port = settings.database.port,
        database = %settings.database.database,
        "checking database connectivity"
    );

    let stats = Worker::new(0)?.run(new_pool(settings), |pool| async move {
        let mut conn = pool.acquire(DatabaseType::Postgres).await?;
        let rows = conn.query("SELECT 1", &[]).await;
        match rows {
            Ok(_) => pool.release(conn)?,
            Err(e) => {
                pool.discard(conn)?;
                return Err(PoolError::from(e));
            }
        }
        Ok::<PoolStats, PoolError>(pool.stats())
    })??;

    println!(
        "ok: {} connection(s) opened, {} idle",
        stats.created, stats.idle
    );
    Ok(())
}

fn run_bench(config: &Path, workers: usize, options: RunOptions, json: bool) -> anyhow::Result<()> {
    let settings = load_settings(config)?;
    info!(
        workers = workers,
        concurrency = options.concurrency,
        requests = options.requests,
        query = ?options.query,
        "starting benchmark"
    );

    let started = Instant::now();
    let handles = spawn_workers(workers, move |worker| {
        let index = worker.index();
        let pool = new_pool(settings.clone());
        worker.run(pool, move |pool| drive_worker(index, pool, options))
    })?;
    let reports = join_workers(handles)?;
    let elapsed = started.elapsed();

    let requests: usize = reports.iter().map(|r| r.requests).sum();
    let errors: usize = reports.iter().map(|r| r.errors).sum();
    let report = BenchReport {
        workers: reports,
        requests,
        errors,
        elapsed_ms: elapsed.as_millis(),
        requests_per_sec: requests as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if report.errors > 0 {
        warn!(errors = report.errors, "benchmark finished with errors");
    }
    Ok(())
}

/// Run `options.requests` requests on this worker split across
/// `options.concurrency` handler tasks.
async fn drive_worker(
    index: usize,
    pool: Rc<ConnectionPool<PgConnector>>,
    options: RunOptions,
) -> WorkerReport {
    let started = Instant::now();
    let per_handler = options.requests / options.concurrency;
    let remainder = options.requests % options.concurrency;

    let handlers: Vec<_> = (0..options.concurrency)
        .map(|n| {
            let pool = Rc::clone(&pool);
            let count = per_handler + usize::from(n < remainder);
            tokio::task::spawn_local(handler(pool, count, n, options))
        })
        .collect();

    let mut errors = 0;
    let mut rows = 0;
    for handle in handlers {
        match handle.await {
            Ok(outcome) => {
                errors += outcome.errors;
                rows += outcome.rows;
            }
            Err(e) => {
                warn!(worker = index, error = %e, "handler task failed");
                errors += 1;
            }
        }
    }

    let stats = pool.stats();
    WorkerReport {
        worker: index,
        requests: options.requests,
        errors,
        rows,
        elapsed_ms: started.elapsed().as_millis(),
        created: stats.created,
        reused: stats.reused,
        wait_count: stats.wait_count,
    }
}

#[derive(Default)]
struct HandlerOutcome {
    errors: usize,
    rows: u64,
}

async fn handler(
    pool: Rc<ConnectionPool<PgConnector>>,
    count: usize,
    seed: usize,
    options: RunOptions,
) -> HandlerOutcome {
    let mut outcome = HandlerOutcome::default();
    for request in 0..count {
        match one_request(&pool, options, seed + request).await {
            Ok(rows) => outcome.rows += rows,
            Err(e) => {
                warn!(error = %e, "request failed");
                outcome.errors += 1;
                // Back off so a down database does not spin the worker.
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    outcome
}

async fn one_request(
    pool: &ConnectionPool<PgConnector>,
    options: RunOptions,
    n: usize,
) -> Result<u64, PoolError> {
    let mut conn = pool.acquire(DatabaseType::Postgres).await?;

    let result = match options.query {
        Workload::Limit => {
            let params: [&(dyn ToSql + Sync); 1] = [&options.limit];
            conn.query(USERS_LIMIT, &params).await
        }
        Workload::All => conn.query(USERS_ALL, &[]).await,
        Workload::Update => {
            let id = (n % 1000 + 1) as i32;
            let first_name = format!("first-{n}");
            let last_name = format!("last-{n}");
            let params: [&(dyn ToSql + Sync); 3] = [&first_name, &last_name, &id];
            conn.query(USERS_UPDATE, &params).await
        }
    };

    match result {
        Ok(rows) => {
            pool.release(conn)?;
            Ok(rows.len() as u64)
        }
        Err(e) => {
            pool.discard(conn)?;
            Err(e.into())
        }
    }
}

fn print_report(report: &BenchReport) {
    println!(
        "{:<8} {:>10} {:>8} {:>10} {:>10} {:>8} {:>8} {:>6}",
        "WORKER", "REQUESTS", "ERRORS", "ROWS", "ELAPSED", "CREATED", "REUSED", "WAITS"
    );
    for w in &report.workers {
        println!(
            "{:<8} {:>10} {:>8} {:>10} {:>8}ms {:>8} {:>8} {:>6}",
            w.worker, w.requests, w.errors, w.rows, w.elapsed_ms, w.created, w.reused, w.wait_count
        );
    }
    println!();
    println!(
        "total: {} requests, {} errors in {}ms ({:.1} req/s)",
        report.requests, report.errors, report.elapsed_ms, report.requests_per_sec
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_defaults() {
        let cli = Cli::try_parse_from(["dbpool-bench", "run"]).unwrap();
        match cli.command {
            Command::Run {
                config,
                workers,
                concurrency,
                requests,
                query,
                limit,
                json,
            } => {
                assert_eq!(config, PathBuf::from("dbpool.toml"));
                assert_eq!(workers, 4);
                assert_eq!(concurrency, 16);
                assert_eq!(requests, 1000);
                assert!(matches!(query, Workload::Limit));
                assert_eq!(limit, 10);
                assert!(!json);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn cli_parses_update_workload() {
        let cli = Cli::try_parse_from([
            "dbpool-bench",
            "run",
            "--query",
            "update",
            "--workers",
            "2",
            "--json",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Run {
                query: Workload::Update,
                workers: 2,
                json: true,
                ..
            }
        ));
    }

    #[test]
    fn cli_parses_check() {
        let cli = Cli::try_parse_from(["dbpool-bench", "check", "--config", "/etc/dbpool.toml"]).unwrap();
        assert!(matches!(cli.command, Command::Check { config } if config == Path::new("/etc/dbpool.toml")));
    }

    #[test]
    fn report_serializes_totals() {
        let report = BenchReport {
            workers: vec![],
            requests: 10,
            errors: 1,
            elapsed_ms: 5,
            requests_per_sec: 2000.0,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["requests"], 10);
        assert_eq!(json["errors"], 1);
    }
}
