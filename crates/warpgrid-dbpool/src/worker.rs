//! Cooperative worker hosting.
//!
//! Each worker is one OS thread running a Tokio `current_thread` runtime and
//! a `LocalSet`. The worker builds its own [`ConnectionPool`], runs the
//! startup hook (host resolution), then drives the caller's body, which
//! spawns handler tasks with `tokio::task::spawn_local` and shares the pool
//! with them through an `Rc`.
//!
//! Pools are never shared between workers.

use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::runtime::Runtime;
use tokio::task::LocalSet;

use crate::connection::Connector;
use crate::error::WorkerError;
use crate::pool::ConnectionPool;
use crate::resolve::Resolve;

/// A single-threaded cooperative scheduler.
pub struct Worker {
    index: usize,
    runtime: Runtime,
    local: LocalSet,
}

impl Worker {
    /// Build the runtime for worker `index` on the current thread.
    pub fn new(index: usize) -> Result<Self, WorkerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            index,
            runtime,
            local: LocalSet::new(),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Run `body` with `pool` after the startup hook has resolved the host.
    ///
    /// The pool is logged and dropped when `body` completes. A startup hook
    /// failure ends the worker before any handler runs.
    pub fn run<C, R, F, Fut, T>(self, pool: ConnectionPool<C, R>, body: F) -> Result<T, WorkerError>
    where
        C: Connector,
        R: Resolve,
        F: FnOnce(Rc<ConnectionPool<C, R>>) -> Fut,
        Fut: Future<Output = T>,
    {
        let index = self.index;
        let span = tracing::info_span!("worker", index = index);
        let _entered = span.enter();

        self.local.block_on(&self.runtime, async move {
            let pool = Rc::new(pool);

            let addr = pool.resolve_host().await?;
            tracing::info!(addr = %addr, "worker started");

            let output = body(Rc::clone(&pool)).await;

            pool.log_stats();
            tracing::info!("worker stopped");
            Ok::<T, WorkerError>(output)
        })
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// Start `count` worker threads, each calling `worker_main` with its own
/// [`Worker`]. `worker_main` is expected to build that worker's pool and
/// call [`Worker::run`].
pub fn spawn_workers<F, T>(
    count: usize,
    worker_main: F,
) -> Result<Vec<JoinHandle<Result<T, WorkerError>>>, WorkerError>
where
    F: Fn(Worker) -> Result<T, WorkerError> + Send + Sync + 'static,
    T: Send + 'static,
{
    let worker_main = Arc::new(worker_main);
    (0..count)
        .map(|index| {
            let worker_main = Arc::clone(&worker_main);
            std::thread::Builder::new()
                .name(format!("dbpool-worker-{index}"))
                .spawn(move || worker_main(Worker::new(index)?))
                .map_err(WorkerError::Runtime)
        })
        .collect()
}

/// Join workers started by [`spawn_workers`], returning their outputs in
/// worker order. The first failure wins.
pub fn join_workers<T>(
    handles: Vec<JoinHandle<Result<T, WorkerError>>>,
) -> Result<Vec<T>, WorkerError> {
    handles
        .into_iter()
        .enumerate()
        .map(|(index, handle)| handle.join().map_err(|_| WorkerError::Panicked(index))?)
        .collect()
}
