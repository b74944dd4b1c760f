//! Worker pools.
//!
//! A pool turns `run`/`collect` requests into invocations. Each invocation
//! gets a private bridge: the orchestrator end is served by [`RpcService`]
//! for exactly as long as the invocation lasts, the worker end travels to
//! an execution context inside a [`WorkerContext`].
//!
//! [`RpcService`]: crate::service::RpcService

mod inline;
mod threads;

pub use inline::InlinePool;
pub use threads::ThreadPool;

use std::any::Any;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use suiterun_core::{ResolvedConfig, RunId};
use suiterun_proto::{channel, notify_worker_exit, serve, OrchestratorHandler};
use suiterun_worker::{Worker, WorkerContext, WorkerEnv, WorkerError};

use crate::error::PoolError;

/// Executes test files in execution contexts.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Collect and run `files`. Resolves once every invocation finished.
    async fn run_tests(&self, files: &[PathBuf], invalidates: &[String]) -> Result<(), PoolError>;

    /// Collect `files` without running them.
    async fn collect_tests(
        &self,
        files: &[PathBuf],
        invalidates: &[String],
    ) -> Result<(), PoolError>;

    /// Stop every execution context. Pending invocations are canceled.
    async fn close(&self) -> Result<(), PoolError>;
}

/// What an invocation asks the worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    Run,
    Collect,
}

/// Sizing of a threaded pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    pub max_threads: usize,
    pub min_threads: usize,
    /// Retire a context after every invocation.
    pub isolate: bool,
}

impl PoolOptions {
    /// Defaults to one context per available core, half of them kept warm.
    pub fn from_config(config: &ResolvedConfig) -> Self {
        let cores = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        let max_threads = config.max_threads.unwrap_or(cores).max(1);
        let min_threads = config
            .min_threads
            .unwrap_or(max_threads / 2)
            .clamp(1, max_threads);
        Self {
            max_threads,
            min_threads,
            isolate: config.isolate,
        }
    }
}

/// Build the pool selected by `config.threads`.
pub fn create_pool(
    config: Arc<ResolvedConfig>,
    env: WorkerEnv,
    handler: Arc<dyn OrchestratorHandler>,
) -> Result<Arc<dyn WorkerPool>, PoolError> {
    if config.threads {
        let options = PoolOptions::from_config(&config);
        debug!(
            max_threads = options.max_threads,
            min_threads = options.min_threads,
            isolate = options.isolate,
            "Creating threaded pool"
        );
        Ok(Arc::new(ThreadPool::new(config, env, handler, options)?))
    } else {
        debug!("Creating inline pool");
        Ok(Arc::new(InlinePool::new(config, env, handler)))
    }
}

/// Reply of an execution context. Dropped without a value when the
/// context crashed.
pub(crate) type Reply = oneshot::Sender<Result<(), String>>;

/// One invocation queued for an execution context.
pub(crate) struct Job {
    pub kind: InvocationKind,
    pub ctx: WorkerContext,
    pub reply: Reply,
}

pub(crate) async fn execute(
    worker: &Worker,
    kind: InvocationKind,
    ctx: WorkerContext,
) -> Result<(), WorkerError> {
    match kind {
        InvocationKind::Run => worker.run(ctx).await,
        InvocationKind::Collect => worker.collect(ctx).await,
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "execution context panicked".to_string()
    }
}

/// Bridge plumbing shared by every pool.
#[derive(Clone)]
pub(crate) struct Invoker {
    config: Arc<ResolvedConfig>,
    handler: Arc<dyn OrchestratorHandler>,
}

impl Invoker {
    pub fn new(config: Arc<ResolvedConfig>, handler: Arc<dyn OrchestratorHandler>) -> Self {
        Self { config, handler }
    }

    /// Open a bridge, hand the job to `submit` and serve the bridge until
    /// the context replies.
    ///
    /// A context that drops its reply crashed: the orchestrator is told
    /// through `onWorkerExit` unless `closed` reports the pool was shut
    /// down underneath it.
    pub async fn invoke<S, C>(
        &self,
        kind: InvocationKind,
        files: Vec<PathBuf>,
        invalidates: &[String],
        submit: S,
        closed: C,
    ) -> Result<(), PoolError>
    where
        S: FnOnce(Job) -> Result<(), PoolError>,
        C: Fn() -> bool,
    {
        let (worker_port, orchestrator_port) = channel();
        let crash = worker_port.sender();
        let (stop, shutdown) = oneshot::channel();
        let server = tokio::spawn(serve(
            orchestrator_port,
            Arc::clone(&self.handler),
            shutdown,
        ));

        let run_id = RunId::generate();
        debug!(run_id = %run_id, kind = ?kind, files = files.len(), "Starting invocation");
        let (reply, done) = oneshot::channel();
        let job = Job {
            kind,
            ctx: WorkerContext {
                port: worker_port,
                config: Arc::clone(&self.config),
                files,
                invalidates: invalidates.to_vec(),
                run_id: run_id.clone(),
            },
            reply,
        };

        let result = match submit(job) {
            Err(e) => Err(e),
            Ok(()) => match done.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(message)) => {
                    warn!(run_id = %run_id, error = %message, "Invocation failed");
                    Err(PoolError::Worker(message))
                }
                Err(_) if closed() => Err(PoolError::Canceled),
                Err(_) => {
                    error!(run_id = %run_id, "Execution context terminated during invocation");
                    if let Err(e) = notify_worker_exit(&crash, 1) {
                        warn!(error = %e, "Failed to report worker exit");
                    }
                    Err(PoolError::Worker("execution context terminated".to_string()))
                }
            },
        };

        drop(crash);
        let _ = stop.send(());
        if let Err(e) = server.await {
            warn!(run_id = %run_id, error = %e, "Bridge server task failed");
        }
        result
    }
}
