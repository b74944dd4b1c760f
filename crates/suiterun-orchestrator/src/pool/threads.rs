//! Pool of OS-thread execution contexts.
//!
//! Each context is a dedicated thread with its own current-thread runtime
//! and its own [`Worker`], so module caches and mocks never leak between
//! contexts. Contexts pull jobs from one shared queue. The pool keeps
//! `min_threads` contexts warm and grows up to `max_threads` while jobs
//! wait for an idle context. An isolated pool retires a context after each
//! job; a crashed context is always retired. Retired contexts are replaced
//! while the pool is open.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use suiterun_core::ResolvedConfig;
use suiterun_proto::OrchestratorHandler;
use suiterun_worker::{Worker, WorkerEnv};

use super::{execute, panic_message, InvocationKind, Invoker, Job, PoolOptions, WorkerPool};
use crate::error::PoolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextExit {
    /// The pool is closing.
    Closed,
    /// Isolated context finished its job.
    Retired,
    Crashed,
}

struct Shared {
    env: WorkerEnv,
    options: PoolOptions,
    queue: Mutex<mpsc::UnboundedReceiver<Job>>,
    live: AtomicUsize,
    idle: AtomicUsize,
    queued: AtomicUsize,
    spawned: AtomicUsize,
    cancel: CancellationToken,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start one more context unless the pool is at capacity.
    fn spawn_context(self: &Arc<Self>) -> Result<bool, PoolError> {
        let max = self.options.max_threads;
        if self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .is_err()
        {
            return Ok(false);
        }
        // A starting context counts as idle until it takes its first job.
        self.idle.fetch_add(1, Ordering::SeqCst);

        let n = self.spawned.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("suiterun-worker-{n}"))
            .spawn(move || context_main(shared));

        match spawned {
            Ok(handle) => {
                let mut handles = self.handles();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                Ok(true)
            }
            Err(e) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                self.idle.fetch_sub(1, Ordering::SeqCst);
                Err(PoolError::Spawn(e))
            }
        }
    }

    /// Grow while jobs outnumber idle contexts or the pool is below its floor.
    fn replenish(self: &Arc<Self>) -> Result<(), PoolError> {
        while !self.cancel.is_cancelled() {
            let below_min = self.live.load(Ordering::SeqCst) < self.options.min_threads;
            let backlog =
                self.queued.load(Ordering::SeqCst) > self.idle.load(Ordering::SeqCst);
            if !(below_min || backlog) || !self.spawn_context()? {
                break;
            }
        }
        Ok(())
    }
}

fn context_main(shared: Arc<Shared>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start execution context runtime");
            shared.live.fetch_sub(1, Ordering::SeqCst);
            shared.idle.fetch_sub(1, Ordering::SeqCst);
            return;
        }
    };

    let worker = Worker::new(shared.env.clone());
    debug!(worker_id = %worker.id(), "Execution context started");
    let exit = runtime.block_on(process_jobs(&shared, &worker));
    // Tasks left behind by a crashed invocation die with the runtime.
    drop(runtime);
    debug!(worker_id = %worker.id(), exit = ?exit, "Execution context stopped");

    shared.live.fetch_sub(1, Ordering::SeqCst);
    if exit != ContextExit::Closed {
        if let Err(e) = shared.replenish() {
            warn!(error = %e, "Failed to replace execution context");
        }
    }
}

async fn process_jobs(shared: &Shared, worker: &Worker) -> ContextExit {
    loop {
        let job = tokio::select! {
            _ = shared.cancel.cancelled() => None,
            job = async { shared.queue.lock().await.recv().await } => job,
        };
        shared.idle.fetch_sub(1, Ordering::SeqCst);

        let Some(Job { kind, ctx, reply }) = job else {
            return ContextExit::Closed;
        };
        shared.queued.fetch_sub(1, Ordering::SeqCst);

        match AssertUnwindSafe(execute(worker, kind, ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => {
                let _ = reply.send(result.map_err(|e| e.to_string()));
            }
            Err(panic) => {
                error!(
                    worker_id = %worker.id(),
                    panic = %panic_message(panic.as_ref()),
                    "Execution context crashed"
                );
                return ContextExit::Crashed;
            }
        }

        if shared.options.isolate {
            return ContextExit::Retired;
        }
        shared.idle.fetch_add(1, Ordering::SeqCst);
    }
}

/// Threaded pool. Every file is its own invocation.
pub struct ThreadPool {
    shared: Arc<Shared>,
    jobs: StdMutex<Option<mpsc::UnboundedSender<Job>>>,
    invoker: Invoker,
    closed: AtomicBool,
}

impl ThreadPool {
    /// Start the pool with `options.min_threads` warm contexts.
    pub fn new(
        config: Arc<ResolvedConfig>,
        env: WorkerEnv,
        handler: Arc<dyn OrchestratorHandler>,
        options: PoolOptions,
    ) -> Result<Self, PoolError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            env,
            options,
            queue: Mutex::new(rx),
            live: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            spawned: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            handles: StdMutex::new(Vec::new()),
        });
        shared.replenish()?;
        info!(
            contexts = shared.live.load(Ordering::SeqCst),
            max_threads = options.max_threads,
            "Thread pool started"
        );

        Ok(Self {
            shared,
            jobs: StdMutex::new(Some(tx)),
            invoker: Invoker::new(config, handler),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of execution contexts currently alive.
    pub fn live_contexts(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> PoolOptions {
        self.shared.options
    }

    fn submit(&self, job: Job) -> Result<(), PoolError> {
        {
            let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(tx) = jobs.as_ref() else {
                return Err(PoolError::Closed);
            };
            self.shared.queued.fetch_add(1, Ordering::SeqCst);
            if tx.send(job).is_err() {
                self.shared.queued.fetch_sub(1, Ordering::SeqCst);
                return Err(PoolError::Closed);
            }
        }

        if let Err(e) = self.shared.replenish() {
            if self.live_contexts() == 0 {
                return Err(e);
            }
            warn!(error = %e, "Failed to grow thread pool");
        }
        Ok(())
    }

    async fn fan_out(
        &self,
        kind: InvocationKind,
        files: &[PathBuf],
        invalidates: &[String],
    ) -> Result<(), PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }
        let invocations = files.iter().map(|file| {
            self.invoker.invoke(
                kind,
                vec![file.clone()],
                invalidates,
                |job| self.submit(job),
                || self.closed.load(Ordering::SeqCst),
            )
        });
        join_all(invocations).await.into_iter().collect()
    }
}

#[async_trait]
impl WorkerPool for ThreadPool {
    async fn run_tests(&self, files: &[PathBuf], invalidates: &[String]) -> Result<(), PoolError> {
        self.fan_out(InvocationKind::Run, files, invalidates).await
    }

    async fn collect_tests(
        &self,
        files: &[PathBuf],
        invalidates: &[String],
    ) -> Result<(), PoolError> {
        self.fan_out(InvocationKind::Collect, files, invalidates).await
    }

    async fn close(&self) -> Result<(), PoolError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.cancel.cancel();
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        // Jobs nobody will pick up resolve their invocations as canceled.
        {
            let mut queue = self.shared.queue.lock().await;
            queue.close();
            while queue.try_recv().is_ok() {
                self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            }
        }

        let shared = Arc::clone(&self.shared);
        let panicked = tokio::task::spawn_blocking(move || {
            let mut panicked = 0;
            loop {
                let handles = std::mem::take(&mut *shared.handles());
                if handles.is_empty() {
                    break panicked;
                }
                for handle in handles {
                    if handle.join().is_err() {
                        panicked += 1;
                    }
                }
            }
        })
        .await
        .map_err(|e| PoolError::Worker(e.to_string()))?;

        if panicked > 0 {
            warn!(panicked, "Execution context threads panicked");
        }
        info!("Thread pool closed");
        Ok(())
    }
}
