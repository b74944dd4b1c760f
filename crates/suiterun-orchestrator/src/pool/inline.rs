//! Pool that runs every invocation on the orchestrator's own runtime.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::error;

use suiterun_core::ResolvedConfig;
use suiterun_proto::OrchestratorHandler;
use suiterun_worker::{Worker, WorkerEnv};

use super::{execute, panic_message, InvocationKind, Invoker, Job, WorkerPool};
use crate::error::PoolError;

/// Single execution context living in the main process.
///
/// All files of a request share one invocation, so isolation is not
/// available here.
pub struct InlinePool {
    worker: Arc<Mutex<Worker>>,
    invoker: Invoker,
    closed: AtomicBool,
}

impl InlinePool {
    pub fn new(
        config: Arc<ResolvedConfig>,
        env: WorkerEnv,
        handler: Arc<dyn OrchestratorHandler>,
    ) -> Self {
        Self {
            worker: Arc::new(Mutex::new(Worker::new(env))),
            invoker: Invoker::new(config, handler),
            closed: AtomicBool::new(false),
        }
    }

    fn submit(&self, job: Job) -> Result<(), PoolError> {
        let worker = Arc::clone(&self.worker);
        tokio::spawn(async move {
            let Job { kind, ctx, reply } = job;
            let worker = worker.lock().await;
            match AssertUnwindSafe(execute(&worker, kind, ctx))
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
                        "Inline execution context crashed"
                    );
                }
            }
        });
        Ok(())
    }

    async fn invoke(
        &self,
        kind: InvocationKind,
        files: &[PathBuf],
        invalidates: &[String],
    ) -> Result<(), PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }
        self.invoker
            .invoke(
                kind,
                files.to_vec(),
                invalidates,
                |job| self.submit(job),
                || self.closed.load(Ordering::SeqCst),
            )
            .await
    }
}

#[async_trait]
impl WorkerPool for InlinePool {
    async fn run_tests(&self, files: &[PathBuf], invalidates: &[String]) -> Result<(), PoolError> {
        self.invoke(InvocationKind::Run, files, invalidates).await
    }

    async fn collect_tests(
        &self,
        files: &[PathBuf],
        invalidates: &[String],
    ) -> Result<(), PoolError> {
        self.invoke(InvocationKind::Collect, files, invalidates).await
    }

    async fn close(&self) -> Result<(), PoolError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
