//! Entry points of an execution context.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use suiterun_core::{ResolvedConfig, RunId, WorkerId};
use suiterun_proto::{connect, Port, WorkerNotification, WorkerRpc};

use crate::collect::collect_file;
use crate::env::WorkerEnv;
use crate::error::WorkerError;
use crate::mocks::MockRegistry;
use crate::module::{ModuleCache, ModuleLoader};
use crate::runner::start_tests;

/// Everything one invocation needs. Built by the pool for each
/// invocation and consumed by it.
#[derive(Debug)]
pub struct WorkerContext {
    /// Worker end of the invocation's private bridge.
    pub port: Port,
    pub config: Arc<ResolvedConfig>,
    pub files: Vec<PathBuf>,
    /// Module ids whose cached entries must be dropped first.
    pub invalidates: Vec<String>,
    pub run_id: RunId,
}

/// One execution context.
///
/// State that outlives a single invocation (module cache, mocks) lives
/// here, so a context reused by the pool keeps it between files.
pub struct Worker {
    id: WorkerId,
    env: WorkerEnv,
    cache: ModuleCache,
    mocks: MockRegistry,
}

impl Worker {
    pub fn new(env: WorkerEnv) -> Self {
        Self {
            id: WorkerId::generate(),
            env,
            cache: ModuleCache::new(),
            mocks: MockRegistry::new(),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn cache(&self) -> &ModuleCache {
        &self.cache
    }

    pub fn mocks(&self) -> &MockRegistry {
        &self.mocks
    }

    fn open(&self, port: Port, invalidates: &[String]) -> (WorkerRpc, ModuleLoader) {
        let evicted = self.cache.invalidate(invalidates.iter().map(String::as_str));
        if evicted > 0 {
            debug!(worker_id = %self.id, evicted, "Invalidated cached modules");
        }
        let rpc = connect(port);
        let loader = ModuleLoader::new(rpc.clone(), self.cache.clone());
        (rpc, loader)
    }

    /// Collect the files of `ctx` and report their trees.
    pub async fn collect(&self, ctx: WorkerContext) -> Result<(), WorkerError> {
        let WorkerContext {
            port,
            config,
            files,
            invalidates,
            run_id,
        } = ctx;
        info!(worker_id = %self.id, run_id = %run_id, files = files.len(), "Collecting");

        let (rpc, loader) = self.open(port, &invalidates);
        let mut trees = Vec::with_capacity(files.len());
        for file in &files {
            let collected = collect_file(&config, file, self.env.collector.as_ref(), &loader).await;
            trees.push(collected.tree);
        }
        rpc.notify(WorkerNotification::OnCollected { files: trees })?;
        Ok(())
    }

    /// Collect and run the files of `ctx`, streaming results.
    pub async fn run(&self, ctx: WorkerContext) -> Result<(), WorkerError> {
        let WorkerContext {
            port,
            config,
            files,
            invalidates,
            run_id,
        } = ctx;
        info!(worker_id = %self.id, run_id = %run_id, files = files.len(), "Running");

        let (rpc, loader) = self.open(port, &invalidates);
        start_tests(&files, &config, &rpc, &self.env, &loader, &self.mocks).await?;
        Ok(())
    }
}
