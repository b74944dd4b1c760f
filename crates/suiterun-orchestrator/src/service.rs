//! Orchestrator side of every worker bridge.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info};

use suiterun_core::{FileTree, SnapshotResult, TaskPack, UserConsoleLog};
use suiterun_proto::{
    CoverageReport, FetchResult, HandlerError, OrchestratorHandler, ResolveResult, SourceMap,
};

use crate::modules::ModuleServer;
use crate::reporter::Reporter;
use crate::state::StateManager;

/// Handles the methods a worker calls on the main process.
///
/// Every notification is merged into [`StateManager`] first and only then
/// forwarded to the reporters, so a reporter always observes merged state.
#[derive(Clone)]
pub struct RpcService {
    state: Arc<StateManager>,
    reporters: Arc<Vec<Arc<dyn Reporter>>>,
    modules: Arc<dyn ModuleServer>,
    /// Exit code of the first execution context that died.
    fatal: Arc<watch::Sender<Option<i32>>>,
}

impl RpcService {
    pub fn new(
        state: Arc<StateManager>,
        reporters: Vec<Arc<dyn Reporter>>,
        modules: Arc<dyn ModuleServer>,
    ) -> Self {
        let (fatal, _) = watch::channel(None);
        Self {
            state,
            reporters: Arc::new(reporters),
            modules,
            fatal: Arc::new(fatal),
        }
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    /// Observe worker exits. Holds `Some(code)` once any context died.
    pub fn fatal_signal(&self) -> watch::Receiver<Option<i32>> {
        self.fatal.subscribe()
    }

    /// Exit code recorded by the first unexpected worker exit.
    pub fn fatal_code(&self) -> Option<i32> {
        *self.fatal.borrow()
    }

    /// Clear a recorded exit before a new run.
    pub fn reset_fatal(&self) {
        self.fatal.send_replace(None);
    }
}

#[async_trait]
impl OrchestratorHandler for RpcService {
    async fn on_collected(&self, files: Vec<FileTree>) -> Result<(), HandlerError> {
        self.state.collect_files(&files).await;
        for reporter in self.reporters.iter() {
            reporter.on_collected(&files).await;
        }
        Ok(())
    }

    async fn on_task_update(&self, packs: Vec<TaskPack>) -> Result<(), HandlerError> {
        self.state.update_tasks(&packs).await;
        for reporter in self.reporters.iter() {
            reporter.on_task_update(&packs).await;
        }
        Ok(())
    }

    async fn on_user_console_log(&self, log: UserConsoleLog) -> Result<(), HandlerError> {
        self.state.update_user_log(log.clone()).await;
        for reporter in self.reporters.iter() {
            reporter.on_user_console_log(&log).await;
        }
        Ok(())
    }

    async fn on_finished(&self, files: Vec<FileTree>) -> Result<(), HandlerError> {
        self.state.finish_files(&files).await;
        for reporter in self.reporters.iter() {
            reporter.on_finished(&files).await;
        }
        Ok(())
    }

    async fn snapshot_saved(&self, snapshot: SnapshotResult) -> Result<(), HandlerError> {
        debug!(file = %snapshot.filepath.display(), "Snapshot saved");
        self.state.add_snapshot(&snapshot).await;
        Ok(())
    }

    async fn coverage_collected(&self, coverage: CoverageReport) -> Result<(), HandlerError> {
        self.state.add_coverage(coverage.payload).await;
        Ok(())
    }

    async fn on_worker_exit(&self, code: i32) -> Result<(), HandlerError> {
        // A context never exits on purpose, so a clean status still fails the run.
        let code = if code == 0 { 1 } else { code };
        error!(code, "Execution context exited unexpectedly");
        self.fatal.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(code);
                true
            } else {
                false
            }
        });
        Ok(())
    }

    async fn fetch(&self, id: String) -> Result<FetchResult, HandlerError> {
        self.modules.fetch(&id).await
    }

    async fn resolve_id(
        &self,
        id: String,
        importer: Option<String>,
    ) -> Result<Option<ResolveResult>, HandlerError> {
        self.modules.resolve_id(&id, importer.as_deref()).await
    }

    async fn get_source_map(
        &self,
        id: String,
        force: bool,
    ) -> Result<Option<SourceMap>, HandlerError> {
        if force {
            info!(module = %id, "Invalidating module before source map lookup");
            self.modules.invalidate(&id).await;
        }
        self.modules.source_map(&id).await
    }
}
