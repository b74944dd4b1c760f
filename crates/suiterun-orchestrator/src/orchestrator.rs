//! Top-level driver of a test run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{error, info};

use suiterun_core::{FileTree, ResolvedConfig};
use suiterun_worker::WorkerEnv;

use crate::error::OrchestratorError;
use crate::modules::ModuleServer;
use crate::pool::{create_pool, WorkerPool};
use crate::reporter::Reporter;
use crate::service::RpcService;
use crate::state::StateManager;
use crate::summary::RunSummary;

/// Owns the pool and the orchestrator end of every bridge.
pub struct Orchestrator {
    config: Arc<ResolvedConfig>,
    service: RpcService,
    pool: Arc<dyn WorkerPool>,
}

impl Orchestrator {
    pub fn new(
        config: ResolvedConfig,
        env: WorkerEnv,
        modules: Arc<dyn ModuleServer>,
        reporters: Vec<Arc<dyn Reporter>>,
    ) -> Result<Self, OrchestratorError> {
        let config = Arc::new(config);
        let service = RpcService::new(Arc::new(StateManager::new()), reporters, modules);
        let pool = create_pool(Arc::clone(&config), env, Arc::new(service.clone()))?;
        Ok(Self {
            config,
            service,
            pool,
        })
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Merged state of every file seen so far.
    pub fn state(&self) -> &Arc<StateManager> {
        self.service.state()
    }

    /// Fires with the exit code of the first context that dies.
    pub fn fatal_signal(&self) -> watch::Receiver<Option<i32>> {
        self.service.fatal_signal()
    }

    /// Collect `files` without running them.
    pub async fn collect(&self, files: &[PathBuf]) -> Result<Vec<FileTree>, OrchestratorError> {
        self.service.reset_fatal();
        let result = self.pool.collect_tests(files, &[]).await;
        self.check_fatal()?;
        result?;

        let mut trees = Vec::with_capacity(files.len());
        for file in files {
            if let Some(tree) = self.state().file(file).await {
                trees.push(tree);
            }
        }
        Ok(trees)
    }

    /// Run `files`. A context evicts `invalidates` from its module cache
    /// before each invocation it picks up, so contexts left idle by this run
    /// keep their cached copies until their next job.
    pub async fn run(
        &self,
        files: &[PathBuf],
        invalidates: &[String],
    ) -> Result<RunSummary, OrchestratorError> {
        let started = Instant::now();
        self.service.reset_fatal();
        self.state().reset_run().await;
        info!(files = files.len(), threads = self.config.threads, "Starting run");

        let result = self.pool.run_tests(files, invalidates).await;
        self.check_fatal()?;
        result?;

        let summary = self.state().summary(files).await;
        info!(
            total = summary.total,
            passed = summary.passed,
            failed = summary.failed,
            duration_ms = started.elapsed().as_millis() as u64,
            "Run finished"
        );
        Ok(summary)
    }

    /// Release every execution context.
    pub async fn close(&self) -> Result<(), OrchestratorError> {
        self.pool.close().await?;
        Ok(())
    }

    fn check_fatal(&self) -> Result<(), OrchestratorError> {
        match self.service.fatal_code() {
            Some(code) => {
                error!(code, "Run aborted by worker exit");
                Err(OrchestratorError::WorkerExited { code })
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use suiterun_core::{SnapshotResult, TaskPack, TaskState};
    use suiterun_proto::{FetchResult, HandlerError, ResolveResult, SourceMap};
    use suiterun_worker::{
        AssertionError, BoxError, Collector, ModuleLoader, SnapshotClient, SuiteBuilder,
        TaskOptions, TestContext,
    };

    use crate::pool::{PoolOptions, ThreadPool};
    use crate::reporter::LogReporter;

    struct StubModules;

    #[async_trait]
    impl ModuleServer for StubModules {
        async fn fetch(&self, id: &str) -> Result<FetchResult, HandlerError> {
            Ok(FetchResult::inline(format!("// {id}")))
        }

        async fn resolve_id(
            &self,
            id: &str,
            _importer: Option<&str>,
        ) -> Result<Option<ResolveResult>, HandlerError> {
            Ok(Some(ResolveResult::new(id)))
        }

        async fn source_map(&self, _id: &str) -> Result<Option<SourceMap>, HandlerError> {
            Ok(None)
        }

        async fn invalidate(&self, _id: &str) {}
    }

    /// Every file loads itself through the bridge and declares one passing
    /// test, one failing test and one skipped test.
    struct ThreeTests;

    #[async_trait]
    impl Collector for ThreeTests {
        async fn collect(
            &self,
            file: &Path,
            suite: &mut SuiteBuilder<'_>,
            loader: &ModuleLoader,
        ) -> Result<(), BoxError> {
            loader.load(&file.to_string_lossy()).await?;
            suite
                .test("passes", |ctx| async move {
                    ctx.log("hello");
                    ctx.assert_eq(2 + 2, 4)?;
                    Ok(())
                })
                .test("fails", |ctx| async move {
                    ctx.assert_eq(1, 2)?;
                    Ok(())
                })
                .test_with("skipped", TaskOptions::skip(), |_| async { Ok(()) });
            Ok(())
        }
    }

    /// Records every pack the orchestrator forwards.
    #[derive(Default)]
    struct Recorder {
        packs: Mutex<Vec<TaskPack>>,
        finished: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl Reporter for Recorder {
        async fn on_task_update(&self, packs: &[TaskPack]) {
            self.packs.lock().unwrap().extend_from_slice(packs);
        }

        async fn on_finished(&self, files: &[FileTree]) {
            let mut finished = self.finished.lock().unwrap();
            finished.extend(files.iter().map(|f| f.filepath().to_path_buf()));
        }
    }

    struct CrashingSnapshots;

    #[async_trait]
    impl SnapshotClient for CrashingSnapshots {
        fn check(&self, _test: &TestContext, _received: &str) -> Result<(), AssertionError> {
            Ok(())
        }

        async fn save(&self, _file: &Path) -> Option<SnapshotResult> {
            panic!("snapshot store unavailable");
        }
    }

    fn files(n: usize) -> Vec<PathBuf> {
        (0..n)
            .map(|i| PathBuf::from(format!("/repo/file{i}.test")))
            .collect()
    }

    fn config() -> ResolvedConfig {
        ResolvedConfig::default()
            .with_root("/repo")
            .with_thread_limits(Some(1), Some(2))
    }

    #[tokio::test]
    async fn test_pooled_run_of_three_files() {
        crate::telemetry::init_for_tests();
        let recorder = Arc::new(Recorder::default());
        let orchestrator = Orchestrator::new(
            config(),
            WorkerEnv::new(Arc::new(ThreeTests)),
            Arc::new(StubModules),
            vec![recorder.clone() as Arc<dyn Reporter>, Arc::new(LogReporter) as Arc<dyn Reporter>],
        )
        .unwrap();

        let files = files(3);
        let summary = orchestrator.run(&files, &[]).await.unwrap();

        assert_eq!(summary.files, 3);
        assert_eq!(summary.total, 9);
        assert_eq!(summary.passed, 3);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.exit_code(), 1);

        let finished: HashSet<PathBuf> =
            recorder.finished.lock().unwrap().iter().cloned().collect();
        assert_eq!(finished, files.iter().cloned().collect());
        assert!(!recorder.packs.lock().unwrap().is_empty());
        assert_eq!(orchestrator.state().logs().await.len(), 3);

        orchestrator.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_every_context() {
        let config = Arc::new(config().with_isolate(true));
        let state = Arc::new(StateManager::new());
        let service = RpcService::new(state.clone(), Vec::new(), Arc::new(StubModules));
        let options = PoolOptions::from_config(&config);
        let pool = ThreadPool::new(
            config,
            WorkerEnv::new(Arc::new(ThreeTests)),
            Arc::new(service),
            options,
        )
        .unwrap();

        pool.run_tests(&files(3), &[]).await.unwrap();
        assert_eq!(state.summary(&[]).await.total, 9);

        pool.close().await.unwrap();
        assert_eq!(pool.live_contexts(), 0);
        assert!(matches!(
            pool.run_tests(&files(1), &[]).await,
            Err(crate::error::PoolError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_inline_pool_runs_all_files_in_one_invocation() {
        let orchestrator = Orchestrator::new(
            config().with_threads(false),
            WorkerEnv::new(Arc::new(ThreeTests)),
            Arc::new(StubModules),
            Vec::new(),
        )
        .unwrap();

        let collected = orchestrator.collect(&files(2)).await.unwrap();
        assert_eq!(collected.len(), 2);
        assert!(collected
            .iter()
            .all(|tree| tree.node(tree.root()).state() == TaskState::Queued));

        let summary = orchestrator.run(&files(2), &[]).await.unwrap();
        assert_eq!(summary.total, 6);
        assert_eq!(summary.passed, 2);
        orchestrator.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_crashed_context_is_fatal() {
        crate::telemetry::init_for_tests();
        let env =
            WorkerEnv::new(Arc::new(ThreeTests)).with_snapshots(Arc::new(CrashingSnapshots));
        let orchestrator =
            Orchestrator::new(config(), env, Arc::new(StubModules), Vec::new()).unwrap();
        let signal = orchestrator.fatal_signal();

        let err = orchestrator.run(&files(1), &[]).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::WorkerExited { code: 1 }));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(*signal.borrow(), Some(1));

        orchestrator.close().await.unwrap();
    }
}
