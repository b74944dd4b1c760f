//! Execution of collected task trees.
//!
//! A [`SuiteRunner`] drives one file: suites run their hooks and child
//! groups inside a single failure boundary, tests run their hook chains and
//! body inside boundaries of their own. Errors never cross a boundary; they
//! are normalized into the result of the task that owns the boundary.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tracing::{debug, info, warn};

use suiterun_core::{ErrorInfo, FileTree, NodeIdx, ResolvedConfig, RunMode, TaskState};
use suiterun_proto::{CoverageReport, WorkerNotification, WorkerRpc};

use crate::aggregator::UpdateBatcher;
use crate::collect::{collect_file, Collected, TaskFns};
use crate::context::{SuiteContext, TestContext, TestOutcome};
use crate::env::{SnapshotClient, WorkerEnv};
use crate::error::{panic_error, process_error, WorkerError};
use crate::mocks::{clear_module_mocks, MockRegistry};
use crate::module::ModuleLoader;

/// Lifecycle point of a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    BeforeAll,
    AfterAll,
    BeforeEach,
    AfterEach,
}

impl HookKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeAll => "beforeAll",
            Self::AfterAll => "afterAll",
            Self::BeforeEach => "beforeEach",
            Self::AfterEach => "afterEach",
        }
    }
}

/// Services shared by every task of a worker run.
#[derive(Clone, Copy)]
pub struct RunEnv<'a> {
    pub config: &'a ResolvedConfig,
    pub rpc: &'a WorkerRpc,
    pub batcher: &'a UpdateBatcher,
    pub mocks: &'a MockRegistry,
    pub snapshots: &'a Arc<dyn SnapshotClient>,
}

/// Run a hook or body with panic capture and an optional time limit.
async fn guarded<F>(fut: F, limit: Option<Duration>, what: &str) -> Result<(), ErrorInfo>
where
    F: Future<Output = TestOutcome> + Send,
{
    let fut = AssertUnwindSafe(fut).catch_unwind();
    let outcome = match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(ErrorInfo::timeout(what, limit)),
        },
        None => fut.await,
    };
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(process_error(e.as_ref())),
        Err(panic) => Err(panic_error(panic)),
    }
}

fn first_error(results: Vec<Result<(), ErrorInfo>>) -> Result<(), ErrorInfo> {
    results.into_iter().collect()
}

/// Executes the task tree of one file.
pub struct SuiteRunner<'a> {
    tree: Mutex<FileTree>,
    fns: &'a TaskFns,
    env: RunEnv<'a>,
}

impl<'a> SuiteRunner<'a> {
    pub fn new(tree: FileTree, fns: &'a TaskFns, env: RunEnv<'a>) -> Self {
        Self {
            tree: Mutex::new(tree),
            fns,
            env,
        }
    }

    /// Give back the tree with its results.
    pub fn into_tree(self) -> FileTree {
        self.tree.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_tree<R>(&self, f: impl FnOnce(&mut FileTree) -> R) -> R {
        let mut tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut tree)
    }

    fn emit(&self, idx: NodeIdx) {
        let pack = self.with_tree(|t| t.pack(idx));
        self.env.batcher.update(pack);
    }

    fn start(&self, idx: NodeIdx) {
        if let Err(e) = self.with_tree(|t| t.set_state(idx, TaskState::Run)) {
            warn!(error = %e, "Task started twice");
        }
        self.emit(idx);
    }

    fn finish(&self, idx: NodeIdx, state: TaskState, error: Option<ErrorInfo>, started: Instant) {
        let duration = started.elapsed().as_secs_f64() * 1000.0;
        if let Err(e) = self.with_tree(|t| t.finish(idx, state, error, duration)) {
            warn!(error = %e, "Task finished twice");
        }
        self.emit(idx);
    }

    fn file(&self) -> PathBuf {
        self.with_tree(|t| t.filepath().to_path_buf())
    }

    fn suite_context(&self, suite: NodeIdx) -> SuiteContext {
        let (task_id, name, file) = self.with_tree(|t| {
            let node = t.node(suite);
            (node.id.clone(), node.name.clone(), t.filepath().to_path_buf())
        });
        SuiteContext::new(task_id, name, file, self.env.rpc.clone())
    }

    /// Run the hooks of `kind` for `suite`.
    ///
    /// `before_each` walks from the root down to `suite`, `after_each` from
    /// `suite` up to the root; all-hooks only concern `suite` itself. Hooks
    /// of one level run concurrently, levels run in order, and the first
    /// failing level stops the walk. Each-hooks need the test they wrap.
    pub async fn call_suite_hook(
        &self,
        suite: NodeIdx,
        kind: HookKind,
        test: Option<&TestContext>,
    ) -> Result<(), ErrorInfo> {
        let limit = self.env.config.hook_timeout;
        let what = kind.as_str();

        match kind {
            HookKind::BeforeAll | HookKind::AfterAll => {
                let Some(hooks) = self.fns.hooks(suite) else {
                    return Ok(());
                };
                let level = if kind == HookKind::BeforeAll {
                    &hooks.before_all
                } else {
                    &hooks.after_all
                };
                if level.is_empty() {
                    return Ok(());
                }
                let ctx = self.suite_context(suite);
                let runs = level.iter().map(|hook| guarded(hook(ctx.clone()), limit, what));
                first_error(join_all(runs).await)
            }
            HookKind::BeforeEach | HookKind::AfterEach => {
                let Some(test) = test else {
                    debug!(hook = what, "No test to wrap, skipping each-hooks");
                    return Ok(());
                };
                let mut chain = self.with_tree(|t| t.ancestors(suite));
                if kind == HookKind::BeforeEach {
                    chain.reverse();
                }
                for level in chain {
                    let Some(hooks) = self.fns.hooks(level) else {
                        continue;
                    };
                    let level_hooks = if kind == HookKind::BeforeEach {
                        &hooks.before_each
                    } else {
                        &hooks.after_each
                    };
                    let runs = level_hooks
                        .iter()
                        .map(|hook| guarded(hook(test.clone()), limit, what));
                    first_error(join_all(runs).await)?;
                }
                Ok(())
            }
        }
    }

    /// Run a single test.
    pub async fn run_test(&self, idx: NodeIdx) {
        let (mode, fails, parent, task_id, name, full_name) = self.with_tree(|t| {
            let node = t.node(idx);
            (
                node.mode,
                node.fails(),
                node.parent.unwrap_or(t.root()),
                node.id.clone(),
                node.name.clone(),
                t.full_name(idx),
            )
        });
        let started = Instant::now();

        if !mode.is_runnable() {
            let state = if mode == RunMode::Todo {
                TaskState::Todo
            } else {
                TaskState::Skip
            };
            self.finish(idx, state, None, started);
            return;
        }

        self.start(idx);
        clear_module_mocks(self.env.config.mock_policy(), self.env.mocks);

        let ctx = TestContext::new(
            task_id,
            name,
            full_name,
            self.file(),
            self.env.mocks.clone(),
            Arc::clone(self.env.snapshots),
            self.env.rpc.clone(),
        );

        let mut error = self.run_test_body(idx, parent, &ctx).await.err();
        if let Err(e) = self.call_suite_hook(parent, HookKind::AfterEach, Some(&ctx)).await {
            error = Some(e);
        }

        let state = match (fails, error.is_some()) {
            (false, false) => TaskState::Pass,
            (false, true) => TaskState::Fail,
            (true, false) => {
                error = Some(ErrorInfo::unexpected_pass());
                TaskState::Fail
            }
            (true, true) => {
                error = None;
                TaskState::Pass
            }
        };

        debug!(test = %ctx.full_name(), state = ?state, "Test finished");
        self.finish(idx, state, error, started);
    }

    /// `before_each` chain, body and assertion contract: one boundary.
    async fn run_test_body(
        &self,
        idx: NodeIdx,
        parent: NodeIdx,
        ctx: &TestContext,
    ) -> Result<(), ErrorInfo> {
        self.call_suite_hook(parent, HookKind::BeforeEach, Some(ctx))
            .await?;
        if let Some(body) = self.fns.test(idx) {
            guarded(body(ctx.clone()), self.env.config.test_timeout, "test").await?;
        }
        ctx.verify_assertions()
    }

    /// Run a suite and everything below it.
    pub fn run_suite(&self, idx: NodeIdx) -> BoxFuture<'_, ()> {
        async move {
            let (state, mode, name) = self.with_tree(|t| {
                let node = t.node(idx);
                (node.state(), node.mode, node.name.clone())
            });
            if state == TaskState::Fail {
                return;
            }
            let started = Instant::now();

            match mode {
                RunMode::Skip => return self.finish(idx, TaskState::Skip, None, started),
                RunMode::Todo => return self.finish(idx, TaskState::Todo, None, started),
                RunMode::Run | RunMode::Only => {}
            }

            self.start(idx);
            let boundary = self.run_suite_boundary(idx).await;

            let (has_tests, has_failed) = self.with_tree(|t| (t.has_tests(idx), t.has_failed(idx)));
            let (state, error) = match boundary {
                Err(e) => (TaskState::Fail, Some(e)),
                Ok(()) if !has_tests => (TaskState::Fail, Some(ErrorInfo::empty_suite(&name))),
                Ok(()) if has_failed => (TaskState::Fail, None),
                Ok(()) => (TaskState::Pass, None),
            };
            self.finish(idx, state, error, started);
        }
        .boxed()
    }

    /// `before_all`, child groups and `after_all`; the first error aborts
    /// everything left in the boundary.
    async fn run_suite_boundary(&self, idx: NodeIdx) -> Result<(), ErrorInfo> {
        self.call_suite_hook(idx, HookKind::BeforeAll, None).await?;

        let groups = self.with_tree(|t| t.partition_children(idx));
        for group in groups {
            let concurrent = self.with_tree(|t| group.first().is_some_and(|&c| t.node(c).concurrent));
            if concurrent {
                join_all(group.iter().map(|&child| self.run_suite_child(child))).await;
            } else {
                for child in group {
                    self.run_suite_child(child).await;
                }
            }
        }

        self.call_suite_hook(idx, HookKind::AfterAll, None).await
    }

    fn run_suite_child(&self, idx: NodeIdx) -> BoxFuture<'_, ()> {
        if self.with_tree(|t| t.node(idx).is_suite()) {
            self.run_suite(idx)
        } else {
            self.run_test(idx).boxed()
        }
    }
}

/// Run collected files one after another.
pub async fn run_files(files: Vec<Collected>, env: RunEnv<'_>) -> Vec<FileTree> {
    let mut finished = Vec::with_capacity(files.len());
    for Collected { tree, fns } in files {
        let runner = SuiteRunner::new(tree, &fns, env);
        let root = runner.with_tree(|t| t.root());
        runner.run_suite(root).await;
        finished.push(runner.into_tree());
    }
    finished
}

/// Collect, run and report `files` inside one execution context.
///
/// Every notification goes through `rpc`; the returned trees are the same
/// ones reported by `onFinished`.
pub async fn start_tests(
    files: &[PathBuf],
    config: &ResolvedConfig,
    rpc: &WorkerRpc,
    env: &WorkerEnv,
    loader: &ModuleLoader,
    mocks: &MockRegistry,
) -> Result<Vec<FileTree>, WorkerError> {
    let mut collected = Vec::with_capacity(files.len());
    for file in files {
        collected.push(collect_file(config, file, env.collector.as_ref(), loader).await);
    }
    rpc.notify(WorkerNotification::OnCollected {
        files: collected.iter().map(|c| c.tree.clone()).collect(),
    })?;

    let batcher = UpdateBatcher::spawn(rpc.clone(), config.update_debounce);

    let coverage = env.coverage.as_ref().filter(|_| config.coverage.enabled);
    if config.coverage.enabled && coverage.is_none() {
        warn!("Coverage is enabled but no coverage provider is configured");
    }
    if let Some(provider) = coverage {
        if let Err(e) = provider.start().await {
            warn!(error = %e, "Failed to start coverage");
        }
    }

    let run_env = RunEnv {
        config,
        rpc,
        batcher: &batcher,
        mocks,
        snapshots: &env.snapshots,
    };
    let finished = run_files(collected, run_env).await;
    batcher.flush().await;

    if let Some(provider) = coverage {
        match provider.take().await {
            Ok(payload) => rpc.notify(WorkerNotification::CoverageCollected {
                coverage: CoverageReport { payload },
            })?,
            Err(e) => warn!(error = %e, "Failed to collect coverage"),
        }
    }

    for tree in &finished {
        let saved = env.snapshots.save(tree.filepath()).await;
        if let Some(snapshot) = saved.filter(|s| !s.is_empty()) {
            rpc.notify(WorkerNotification::SnapshotSaved { snapshot })?;
        }
    }

    batcher.close().await;
    info!(files = finished.len(), "Worker run finished");
    rpc.notify(WorkerNotification::OnFinished {
        files: finished.clone(),
    })?;
    Ok(finished)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use suiterun_core::{ErrorKind, SnapshotResult, TaskPack, UserConsoleLog};
    use suiterun_proto::{
        channel, connect, serve, FetchResult, HandlerError, OrchestratorHandler, Port,
        ResolveResult, SourceMap,
    };
    use tokio::sync::oneshot;

    use crate::collect::{Collector, SuiteBuilder, TaskOptions};
    use crate::context::{AssertionError, BoxError};
    use crate::env::{CoverageProvider, NoSnapshots};
    use crate::module::ModuleCache;

    type Events = Arc<StdMutex<Vec<String>>>;

    fn push(events: &Events, event: impl Into<String>) {
        events.lock().unwrap().push(event.into());
    }

    struct Harness {
        config: ResolvedConfig,
        rpc: WorkerRpc,
        mocks: MockRegistry,
        snapshots: Arc<dyn SnapshotClient>,
        _orchestrator: Port,
    }

    impl Harness {
        fn new(config: ResolvedConfig) -> Self {
            let (worker, orchestrator) = channel();
            Self {
                config: config.with_root("/repo"),
                rpc: connect(worker),
                mocks: MockRegistry::new(),
                snapshots: Arc::new(NoSnapshots),
                _orchestrator: orchestrator,
            }
        }

        fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotClient>) -> Self {
            self.snapshots = snapshots;
            self
        }

        fn declare(&self, declare: impl FnOnce(&mut SuiteBuilder<'_>)) -> Collected {
            let mut out = Collected {
                tree: FileTree::new(Path::new("/repo"), "/repo/a.test"),
                fns: TaskFns::default(),
            };
            declare(&mut SuiteBuilder::root(&mut out));
            out.tree.interpret_only_mode();
            out
        }

        async fn run(&self, collected: Collected) -> FileTree {
            let batcher = UpdateBatcher::spawn(self.rpc.clone(), Duration::from_millis(10));
            let env = RunEnv {
                config: &self.config,
                rpc: &self.rpc,
                batcher: &batcher,
                mocks: &self.mocks,
                snapshots: &self.snapshots,
            };
            let mut trees = run_files(vec![collected], env).await;
            batcher.close().await;
            trees.remove(0)
        }
    }

    fn child(tree: &FileTree, parent: NodeIdx, i: usize) -> NodeIdx {
        tree.node(parent).children()[i]
    }

    fn recorder(events: &Events, label: &'static str) -> impl Fn(TestContext) -> BoxFuture<'static, TestOutcome> + Send + Sync + 'static {
        let events = events.clone();
        move |_ctx| {
            push(&events, label);
            async { Ok(()) }.boxed()
        }
    }

    #[tokio::test]
    async fn test_each_hooks_wrap_from_outside_in() {
        let h = Harness::new(ResolvedConfig::default());
        let events: Events = Arc::default();
        let collected = h.declare(|root| {
            root.suite("A", |a| {
                a.before_each(recorder(&events, "A.beforeEach"));
                a.after_each(recorder(&events, "A.afterEach"));
                a.suite("B", |b| {
                    b.before_each(recorder(&events, "B.beforeEach"));
                    b.after_each(recorder(&events, "B.afterEach"));
                    b.test("test", recorder(&events, "test"));
                });
            });
        });

        let tree = h.run(collected).await;
        assert_eq!(
            *events.lock().unwrap(),
            vec!["A.beforeEach", "B.beforeEach", "test", "B.afterEach", "A.afterEach"]
        );
        assert_eq!(tree.node(tree.root()).state(), TaskState::Pass);
    }

    #[tokio::test]
    async fn test_groups_run_in_declaration_order() {
        let h = Harness::new(ResolvedConfig::default());
        let events: Events = Arc::default();
        let collected = h.declare(|root| {
            let e = events.clone();
            root.test("t1", move |_ctx| {
                let e = e.clone();
                async move {
                    push(&e, "t1");
                    Ok(())
                }
            });
            for name in ["t2", "t3"] {
                let e = events.clone();
                root.test_with(name, TaskOptions::default().concurrent(), move |_ctx| {
                    let e = e.clone();
                    async move {
                        push(&e, format!("{name} start"));
                        tokio::task::yield_now().await;
                        push(&e, format!("{name} end"));
                        Ok(())
                    }
                });
            }
            root.test("t4", recorder(&events, "t4"));
        });

        h.run(collected).await;
        let events = events.lock().unwrap().clone();
        assert_eq!(events.first().map(String::as_str), Some("t1"));
        assert_eq!(events.last().map(String::as_str), Some("t4"));
        // Both concurrent tests start before either of them ends.
        let first_end = events.iter().position(|e| e.ends_with("end")).unwrap();
        assert_eq!(
            events[..first_end].iter().filter(|e| e.ends_with("start")).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_fails_flag_inverts_outcome() {
        let h = Harness::new(ResolvedConfig::default());
        let collected = h.declare(|root| {
            root.test_with("throws", TaskOptions::default().fails(), |_ctx| async {
                Err::<(), BoxError>("expected".into())
            });
            root.test_with("passes", TaskOptions::default().fails(), |_ctx| async { Ok(()) });
        });

        let tree = h.run(collected).await;
        let throws = tree.result(child(&tree, tree.root(), 0)).unwrap();
        assert_eq!(throws.state, TaskState::Pass);
        assert!(throws.error.is_none());

        let passes = tree.result(child(&tree, tree.root(), 1)).unwrap();
        assert_eq!(passes.state, TaskState::Fail);
        assert_eq!(
            passes.error.as_ref().unwrap().kind,
            ErrorKind::UnexpectedPass
        );
        assert_eq!(tree.node(tree.root()).state(), TaskState::Fail);
    }

    #[tokio::test]
    async fn test_assertion_count_mismatch_fails() {
        let h = Harness::new(ResolvedConfig::default());
        let collected = h.declare(|root| {
            root.test("counts", |ctx| async move {
                ctx.expect_assertions(2);
                ctx.assert_eq(1 + 1, 2)?;
                Ok::<(), BoxError>(())
            });
            root.test("has assertions", |ctx| async move {
                ctx.expect_has_assertions();
                Ok(())
            });
        });

        let tree = h.run(collected).await;
        let counts = tree.result(child(&tree, tree.root(), 0)).unwrap();
        assert_eq!(counts.state, TaskState::Fail);
        assert_eq!(counts.error.as_ref().unwrap().kind, ErrorKind::AssertionCount);

        let any = tree.result(child(&tree, tree.root(), 1)).unwrap();
        assert_eq!(any.error.as_ref().unwrap().kind, ErrorKind::MissingAssertions);
    }

    #[tokio::test]
    async fn test_empty_suite_fails_with_its_name() {
        let h = Harness::new(ResolvedConfig::default());
        let collected = h.declare(|root| {
            root.test("ok", |_ctx| async { Ok(()) });
            root.suite("empty", |_s| {});
        });

        let tree = h.run(collected).await;
        let empty = tree.result(child(&tree, tree.root(), 1)).unwrap();
        assert_eq!(empty.state, TaskState::Fail);
        assert_eq!(
            empty.error.as_ref().unwrap().message,
            "No tests found in suite empty"
        );
    }

    #[tokio::test]
    async fn test_before_all_failure_aborts_remaining_groups() {
        let h = Harness::new(ResolvedConfig::default());
        let collected = h.declare(|root| {
            root.suite("S", |s| {
                s.before_all(|_ctx| async { Err::<(), BoxError>("setup broke".into()) });
                s.test("first", |_ctx| async { Ok(()) });
                s.test_with("second", TaskOptions::default().concurrent(), |_ctx| async {
                    Ok(())
                });
            });
        });

        let tree = h.run(collected).await;
        let suite = child(&tree, tree.root(), 0);
        let result = tree.result(suite).unwrap();
        assert_eq!(result.state, TaskState::Fail);
        assert_eq!(result.error.as_ref().unwrap().message, "setup broke");
        assert_eq!(tree.node(child(&tree, suite, 0)).state(), TaskState::Queued);
        assert_eq!(tree.node(child(&tree, suite, 1)).state(), TaskState::Queued);
    }

    #[tokio::test]
    async fn test_after_each_failure_only_fails_the_test() {
        let h = Harness::new(ResolvedConfig::default());
        let collected = h.declare(|root| {
            root.suite("S", |s| {
                s.after_each(|ctx| async move {
                    if ctx.name() == "bad" {
                        panic!("teardown exploded");
                    }
                    Ok(())
                });
                s.test("bad", |_ctx| async { Ok(()) });
                s.test("good", |_ctx| async { Ok(()) });
            });
        });

        let tree = h.run(collected).await;
        let suite = child(&tree, tree.root(), 0);
        let bad = tree.result(child(&tree, suite, 0)).unwrap();
        assert_eq!(bad.state, TaskState::Fail);
        assert_eq!(bad.error.as_ref().unwrap().kind, ErrorKind::Panic);
        assert_eq!(tree.node(child(&tree, suite, 1)).state(), TaskState::Pass);
        let suite_result = tree.result(suite).unwrap();
        assert_eq!(suite_result.state, TaskState::Fail);
        assert!(suite_result.error.is_none());
    }

    #[tokio::test]
    async fn test_skip_and_todo_are_terminal_without_running() {
        let h = Harness::new(ResolvedConfig::default());
        let events: Events = Arc::default();
        let collected = h.declare(|root| {
            root.test_with("skipped", TaskOptions::skip(), recorder(&events, "skipped"));
            root.todo("later");
            root.suite_with("skipped suite", TaskOptions::skip(), |s| {
                s.test("inner", recorder(&events, "inner"));
            });
            root.test("runs", recorder(&events, "runs"));
        });

        let tree = h.run(collected).await;
        let root = tree.root();
        assert_eq!(tree.node(child(&tree, root, 0)).state(), TaskState::Skip);
        assert_eq!(tree.node(child(&tree, root, 1)).state(), TaskState::Todo);
        assert_eq!(tree.node(child(&tree, root, 2)).state(), TaskState::Skip);
        assert_eq!(*events.lock().unwrap(), vec!["runs"]);
        assert_eq!(tree.node(root).state(), TaskState::Pass);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_the_test() {
        let h = Harness::new(ResolvedConfig::default().with_test_timeout(Duration::from_millis(50)));
        let collected = h.declare(|root| {
            root.test("hangs", |_ctx| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            });
        });

        let tree = h.run(collected).await;
        let result = tree.result(child(&tree, tree.root(), 0)).unwrap();
        assert_eq!(result.state, TaskState::Fail);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_restore_policy_runs_before_each_test() {
        let config = ResolvedConfig {
            restore_mocks: true,
            clear_mocks: true,
            ..Default::default()
        };
        let h = Harness::new(config);
        let spy = h.mocks.spy("double", |x: &u32| x * 2);
        spy.mock_implementation(|_| 0);

        let observed = spy.clone();
        let collected = h.declare(move |root| {
            root.test("sees original", move |ctx| {
                let spy = observed.clone();
                async move {
                    ctx.assert_eq(spy.call(2), 4)?;
                    Ok::<(), BoxError>(())
                }
            });
        });

        let tree = h.run(collected).await;
        assert_eq!(tree.node(child(&tree, tree.root(), 0)).state(), TaskState::Pass);
    }

    #[tokio::test]
    async fn test_pre_failed_file_is_not_run() {
        let h = Harness::new(ResolvedConfig::default());
        let events: Events = Arc::default();
        let mut collected = h.declare(|root| {
            root.test("never", recorder(&events, "never"));
        });
        collected
            .tree
            .fail_collection(ErrorInfo::new(ErrorKind::Thrown, "broken import"));

        let tree = h.run(collected).await;
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(tree.node(child(&tree, tree.root(), 0)).state(), TaskState::Queued);
    }

    /// Snapshot store that remembers which test every check came from.
    #[derive(Default)]
    struct RecordingSnapshots {
        events: Events,
        checks: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SnapshotClient for RecordingSnapshots {
        fn check(&self, test: &TestContext, received: &str) -> Result<(), AssertionError> {
            self.checks
                .lock()
                .unwrap()
                .push((test.name().to_string(), received.to_string()));
            Ok(())
        }

        async fn save(&self, file: &Path) -> Option<SnapshotResult> {
            push(&self.events, "snapshot save");
            let added = u32::from(file.ends_with("a.test"));
            Some(SnapshotResult {
                filepath: file.to_path_buf(),
                added,
                ..Default::default()
            })
        }
    }

    struct RecordingCoverage {
        events: Events,
    }

    #[async_trait]
    impl CoverageProvider for RecordingCoverage {
        async fn start(&self) -> Result<(), BoxError> {
            push(&self.events, "coverage start");
            Ok(())
        }

        async fn take(&self) -> Result<Value, BoxError> {
            push(&self.events, "coverage take");
            Ok(json!({ "covered": 1 }))
        }
    }

    /// Orchestrator side that records the notifications it receives.
    #[derive(Default)]
    struct RecordingHandler {
        methods: Events,
        snapshots: StdMutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl OrchestratorHandler for RecordingHandler {
        async fn on_collected(&self, _files: Vec<FileTree>) -> Result<(), HandlerError> {
            push(&self.methods, "onCollected");
            Ok(())
        }

        async fn on_task_update(&self, _packs: Vec<TaskPack>) -> Result<(), HandlerError> {
            push(&self.methods, "onTaskUpdate");
            Ok(())
        }

        async fn on_user_console_log(&self, _log: UserConsoleLog) -> Result<(), HandlerError> {
            push(&self.methods, "onUserConsoleLog");
            Ok(())
        }

        async fn on_finished(&self, _files: Vec<FileTree>) -> Result<(), HandlerError> {
            push(&self.methods, "onFinished");
            Ok(())
        }

        async fn snapshot_saved(&self, snapshot: SnapshotResult) -> Result<(), HandlerError> {
            push(&self.methods, "snapshotSaved");
            self.snapshots.lock().unwrap().push(snapshot.filepath);
            Ok(())
        }

        async fn coverage_collected(&self, _coverage: CoverageReport) -> Result<(), HandlerError> {
            push(&self.methods, "coverageCollected");
            Ok(())
        }

        async fn on_worker_exit(&self, _code: i32) -> Result<(), HandlerError> {
            push(&self.methods, "onWorkerExit");
            Ok(())
        }

        async fn fetch(&self, id: String) -> Result<FetchResult, HandlerError> {
            Err(format!("no module {id}").into())
        }

        async fn resolve_id(
            &self,
            _id: String,
            _importer: Option<String>,
        ) -> Result<Option<ResolveResult>, HandlerError> {
            Ok(None)
        }

        async fn get_source_map(
            &self,
            _id: String,
            _force: bool,
        ) -> Result<Option<SourceMap>, HandlerError> {
            Ok(None)
        }
    }

    /// Every file declares a single test that records its body and checks
    /// one snapshot.
    struct OneTest {
        events: Events,
    }

    #[async_trait]
    impl Collector for OneTest {
        async fn collect(
            &self,
            _file: &Path,
            suite: &mut SuiteBuilder<'_>,
            _loader: &ModuleLoader,
        ) -> Result<(), BoxError> {
            let events = self.events.clone();
            suite.test("renders", move |ctx| {
                let events = events.clone();
                async move {
                    push(&events, "test body");
                    ctx.match_snapshot("<p>ok</p>")?;
                    Ok::<(), BoxError>(())
                }
            });
            Ok(())
        }
    }

    /// Run `start_tests` over a served bridge and return what the
    /// orchestrator side received.
    async fn start_recorded(
        files: &[PathBuf],
        config: &ResolvedConfig,
        env: &WorkerEnv,
    ) -> (Vec<FileTree>, Arc<RecordingHandler>) {
        let (worker, orchestrator) = channel();
        let handler = Arc::new(RecordingHandler::default());
        let (stop, shutdown) = oneshot::channel();
        let server = tokio::spawn(serve(orchestrator, handler.clone(), shutdown));

        let rpc = connect(worker);
        let loader = ModuleLoader::new(rpc.clone(), ModuleCache::new());
        let finished = start_tests(files, config, &rpc, env, &loader, &MockRegistry::new())
            .await
            .unwrap();
        let _ = stop.send(());
        server.await.unwrap();
        (finished, handler)
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<StdMutex<Vec<u8>>>);

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_start_tests_reports_in_lifecycle_order() {
        let events: Events = Arc::default();
        let snapshots = Arc::new(RecordingSnapshots {
            events: events.clone(),
            ..Default::default()
        });
        let env = WorkerEnv::new(Arc::new(OneTest {
            events: events.clone(),
        }))
        .with_snapshots(snapshots.clone())
        .with_coverage(Arc::new(RecordingCoverage {
            events: events.clone(),
        }));
        let config = ResolvedConfig::default().with_root("/repo").with_coverage(true);
        let files = [PathBuf::from("/repo/a.test"), PathBuf::from("/repo/b.test")];
        let (finished, handler) = start_recorded(&files, &config, &env).await;

        assert_eq!(finished.len(), 2);
        assert!(finished
            .iter()
            .all(|tree| tree.node(tree.root()).state() == TaskState::Pass));
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "coverage start",
                "test body",
                "test body",
                "coverage take",
                "snapshot save",
                "snapshot save",
            ]
        );
        assert_eq!(snapshots.checks.lock().unwrap().len(), 2);

        let methods = handler.methods.lock().unwrap().clone();
        let updates = methods.iter().filter(|m| *m == "onTaskUpdate").count();
        assert!(updates > 0);
        let mut expected = vec!["onCollected".to_string()];
        expected.extend(std::iter::repeat("onTaskUpdate".to_string()).take(updates));
        expected.extend(["coverageCollected", "snapshotSaved", "onFinished"].map(String::from));
        assert_eq!(methods, expected);
        // Files whose snapshot state is empty are not reported.
        assert_eq!(
            *handler.snapshots.lock().unwrap(),
            vec![PathBuf::from("/repo/a.test")]
        );
    }

    #[tokio::test]
    async fn test_concurrent_tests_check_snapshots_as_themselves() {
        let snapshots = Arc::new(RecordingSnapshots::default());
        let h = Harness::new(ResolvedConfig::default()).with_snapshots(snapshots.clone());
        let collected = h.declare(|root| {
            for name in ["t2", "t3"] {
                root.test_with(name, TaskOptions::default().concurrent(), move |ctx| async move {
                    tokio::task::yield_now().await;
                    ctx.match_snapshot(name)?;
                    Ok::<(), BoxError>(())
                });
            }
        });

        let tree = h.run(collected).await;
        let mut checks = snapshots.checks.lock().unwrap().clone();
        checks.sort();
        assert_eq!(
            checks,
            vec![
                ("t2".to_string(), "t2".to_string()),
                ("t3".to_string(), "t3".to_string()),
            ]
        );
        assert_eq!(tree.node(tree.root()).state(), TaskState::Pass);
    }

    #[tokio::test]
    async fn test_after_all_failure_fails_the_suite() {
        let h = Harness::new(ResolvedConfig::default());
        let collected = h.declare(|root| {
            root.suite("db", |db| {
                db.after_all(|_ctx| async { Err::<(), BoxError>("teardown failed".into()) });
                db.test("query", |_ctx| async { Ok(()) });
            });
        });

        let tree = h.run(collected).await;
        let suite = child(&tree, tree.root(), 0);
        assert_eq!(tree.node(child(&tree, suite, 0)).state(), TaskState::Pass);
        let result = tree.result(suite).unwrap();
        assert_eq!(result.state, TaskState::Fail);
        assert_eq!(result.error.as_ref().unwrap().message, "teardown failed");
        assert_eq!(tree.node(tree.root()).state(), TaskState::Fail);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hook_timeout_fails_the_suite() {
        let h = Harness::new(ResolvedConfig::default().with_hook_timeout(Duration::from_millis(50)));
        let events: Events = Arc::default();
        let collected = h.declare(|root| {
            root.suite("slow setup", |s| {
                s.before_all(|_ctx| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                });
                s.test("never", recorder(&events, "never"));
            });
        });

        let tree = h.run(collected).await;
        let suite = child(&tree, tree.root(), 0);
        let result = tree.result(suite).unwrap();
        assert_eq!(result.state, TaskState::Fail);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Timeout);
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(tree.node(child(&tree, suite, 0)).state(), TaskState::Queued);
    }

    #[tokio::test]
    async fn test_coverage_without_provider_warns() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let env = WorkerEnv::new(Arc::new(OneTest {
            events: Arc::default(),
        }))
        .with_snapshots(Arc::new(RecordingSnapshots::default()));
        let config = ResolvedConfig::default().with_root("/repo").with_coverage(true);
        let (finished, handler) = start_recorded(&[PathBuf::from("/repo/a.test")], &config, &env).await;

        assert_eq!(finished.len(), 1);
        assert!(logs
            .contents()
            .contains("Coverage is enabled but no coverage provider is configured"));
        assert!(!handler
            .methods
            .lock()
            .unwrap()
            .iter()
            .any(|m| m == "coverageCollected"));
    }
}
