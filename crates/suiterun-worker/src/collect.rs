//! Collection: turning a file into its task tree and executable functions.
//!
//! Loading and evaluating test sources is left to a [`Collector`]; it
//! declares suites, tests and hooks through a [`SuiteBuilder`]. The tree
//! is data only, while the closures live beside it in [`TaskFns`], keyed by
//! node index.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use suiterun_core::{FileTree, NodeIdx, ResolvedConfig, RunMode};

use crate::context::{BoxError, SuiteContext, TestContext, TestOutcome};
use crate::error::{panic_error, process_error};
use crate::module::ModuleLoader;

/// A test body or an each-hook.
pub type TestFn = Arc<dyn Fn(TestContext) -> BoxFuture<'static, TestOutcome> + Send + Sync>;

/// A `before_all`/`after_all` hook.
pub type SuiteHookFn = Arc<dyn Fn(SuiteContext) -> BoxFuture<'static, TestOutcome> + Send + Sync>;

/// Hooks registered on one suite, in registration order.
#[derive(Clone, Default)]
pub struct SuiteHooks {
    pub before_all: Vec<SuiteHookFn>,
    pub after_all: Vec<SuiteHookFn>,
    pub before_each: Vec<TestFn>,
    pub after_each: Vec<TestFn>,
}

/// Functions of a collected file.
#[derive(Clone, Default)]
pub struct TaskFns {
    tests: HashMap<NodeIdx, TestFn>,
    hooks: HashMap<NodeIdx, SuiteHooks>,
}

impl TaskFns {
    pub fn test(&self, idx: NodeIdx) -> Option<&TestFn> {
        self.tests.get(&idx)
    }

    pub fn hooks(&self, idx: NodeIdx) -> Option<&SuiteHooks> {
        self.hooks.get(&idx)
    }

    fn hooks_mut(&mut self, idx: NodeIdx) -> &mut SuiteHooks {
        self.hooks.entry(idx).or_default()
    }
}

/// A collected file, ready to run.
pub struct Collected {
    pub tree: FileTree,
    pub fns: TaskFns,
}

/// Declaration options for a suite or test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskOptions {
    pub mode: RunMode,
    pub concurrent: bool,
    /// Tests only: expect the body to fail.
    pub fails: bool,
}

impl TaskOptions {
    pub fn skip() -> Self {
        Self {
            mode: RunMode::Skip,
            ..Default::default()
        }
    }

    pub fn only() -> Self {
        Self {
            mode: RunMode::Only,
            ..Default::default()
        }
    }

    pub fn todo() -> Self {
        Self {
            mode: RunMode::Todo,
            ..Default::default()
        }
    }

    pub fn concurrent(mut self) -> Self {
        self.concurrent = true;
        self
    }

    pub fn fails(mut self) -> Self {
        self.fails = true;
        self
    }
}

fn box_test_fn<F, Fut>(f: F) -> TestFn
where
    F: Fn(TestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TestOutcome> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

fn box_suite_hook<F, Fut>(f: F) -> SuiteHookFn
where
    F: Fn(SuiteContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TestOutcome> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Declares the children and hooks of one suite.
///
/// Children of a concurrent suite are concurrent as well.
pub struct SuiteBuilder<'a> {
    out: &'a mut Collected,
    suite: NodeIdx,
    concurrent: bool,
}

impl<'a> SuiteBuilder<'a> {
    /// Builder for the file root suite.
    pub fn root(out: &'a mut Collected) -> Self {
        let suite = out.tree.root();
        Self {
            out,
            suite,
            concurrent: false,
        }
    }

    /// Index of the suite being declared.
    pub fn index(&self) -> NodeIdx {
        self.suite
    }

    /// Declare a test with default options.
    pub fn test<F, Fut>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestOutcome> + Send + 'static,
    {
        self.test_with(name, TaskOptions::default(), f)
    }

    pub fn test_with<F, Fut>(&mut self, name: &str, options: TaskOptions, f: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestOutcome> + Send + 'static,
    {
        if let Some(idx) = self.add_test(name, options) {
            self.out.fns.tests.insert(idx, box_test_fn(f));
        }
        self
    }

    /// Declare a placeholder test without body.
    pub fn todo(&mut self, name: &str) -> &mut Self {
        self.add_test(name, TaskOptions::todo());
        self
    }

    fn add_test(&mut self, name: &str, options: TaskOptions) -> Option<NodeIdx> {
        let concurrent = self.concurrent || options.concurrent;
        match self
            .out
            .tree
            .add_test(self.suite, name, options.mode, concurrent, options.fails)
        {
            Ok(idx) => Some(idx),
            Err(e) => {
                warn!(test = name, error = %e, "Dropping test declaration");
                None
            }
        }
    }

    /// Declare a nested suite with default options.
    pub fn suite(&mut self, name: &str, declare: impl FnOnce(&mut SuiteBuilder<'_>)) -> &mut Self {
        self.suite_with(name, TaskOptions::default(), declare)
    }

    pub fn suite_with(
        &mut self,
        name: &str,
        options: TaskOptions,
        declare: impl FnOnce(&mut SuiteBuilder<'_>),
    ) -> &mut Self {
        let concurrent = self.concurrent || options.concurrent;
        match self
            .out
            .tree
            .add_suite(self.suite, name, options.mode, concurrent)
        {
            Ok(idx) => {
                let mut child = SuiteBuilder {
                    out: &mut *self.out,
                    suite: idx,
                    concurrent,
                };
                declare(&mut child);
            }
            Err(e) => warn!(suite = name, error = %e, "Dropping suite declaration"),
        }
        self
    }

    pub fn before_all<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(SuiteContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestOutcome> + Send + 'static,
    {
        self.out
            .fns
            .hooks_mut(self.suite)
            .before_all
            .push(box_suite_hook(f));
        self
    }

    pub fn after_all<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(SuiteContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestOutcome> + Send + 'static,
    {
        self.out
            .fns
            .hooks_mut(self.suite)
            .after_all
            .push(box_suite_hook(f));
        self
    }

    pub fn before_each<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestOutcome> + Send + 'static,
    {
        self.out
            .fns
            .hooks_mut(self.suite)
            .before_each
            .push(box_test_fn(f));
        self
    }

    pub fn after_each<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestOutcome> + Send + 'static,
    {
        self.out
            .fns
            .hooks_mut(self.suite)
            .after_each
            .push(box_test_fn(f));
        self
    }
}

/// Declares the tests of a file.
///
/// Implementations typically fetch the file through the loader, evaluate
/// it and register what it declares on `suite`.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn collect(
        &self,
        file: &Path,
        suite: &mut SuiteBuilder<'_>,
        loader: &ModuleLoader,
    ) -> Result<(), BoxError>;
}

/// Collect one file. A failing or panicking collector yields a tree whose
/// root already failed, so the runner skips the file.
pub async fn collect_file(
    config: &ResolvedConfig,
    file: &Path,
    collector: &dyn Collector,
    loader: &ModuleLoader,
) -> Collected {
    let start = Instant::now();
    let mut out = Collected {
        tree: FileTree::new(&config.root, file),
        fns: TaskFns::default(),
    };

    let result = {
        let mut suite = SuiteBuilder::root(&mut out);
        AssertUnwindSafe(collector.collect(file, &mut suite, loader))
            .catch_unwind()
            .await
    };

    match result {
        Ok(Ok(())) => out.tree.interpret_only_mode(),
        Ok(Err(e)) => {
            warn!(file = %file.display(), error = %e, "Collection failed");
            out.tree.fail_collection(process_error(e.as_ref()));
        }
        Err(panic) => {
            let error = panic_error(panic);
            warn!(file = %file.display(), error = %error, "Collector panicked");
            out.tree.fail_collection(error);
        }
    }

    out.tree
        .set_collect_duration(start.elapsed().as_secs_f64() * 1000.0);
    debug!(file = %file.display(), tasks = out.tree.len(), "Collected file");
    out
}
