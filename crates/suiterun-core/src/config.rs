//! Resolved run configuration shared by the orchestrator and every worker.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default debounce window for batched task updates.
pub const DEFAULT_UPDATE_DEBOUNCE: Duration = Duration::from_millis(10);

/// Coverage collection settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageOptions {
    /// Bracket each worker run with a coverage session.
    pub enabled: bool,
}

/// Which mock cleanup runs before every test.
///
/// The three flags are mutually exclusive: restore implies reset, which
/// implies clear, so only the strongest configured one fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MockPolicy {
    Restore,
    Reset,
    Clear,
}

/// Every option the execution core recognizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolvedConfig {
    /// Project root; task ids are derived from paths relative to it.
    pub root: PathBuf,

    /// Pooled worker threads when true, inline execution otherwise.
    pub threads: bool,

    /// Upper bound on pooled execution contexts.
    pub max_threads: Option<usize>,

    /// Contexts kept alive while the pool is idle.
    pub min_threads: Option<usize>,

    /// Fresh execution context for every file.
    pub isolate: bool,

    pub coverage: CoverageOptions,

    pub clear_mocks: bool,
    pub mock_reset: bool,
    pub restore_mocks: bool,

    /// Limit for a single test body; `None` waits forever.
    pub test_timeout: Option<Duration>,

    /// Limit for each hook level; `None` waits forever.
    pub hook_timeout: Option<Duration>,

    /// Debounce window of the task update batcher.
    pub update_debounce: Duration,
}

impl ResolvedConfig {
    /// Builder method to set the project root.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Builder method to switch between pooled and inline execution.
    pub fn with_threads(mut self, threads: bool) -> Self {
        self.threads = threads;
        self
    }

    /// Builder method to bound the pool size.
    pub fn with_thread_limits(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.min_threads = min;
        self.max_threads = max;
        self
    }

    /// Builder method to toggle per-file isolation.
    pub fn with_isolate(mut self, isolate: bool) -> Self {
        self.isolate = isolate;
        self
    }

    /// Builder method to toggle coverage collection.
    pub fn with_coverage(mut self, enabled: bool) -> Self {
        self.coverage.enabled = enabled;
        self
    }

    /// Builder method to set the test body timeout.
    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = Some(timeout);
        self
    }

    /// Builder method to set the hook timeout.
    pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout = Some(timeout);
        self
    }

    /// The mock cleanup to apply before each test, if any.
    pub fn mock_policy(&self) -> Option<MockPolicy> {
        if self.restore_mocks {
            Some(MockPolicy::Restore)
        } else if self.mock_reset {
            Some(MockPolicy::Reset)
        } else if self.clear_mocks {
            Some(MockPolicy::Clear)
        } else {
            None
        }
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            threads: true,
            max_threads: None,
            min_threads: None,
            isolate: true,
            coverage: CoverageOptions::default(),
            clear_mocks: false,
            mock_reset: false,
            restore_mocks: false,
            test_timeout: None,
            hook_timeout: None,
            update_debounce: DEFAULT_UPDATE_DEBOUNCE,
        }
    }
}
