//! Handles passed to user hooks and test bodies.
//!
//! Per-test state (assertion counters, the current task, console output)
//! travels with the [`TestContext`] instead of living in a global, so
//! concurrent tests in one worker never observe each other's state.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

use suiterun_core::{ConsoleStream, ErrorInfo, TaskId, UserConsoleLog};
use suiterun_proto::{WorkerNotification, WorkerRpc};

use crate::env::SnapshotClient;
use crate::mocks::MockRegistry;

/// Error type returned by user code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a hook or test body.
pub type TestOutcome = Result<(), BoxError>;

/// A failed assertion.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct AssertionError {
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

impl AssertionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            expected: None,
            actual: None,
        }
    }

    /// An assertion failure with the two compared values.
    pub fn comparison(
        message: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            expected: Some(expected.into()),
            actual: Some(actual.into()),
        }
    }
}

#[derive(Debug, Default)]
struct AssertionState {
    calls: u32,
    expected: Option<u32>,
    expecting_any: bool,
}

fn send_log(rpc: &WorkerRpc, content: String, stream: ConsoleStream, task_id: Option<TaskId>) {
    let log = UserConsoleLog::new(content, stream, task_id);
    if let Err(e) = rpc.notify(WorkerNotification::OnUserConsoleLog { log }) {
        debug!(error = %e, "Dropping console log");
    }
}

struct TestContextInner {
    task_id: TaskId,
    name: String,
    full_name: String,
    file: PathBuf,
    assertions: Mutex<AssertionState>,
    mocks: MockRegistry,
    snapshots: Arc<dyn SnapshotClient>,
    rpc: WorkerRpc,
}

/// The currently executing test.
#[derive(Clone)]
pub struct TestContext {
    inner: Arc<TestContextInner>,
}

impl TestContext {
    pub(crate) fn new(
        task_id: TaskId,
        name: String,
        full_name: String,
        file: PathBuf,
        mocks: MockRegistry,
        snapshots: Arc<dyn SnapshotClient>,
        rpc: WorkerRpc,
    ) -> Self {
        Self {
            inner: Arc::new(TestContextInner {
                task_id,
                name,
                full_name,
                file,
                assertions: Mutex::new(AssertionState::default()),
                mocks,
                snapshots,
                rpc,
            }),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.inner.task_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Suite names and the test name joined with `" > "`.
    pub fn full_name(&self) -> &str {
        &self.inner.full_name
    }

    pub fn file(&self) -> &Path {
        &self.inner.file
    }

    /// Mocks registered in this execution context.
    pub fn mocks(&self) -> &MockRegistry {
        &self.inner.mocks
    }

    fn with_assertions<R>(&self, f: impl FnOnce(&mut AssertionState) -> R) -> R {
        let mut state = self
            .inner
            .assertions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Require exactly `count` assertions in this test.
    pub fn expect_assertions(&self, count: u32) {
        self.with_assertions(|s| s.expected = Some(count));
    }

    /// Require at least one assertion in this test.
    pub fn expect_has_assertions(&self) {
        self.with_assertions(|s| s.expecting_any = true);
    }

    /// Assertions recorded so far.
    pub fn assertion_calls(&self) -> u32 {
        self.with_assertions(|s| s.calls)
    }

    /// Record an assertion on `condition`.
    pub fn assert(&self, condition: bool, message: impl Into<String>) -> Result<(), AssertionError> {
        self.with_assertions(|s| s.calls += 1);
        if condition {
            Ok(())
        } else {
            Err(AssertionError::new(message))
        }
    }

    /// Record an equality assertion.
    pub fn assert_eq<T: PartialEq + Debug>(&self, actual: T, expected: T) -> Result<(), AssertionError> {
        self.with_assertions(|s| s.calls += 1);
        if actual == expected {
            return Ok(());
        }
        Err(AssertionError::comparison(
            "expected values to be equal",
            format!("{expected:#?}"),
            format!("{actual:#?}"),
        ))
    }

    /// Record a snapshot assertion of `received` against this test's
    /// stored snapshots.
    pub fn match_snapshot(&self, received: impl AsRef<str>) -> Result<(), AssertionError> {
        self.with_assertions(|s| s.calls += 1);
        self.inner.snapshots.check(self, received.as_ref())
    }

    /// Write to the test's stdout.
    pub fn log(&self, content: impl Into<String>) {
        send_log(
            &self.inner.rpc,
            content.into(),
            ConsoleStream::Stdout,
            Some(self.inner.task_id.clone()),
        );
    }

    /// Write to the test's stderr.
    pub fn error(&self, content: impl Into<String>) {
        send_log(
            &self.inner.rpc,
            content.into(),
            ConsoleStream::Stderr,
            Some(self.inner.task_id.clone()),
        );
    }

    /// Check the assertion contract after the body completed.
    pub(crate) fn verify_assertions(&self) -> Result<(), ErrorInfo> {
        self.with_assertions(|s| {
            if let Some(expected) = s.expected {
                if s.calls != expected {
                    return Err(ErrorInfo::assertion_count(expected, s.calls));
                }
            }
            if s.expecting_any && s.calls == 0 {
                return Err(ErrorInfo::missing_assertions());
            }
            Ok(())
        })
    }
}

/// The suite whose `before_all`/`after_all` hooks are executing.
#[derive(Clone)]
pub struct SuiteContext {
    task_id: TaskId,
    name: String,
    file: PathBuf,
    rpc: WorkerRpc,
}

impl SuiteContext {
    pub(crate) fn new(task_id: TaskId, name: String, file: PathBuf, rpc: WorkerRpc) -> Self {
        Self {
            task_id,
            name,
            file,
            rpc,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn log(&self, content: impl Into<String>) {
        send_log(
            &self.rpc,
            content.into(),
            ConsoleStream::Stdout,
            Some(self.task_id.clone()),
        );
    }
}
