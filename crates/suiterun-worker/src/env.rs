//! External collaborators of a worker: collection, snapshots and coverage.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use suiterun_core::SnapshotResult;

use crate::collect::Collector;
use crate::context::{AssertionError, BoxError, TestContext};

/// Snapshot store used by the tests of one execution context.
///
/// The test a snapshot belongs to is always passed in, so concurrent tests
/// sharing one client never see each other's identity.
#[async_trait]
pub trait SnapshotClient: Send + Sync {
    /// Compare `received` with the next snapshot of `test`, recording it
    /// when none is stored yet.
    fn check(&self, test: &TestContext, received: &str) -> Result<(), AssertionError>;

    /// Persist the snapshots of `file`. `None` when the file has no
    /// snapshot state.
    async fn save(&self, file: &Path) -> Option<SnapshotResult>;
}

/// Snapshot client for runs without snapshot support.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSnapshots;

#[async_trait]
impl SnapshotClient for NoSnapshots {
    fn check(&self, test: &TestContext, _received: &str) -> Result<(), AssertionError> {
        Err(AssertionError::new(format!(
            "snapshot support is not configured for {}",
            test.full_name()
        )))
    }

    async fn save(&self, _file: &Path) -> Option<SnapshotResult> {
        None
    }
}

/// Precise coverage session bracketing a worker run.
#[async_trait]
pub trait CoverageProvider: Send + Sync {
    async fn start(&self) -> Result<(), BoxError>;

    /// Stop the session and return what it collected.
    async fn take(&self) -> Result<Value, BoxError>;
}

/// Collaborators every worker of a pool is built with.
#[derive(Clone)]
pub struct WorkerEnv {
    pub collector: Arc<dyn Collector>,
    pub snapshots: Arc<dyn SnapshotClient>,
    pub coverage: Option<Arc<dyn CoverageProvider>>,
}

impl WorkerEnv {
    /// Environment without snapshot or coverage support.
    pub fn new(collector: Arc<dyn Collector>) -> Self {
        Self {
            collector,
            snapshots: Arc::new(NoSnapshots),
            coverage: None,
        }
    }

    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotClient>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn with_coverage(mut self, coverage: Arc<dyn CoverageProvider>) -> Self {
        self.coverage = Some(coverage);
        self
    }
}
