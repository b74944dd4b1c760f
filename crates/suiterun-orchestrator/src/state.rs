//! Global run state merged from every worker.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use suiterun_core::{FileTree, SnapshotResult, SnapshotSummary, TaskId, TaskPack, UserConsoleLog};

use crate::summary::RunSummary;

#[derive(Default)]
struct StateInner {
    /// Collected files by path.
    files: BTreeMap<PathBuf, FileTree>,
    /// File root id to path.
    by_id: HashMap<TaskId, PathBuf>,
    logs: Vec<UserConsoleLog>,
    snapshot: SnapshotSummary,
    coverage: Vec<Value>,
}

/// State of the current run as reported by workers.
///
/// Packs are applied in place and never move a task out of a terminal
/// state, so late or duplicated updates cannot corrupt final results.
#[derive(Default)]
pub struct StateManager {
    inner: RwLock<StateInner>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record freshly collected trees, replacing earlier collections.
    pub async fn collect_files(&self, files: &[FileTree]) {
        let mut inner = self.inner.write().await;
        for file in files {
            inner
                .by_id
                .insert(file.id().clone(), file.filepath().to_path_buf());
            inner
                .files
                .insert(file.filepath().to_path_buf(), file.clone());
        }
    }

    /// Apply incremental updates. Returns how many changed a task.
    pub async fn update_tasks(&self, packs: &[TaskPack]) -> usize {
        let mut inner = self.inner.write().await;
        let StateInner { files, by_id, .. } = &mut *inner;
        let mut applied = 0;

        for pack in packs {
            let Some(tree) = by_id
                .get(&pack.id().file_id())
                .and_then(|path| files.get_mut(path))
            else {
                warn!(task_id = %pack.id(), "Update for a task of an unknown file");
                continue;
            };
            match tree.apply_pack(pack) {
                Ok(true) => applied += 1,
                Ok(false) => debug!(task_id = %pack.id(), "Ignoring update of a finished task"),
                Err(e) => warn!(error = %e, "Failed to apply task update"),
            }
        }
        applied
    }

    /// Merge the final trees of a worker run.
    pub async fn finish_files(&self, files: &[FileTree]) {
        let packs: Vec<TaskPack> = files
            .iter()
            .flat_map(|file| file.iter().map(|(idx, _)| file.pack(idx)))
            .filter(|pack| pack.result().is_some())
            .collect();
        self.update_tasks(&packs).await;
    }

    pub async fn update_user_log(&self, log: UserConsoleLog) {
        self.inner.write().await.logs.push(log);
    }

    pub async fn add_snapshot(&self, snapshot: &SnapshotResult) {
        self.inner.write().await.snapshot += snapshot;
    }

    pub async fn add_coverage(&self, payload: Value) {
        self.inner.write().await.coverage.push(payload);
    }

    pub async fn file(&self, path: &Path) -> Option<FileTree> {
        self.inner.read().await.files.get(path).cloned()
    }

    /// Every collected file, ordered by path.
    pub async fn files(&self) -> Vec<FileTree> {
        self.inner.read().await.files.values().cloned().collect()
    }

    /// Logs in arrival order.
    pub async fn logs(&self) -> Vec<UserConsoleLog> {
        self.inner.read().await.logs.clone()
    }

    pub async fn snapshot_summary(&self) -> SnapshotSummary {
        self.inner.read().await.snapshot.clone()
    }

    pub async fn coverage(&self) -> Vec<Value> {
        self.inner.read().await.coverage.clone()
    }

    /// Totals over the given files, or all files when `paths` is empty.
    pub async fn summary(&self, paths: &[PathBuf]) -> RunSummary {
        let inner = self.inner.read().await;
        if paths.is_empty() {
            RunSummary::from_files(inner.files.values())
        } else {
            RunSummary::from_files(paths.iter().filter_map(|p| inner.files.get(p)))
        }
    }

    /// Forget logs, snapshots and coverage of the previous run.
    pub async fn reset_run(&self) {
        let mut inner = self.inner.write().await;
        inner.logs.clear();
        inner.snapshot = SnapshotSummary::default();
        inner.coverage.clear();
    }
}
