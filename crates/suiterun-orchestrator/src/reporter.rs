//! Reporters receive every worker notification after the state merge.

use async_trait::async_trait;
use tracing::{debug, info};

use suiterun_core::{ConsoleStream, FileTree, TaskPack, TaskState, UserConsoleLog};

/// Observer of a run. Every method defaults to doing nothing.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn on_collected(&self, _files: &[FileTree]) {}

    async fn on_task_update(&self, _packs: &[TaskPack]) {}

    async fn on_user_console_log(&self, _log: &UserConsoleLog) {}

    async fn on_finished(&self, _files: &[FileTree]) {}
}

/// Writes run progress to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

#[async_trait]
impl Reporter for LogReporter {
    async fn on_collected(&self, files: &[FileTree]) {
        for file in files {
            info!(
                file = %file.filepath().display(),
                tasks = file.len(),
                "Collected"
            );
        }
    }

    async fn on_task_update(&self, packs: &[TaskPack]) {
        for TaskPack(id, result) in packs {
            let state = result.as_ref().map(|r| r.state).unwrap_or(TaskState::Queued);
            debug!(task_id = %id, state = ?state, "Task update");
        }
    }

    async fn on_user_console_log(&self, log: &UserConsoleLog) {
        let task = log.task_id.as_ref().map(|id| id.as_str()).unwrap_or("-");
        match log.stream {
            ConsoleStream::Stdout => info!(task_id = task, "{}", log.content),
            ConsoleStream::Stderr => info!(task_id = task, stream = "stderr", "{}", log.content),
        }
    }

    async fn on_finished(&self, files: &[FileTree]) {
        for file in files {
            info!(
                file = %file.filepath().display(),
                state = ?file.node(file.root()).state(),
                "Finished"
            );
        }
    }
}
