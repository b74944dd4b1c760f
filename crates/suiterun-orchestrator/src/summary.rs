//! Totals of a finished run.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use suiterun_core::{FileTree, RunMode, TaskState};

/// Test counts of a run, computed from the merged state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub files: usize,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub todo: usize,
    /// Suites (file roots included) that failed with an error of their own:
    /// collection failures, hook failures, empty suites.
    pub suite_errors: usize,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn from_files<'a>(files: impl IntoIterator<Item = &'a FileTree>) -> Self {
        let mut summary = Self {
            files: 0,
            total: 0,
            passed: 0,
            failed: 0,
            skipped: 0,
            todo: 0,
            suite_errors: 0,
            finished_at: Utc::now(),
        };

        for file in files {
            summary.files += 1;
            for (_, node) in file.iter() {
                if node.is_suite() {
                    let failed_itself = node
                        .result
                        .as_ref()
                        .is_some_and(|r| r.state == TaskState::Fail && r.error.is_some());
                    if failed_itself {
                        summary.suite_errors += 1;
                    }
                    continue;
                }

                summary.total += 1;
                match (node.state(), node.mode) {
                    (TaskState::Pass, _) => summary.passed += 1,
                    (TaskState::Fail, _) => summary.failed += 1,
                    (TaskState::Todo, _) | (_, RunMode::Todo) => summary.todo += 1,
                    (TaskState::Skip, _) | (_, RunMode::Skip) => summary.skipped += 1,
                    // Never started: an enclosing boundary aborted first.
                    _ => {}
                }
            }
        }
        summary
    }

    /// Tests that never reached a terminal state.
    pub fn not_run(&self) -> usize {
        self.total - self.passed - self.failed - self.skipped - self.todo
    }

    pub fn success(&self) -> bool {
        self.failed == 0 && self.suite_errors == 0
    }

    /// 0 when nothing failed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files, {} tests: {} passed, {} failed, {} skipped, {} todo",
            self.files, self.total, self.passed, self.failed, self.skipped, self.todo
        )?;
        if self.suite_errors > 0 {
            write!(f, " ({} suite errors)", self.suite_errors)?;
        }
        Ok(())
    }
}
