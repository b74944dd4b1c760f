//! Side-channel records produced while tests execute.

use std::ops::AddAssign;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::TaskId;

/// Which output stream a console log was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

/// Output written by user code during a test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConsoleLog {
    pub content: String,
    pub stream: ConsoleStream,
    /// Task that was executing when the output was produced.
    pub task_id: Option<TaskId>,
    pub time: DateTime<Utc>,
}

impl UserConsoleLog {
    /// Create a log entry stamped with the current time.
    pub fn new(content: impl Into<String>, stream: ConsoleStream, task_id: Option<TaskId>) -> Self {
        Self {
            content: content.into(),
            stream,
            task_id,
            time: Utc::now(),
        }
    }
}

/// Snapshot state of one file after it was saved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotResult {
    pub filepath: PathBuf,
    pub added: u32,
    pub matched: u32,
    pub unmatched: u32,
    pub updated: u32,
    pub unchecked: u32,
    pub file_deleted: bool,
}

impl SnapshotResult {
    /// Returns true if the file touched no snapshot at all.
    pub fn is_empty(&self) -> bool {
        self.added == 0
            && self.matched == 0
            && self.unmatched == 0
            && self.updated == 0
            && self.unchecked == 0
            && !self.file_deleted
    }
}

/// Run-wide snapshot totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub files: u32,
    pub added: u32,
    pub matched: u32,
    pub unmatched: u32,
    pub updated: u32,
    pub unchecked: u32,
    pub files_removed: u32,
}

impl AddAssign<&SnapshotResult> for SnapshotSummary {
    fn add_assign(&mut self, result: &SnapshotResult) {
        self.files += 1;
        self.added += result.added;
        self.matched += result.matched;
        self.unmatched += result.unmatched;
        self.updated += result.updated;
        self.unchecked += result.unchecked;
        if result.file_deleted {
            self.files_removed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_summary_accumulates() {
        let mut summary = SnapshotSummary::default();
        summary += &SnapshotResult {
            added: 2,
            matched: 1,
            ..Default::default()
        };
        summary += &SnapshotResult {
            unmatched: 1,
            file_deleted: true,
            ..Default::default()
        };
        assert_eq!(summary.files, 2);
        assert_eq!(summary.added, 2);
        assert_eq!(summary.unmatched, 1);
        assert_eq!(summary.files_removed, 1);
    }

    #[test]
    fn test_snapshot_result_empty() {
        assert!(SnapshotResult::default().is_empty());
    }
}
