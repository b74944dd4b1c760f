//! Declared modes and result states of tasks.

use serde::{Deserialize, Serialize};

/// Declared intent for a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Execute normally.
    #[default]
    Run,
    /// Do not execute.
    Skip,
    /// Placeholder for a test that is not written yet.
    Todo,
    /// Exclusive: siblings without `only` are skipped.
    Only,
}

impl RunMode {
    /// Returns true if the task executes when reached by the runner.
    pub fn is_runnable(&self) -> bool {
        matches!(self, Self::Run | Self::Only)
    }
}

/// State of a task result.
///
/// States only move forward: `Queued -> Run -> terminal`. Skipped, todo and
/// collection-failed tasks may go straight from `Queued` to their terminal
/// state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Collected, not started.
    #[default]
    Queued,
    /// Currently executing.
    Run,
    /// Finished successfully.
    Pass,
    /// Finished with an error.
    Fail,
    /// Not executed.
    Skip,
    /// Not executed, marked todo.
    Todo,
}

impl TaskState {
    /// Returns true if the state is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Pass | Self::Fail | Self::Skip | Self::Todo)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Run => 1,
            _ => 2,
        }
    }

    /// Returns true if moving from `self` to `next` keeps the state monotonic.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        next.rank() > self.rank()
    }
}
