//! Core domain errors.

use thiserror::Error;

use crate::status::TaskState;

/// Core domain errors for SuiteRun.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Arena index does not address a node of the tree.
    #[error("Unknown node index {0}")]
    UnknownNode(usize),

    /// Result state would move backwards or leave a terminal state.
    #[error("Invalid state transition for {task}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        task: String,
        from: TaskState,
        to: TaskState,
    },

    /// A test-only operation was applied to a suite, or the reverse.
    #[error("Task {0} has the wrong kind for this operation")]
    WrongKind(String),
}
