//! SuiteRun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Message transports
//! - Worker threads
//! - Runtime specifics
//!
//! The task tree, its results, the normalized error model and the resolved
//! run configuration all live here so both sides of the bridge agree on them.

pub mod config;
pub mod error;
pub mod event;
pub mod failure;
pub mod ids;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use config::{CoverageOptions, MockPolicy, ResolvedConfig};
pub use error::CoreError;
pub use event::{ConsoleStream, SnapshotResult, SnapshotSummary, UserConsoleLog};
pub use failure::{ErrorInfo, ErrorKind};
pub use ids::{RunId, TaskId, WorkerId};
pub use status::{RunMode, TaskState};
pub use task::{FileTree, NodeIdx, TaskKind, TaskNode, TaskPack, TaskResult};
