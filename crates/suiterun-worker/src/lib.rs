//! SuiteRun execution context.
//!
//! A worker owns everything that happens inside one isolated execution
//! context: collecting the task tree of a file through a [`Collector`],
//! running it with hook ordering and failure containment, batching task
//! updates and streaming them over the bridge.

pub mod aggregator;
pub mod collect;
pub mod context;
pub mod env;
pub mod error;
pub mod mocks;
pub mod module;
pub mod runner;
pub mod worker;

// Re-export commonly used types
pub use aggregator::{UpdateBatcher, UpdateSink};
pub use collect::{collect_file, Collected, Collector, SuiteBuilder, TaskFns, TaskOptions};
pub use context::{AssertionError, BoxError, SuiteContext, TestContext, TestOutcome};
pub use env::{CoverageProvider, NoSnapshots, SnapshotClient, WorkerEnv};
pub use error::WorkerError;
pub use mocks::{clear_module_mocks, MockFn, MockHandle, MockRegistry};
pub use module::{ModuleCache, ModuleLoader};
pub use runner::{run_files, start_tests, HookKind, RunEnv, SuiteRunner};
pub use worker::{Worker, WorkerContext};
