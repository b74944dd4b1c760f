//! SuiteRun Orchestrator Library
//!
//! This crate drives a test run from the main process: it owns the worker
//! pool, serves the orchestrator side of every bridge, merges worker
//! results into the global state and forwards them to reporters.

pub mod error;
pub mod modules;
pub mod orchestrator;
pub mod pool;
pub mod reporter;
pub mod service;
pub mod state;
pub mod summary;
pub mod telemetry;

pub use error::{OrchestratorError, PoolError};
pub use modules::{FsModuleServer, ModuleServer};
pub use orchestrator::Orchestrator;
pub use pool::{create_pool, InlinePool, PoolOptions, ThreadPool, WorkerPool};
pub use reporter::{LogReporter, Reporter};
pub use service::RpcService;
pub use state::StateManager;
pub use summary::RunSummary;
