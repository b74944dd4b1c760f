//! Orchestrator error types.

use thiserror::Error;

/// Worker pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Worker pool is closed")]
    Closed,

    #[error("Failed to spawn execution context: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Invocation failed: {0}")]
    Worker(String),

    #[error("Invocation canceled before completion")]
    Canceled,
}

/// Errors surfaced to whoever embeds the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// An execution context terminated; the run cannot be trusted.
    #[error("Worker exited unexpectedly with code {code}")]
    WorkerExited { code: i32 },
}

impl OrchestratorError {
    /// Process exit status the embedding binary should use.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::WorkerExited { code } => *code,
            Self::Pool(_) => 1,
        }
    }
}
