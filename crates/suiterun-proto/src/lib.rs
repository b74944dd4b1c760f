//! Wire protocol and RPC bridge for SuiteRun.
//!
//! This crate contains:
//! - The closed, versioned message envelope exchanged over a bridge
//! - Module-loading payloads served by the orchestrator
//! - The bridge itself: a worker-side client and an orchestrator-side
//!   dispatch loop over one in-order transport

pub mod bridge;
pub mod error;
pub mod message;
pub mod module;

// Re-export commonly used types
pub use bridge::{
    channel, connect, notify_worker_exit, serve, HandlerError, OrchestratorHandler, Port,
    PortSender, WorkerRpc,
};
pub use error::BridgeError;
pub use message::{
    CoverageReport, Envelope, ModuleRequest, ModuleResponse, WireMessage, WorkerNotification,
    PROTOCOL_VERSION,
};
pub use module::{FetchResult, ResolveResult, SourceMap};
