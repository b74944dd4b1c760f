//! Error types for the bridge.

use thiserror::Error;

/// Errors that can occur while exchanging bridge messages.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Peer speaks another envelope version.
    #[error("protocol version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u16, found: u16 },

    /// The other side of the bridge is gone.
    #[error("Bridge closed")]
    Closed,

    /// The orchestrator failed to serve a request.
    #[error("Remote error: {0}")]
    Remote(String),

    /// A response arrived that does not answer the request.
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
}
