//! The closed message envelope carried by a bridge.
//!
//! Every line on the transport is one [`WireMessage`]: a protocol version
//! and an [`Envelope`], which is either a worker notification, a module
//! request from the worker, or the orchestrator's response to one.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use suiterun_core::{FileTree, SnapshotResult, TaskPack, UserConsoleLog};

use crate::error::BridgeError;
use crate::module::{FetchResult, ResolveResult, SourceMap};

/// Envelope version spoken by this build.
pub const PROTOCOL_VERSION: u16 = 1;

/// Versioned frame written to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub v: u16,
    pub body: Envelope,
}

impl WireMessage {
    /// Wrap a body in the current protocol version.
    pub fn new(body: Envelope) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            body,
        }
    }

    /// Serialize to a single JSON line (without the trailing newline).
    pub fn encode(&self) -> Result<String, BridgeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a line, rejecting other protocol versions.
    pub fn decode(line: &str) -> Result<Self, BridgeError> {
        let message: WireMessage = serde_json::from_str(line)?;
        if message.v != PROTOCOL_VERSION {
            return Err(BridgeError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                found: message.v,
            });
        }
        Ok(message)
    }
}

/// One bridge message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// Fire-and-forget, worker to orchestrator.
    Notify { message: WorkerNotification },
    /// Worker asks the orchestrator for a module service.
    Request { id: u64, call: ModuleRequest },
    /// Answer to the request with the same `id`.
    Response {
        id: u64,
        result: Result<ModuleResponse, String>,
    },
}

/// Opaque coverage data produced by the instrumentation provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub payload: Value,
}

/// Worker to orchestrator method table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args")]
pub enum WorkerNotification {
    #[serde(rename = "onCollected")]
    OnCollected { files: Vec<FileTree> },
    #[serde(rename = "onTaskUpdate")]
    OnTaskUpdate { packs: Vec<TaskPack> },
    #[serde(rename = "onUserConsoleLog")]
    OnUserConsoleLog { log: UserConsoleLog },
    #[serde(rename = "onFinished")]
    OnFinished { files: Vec<FileTree> },
    #[serde(rename = "snapshotSaved")]
    SnapshotSaved { snapshot: SnapshotResult },
    #[serde(rename = "coverageCollected")]
    CoverageCollected { coverage: CoverageReport },
    #[serde(rename = "onWorkerExit")]
    OnWorkerExit { code: i32 },
}

impl WorkerNotification {
    /// Method name as written on the wire.
    pub fn method(&self) -> &'static str {
        match self {
            Self::OnCollected { .. } => "onCollected",
            Self::OnTaskUpdate { .. } => "onTaskUpdate",
            Self::OnUserConsoleLog { .. } => "onUserConsoleLog",
            Self::OnFinished { .. } => "onFinished",
            Self::SnapshotSaved { .. } => "snapshotSaved",
            Self::CoverageCollected { .. } => "coverageCollected",
            Self::OnWorkerExit { .. } => "onWorkerExit",
        }
    }
}

/// Module services the orchestrator answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args")]
pub enum ModuleRequest {
    #[serde(rename = "fetch")]
    Fetch { id: String },
    #[serde(rename = "resolveId")]
    ResolveId {
        id: String,
        importer: Option<String>,
    },
    #[serde(rename = "getSourceMap")]
    GetSourceMap { id: String, force: bool },
}

impl ModuleRequest {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Fetch { .. } => "fetch",
            Self::ResolveId { .. } => "resolveId",
            Self::GetSourceMap { .. } => "getSourceMap",
        }
    }
}

/// Payload of a successful module response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "value")]
pub enum ModuleResponse {
    #[serde(rename = "fetch")]
    Fetch(FetchResult),
    #[serde(rename = "resolveId")]
    ResolveId(Option<ResolveResult>),
    #[serde(rename = "getSourceMap")]
    SourceMap(Option<SourceMap>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_notification_uses_method_args_record() {
        let tree = FileTree::new(Path::new("/repo"), "/repo/a.test");
        let msg = WireMessage::new(Envelope::Notify {
            message: WorkerNotification::OnTaskUpdate {
                packs: vec![tree.pack(tree.root())],
            },
        });

        let line = msg.encode().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["v"], 1);
        assert_eq!(value["body"]["kind"], "notify");
        assert_eq!(value["body"]["message"]["method"], "onTaskUpdate");
        assert_eq!(value["body"]["message"]["args"]["packs"][0][0], tree.id().as_str());

        assert_eq!(WireMessage::decode(&line).unwrap(), msg);
    }

    #[test]
    fn test_request_carries_correlation_id() {
        let msg = WireMessage::new(Envelope::Request {
            id: 7,
            call: ModuleRequest::ResolveId {
                id: "./dep".to_string(),
                importer: Some("/repo/a.test".to_string()),
            },
        });
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["body"]["id"], 7);
        assert_eq!(value["body"]["call"]["method"], "resolveId");
    }

    #[test]
    fn test_decode_rejects_other_versions() {
        let line = r#"{"v":2,"body":{"kind":"notify","message":{"method":"onWorkerExit","args":{"code":1}}}}"#;
        assert!(matches!(
            WireMessage::decode(line),
            Err(BridgeError::VersionMismatch { expected: 1, found: 2 })
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_methods() {
        let line = r#"{"v":1,"body":{"kind":"notify","message":{"method":"onSomething","args":{}}}}"#;
        assert!(matches!(WireMessage::decode(line), Err(BridgeError::Json(_))));
    }
}
