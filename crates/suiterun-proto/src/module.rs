//! Module-loading payloads answered by the orchestrator.
//!
//! Workers cannot transform or resolve sources on their own; every module
//! they execute is fetched through the bridge.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transformed module source, or a hint to load it natively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Path to load as-is instead of executing `code`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub externalize: Option<String>,
}

impl FetchResult {
    /// A module to execute from transformed source.
    pub fn inline(code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            externalize: None,
        }
    }

    /// A module to load natively from `path`.
    pub fn external(path: impl Into<String>) -> Self {
        Self {
            code: None,
            externalize: Some(path.into()),
        }
    }
}

/// Outcome of resolving an import specifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResult {
    pub id: String,
    #[serde(default)]
    pub external: bool,
    /// Plugin metadata, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl ResolveResult {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            external: false,
            meta: None,
        }
    }
}

/// Raw source map (revision 3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMap {
    pub version: u8,
    pub mappings: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources_content: Option<Vec<Option<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}
