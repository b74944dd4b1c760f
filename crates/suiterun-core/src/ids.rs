//! Identifiers of tasks, runs and execution contexts.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Length of the hex prefix used for file ids.
const FILE_HASH_LEN: usize = 10;

/// Declares a string-backed id with `as_str`, `Display` and `From<&str>`.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id! {
    /// Id of a suite or test.
    ///
    /// File roots are identified by a hash of the file path relative to the
    /// project root; children append their declaration index, so the same
    /// file always yields the same ids across collect and run invocations.
    TaskId
}

string_id! {
    /// Id of one pool invocation, used to correlate its log lines.
    RunId
}

string_id! {
    /// Id of an execution context.
    WorkerId
}

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id of a file's root suite.
    pub fn for_file(root: &Path, file: &Path) -> Self {
        let relative = file.strip_prefix(root).unwrap_or(file);
        let normalized = relative.to_string_lossy().replace('\\', "/");
        let digest = Sha256::digest(normalized.as_bytes());
        let mut hash = hex::encode(digest);
        hash.truncate(FILE_HASH_LEN);
        Self(hash)
    }

    /// Derive the id of the `index`-th child of this task.
    pub fn child(&self, index: usize) -> Self {
        Self(format!("{}_{}", self.0, index))
    }

    /// Id of the file root this task belongs to.
    pub fn file_id(&self) -> TaskId {
        match self.0.split_once('_') {
            Some((file, _)) => Self(file.to_string()),
            None => self.clone(),
        }
    }
}

impl RunId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl WorkerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}
