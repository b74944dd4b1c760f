//! Module services answered on behalf of workers.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use suiterun_proto::{FetchResult, HandlerError, ResolveResult, SourceMap};

/// Transform and resolution pipeline of the main process.
#[async_trait]
pub trait ModuleServer: Send + Sync {
    async fn fetch(&self, id: &str) -> Result<FetchResult, HandlerError>;

    async fn resolve_id(
        &self,
        id: &str,
        importer: Option<&str>,
    ) -> Result<Option<ResolveResult>, HandlerError>;

    async fn source_map(&self, id: &str) -> Result<Option<SourceMap>, HandlerError>;

    /// Drop any cached transform of `id`.
    async fn invalidate(&self, id: &str);
}

/// Serves sources straight from disk without transformation.
///
/// Relative specifiers resolve against the importer's directory, bare
/// specifiers are treated as external packages.
pub struct FsModuleServer {
    root: PathBuf,
    cache: RwLock<HashMap<String, FetchResult>>,
}

impl FsModuleServer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn resolve_path(&self, id: &str, importer: Option<&str>) -> Option<PathBuf> {
        let path = Path::new(id);
        if path.is_absolute() {
            return Some(normalize(path));
        }
        if !(id.starts_with("./") || id.starts_with("../")) {
            return None;
        }
        let base = importer
            .and_then(|i| Path::new(i).parent())
            .unwrap_or(self.root.as_path());
        Some(normalize(&base.join(path)))
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[async_trait]
impl ModuleServer for FsModuleServer {
    async fn fetch(&self, id: &str) -> Result<FetchResult, HandlerError> {
        if let Some(cached) = self.cache.read().await.get(id) {
            return Ok(cached.clone());
        }
        let code = tokio::fs::read_to_string(id).await?;
        let module = FetchResult::inline(code);
        self.cache.write().await.insert(id.to_string(), module.clone());
        debug!(module = id, "Loaded module from disk");
        Ok(module)
    }

    async fn resolve_id(
        &self,
        id: &str,
        importer: Option<&str>,
    ) -> Result<Option<ResolveResult>, HandlerError> {
        match self.resolve_path(id, importer) {
            Some(path) => {
                if tokio::fs::try_exists(&path).await? {
                    Ok(Some(ResolveResult::new(path.to_string_lossy())))
                } else {
                    Ok(None)
                }
            }
            None => Ok(Some(ResolveResult {
                external: true,
                ..ResolveResult::new(id)
            })),
        }
    }

    async fn source_map(&self, _id: &str) -> Result<Option<SourceMap>, HandlerError> {
        // Sources are served untransformed.
        Ok(None)
    }

    async fn invalidate(&self, id: &str) {
        self.cache.write().await.remove(id);
    }
}
