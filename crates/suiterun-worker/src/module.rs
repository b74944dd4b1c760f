//! Module loading through the orchestrator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use suiterun_proto::{BridgeError, FetchResult, ResolveResult, SourceMap, WorkerRpc};

/// Fetched modules of one execution context, keyed by resolved id.
///
/// Shared by every invocation the context serves, so files run in the same
/// non-isolated context reuse each other's fetches.
#[derive(Debug, Clone, Default)]
pub struct ModuleCache {
    entries: Arc<Mutex<HashMap<String, FetchResult>>>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, FetchResult>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &str) -> Option<FetchResult> {
        self.entries().get(id).cloned()
    }

    pub fn insert(&self, id: impl Into<String>, module: FetchResult) {
        self.entries().insert(id.into(), module);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict the given ids; unknown ids are ignored.
    pub fn invalidate<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> usize {
        let mut entries = self.entries();
        ids.into_iter()
            .filter(|id| entries.remove(*id).is_some())
            .count()
    }
}

/// Worker-side module services: resolution, fetching and source maps.
#[derive(Clone)]
pub struct ModuleLoader {
    rpc: WorkerRpc,
    cache: ModuleCache,
}

impl ModuleLoader {
    pub fn new(rpc: WorkerRpc, cache: ModuleCache) -> Self {
        Self { rpc, cache }
    }

    pub fn cache(&self) -> &ModuleCache {
        &self.cache
    }

    pub async fn resolve(
        &self,
        specifier: &str,
        importer: Option<&str>,
    ) -> Result<Option<ResolveResult>, BridgeError> {
        self.rpc.resolve_id(specifier, importer).await
    }

    /// Fetch a resolved module, from the cache when possible.
    pub async fn load(&self, id: &str) -> Result<FetchResult, BridgeError> {
        if let Some(module) = self.cache.get(id) {
            trace!(module = id, "Module cache hit");
            return Ok(module);
        }
        let module = self.rpc.fetch(id).await?;
        debug!(module = id, externalized = module.externalize.is_some(), "Fetched module");
        self.cache.insert(id, module.clone());
        Ok(module)
    }

    /// Resolve `specifier` against `importer` and load the result.
    ///
    /// Unresolvable specifiers are loaded as given; external modules are
    /// never fetched.
    pub async fn import(&self, specifier: &str, importer: Option<&str>) -> Result<FetchResult, BridgeError> {
        match self.resolve(specifier, importer).await? {
            Some(resolved) if resolved.external => Ok(FetchResult::external(resolved.id)),
            Some(resolved) => self.load(&resolved.id).await,
            None => self.load(specifier).await,
        }
    }

    /// Source map of a module. `force` also drops the cached module since
    /// the orchestrator re-transforms it.
    pub async fn source_map(&self, id: &str, force: bool) -> Result<Option<SourceMap>, BridgeError> {
        if force {
            self.cache.invalidate([id]);
        }
        self.rpc.get_source_map(id, force).await
    }
}
