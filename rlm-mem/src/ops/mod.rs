//! The operations collaborators call: remember, recall and reason.
//!
//! A [`MemoryEngine`] owns the store, its cache, the chunker, the auto-linker
//! and the optional model client. Operations never return caller mistakes
//! (validation, policy, unknown ids) as `Err`; those come back inside the
//! result with `success == false`. `Err` is reserved for infrastructure
//! failures such as an unreadable database.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rlm_mem::ops::{MemoryEngine, RecallRequest, RememberRequest};
//! use rlm_mem::policy::Identity;
//!
//! let engine = MemoryEngine::open(project_root)?;
//! let me = Identity::new("my-project", "coder");
//!
//! let stored = engine.remember(&me, RememberRequest::new("We decided to use JWT.", "conv-1"))?;
//! let recalled = engine.recall(&me, RecallRequest::new("Which auth scheme?")).await?;
//! ```

mod import;
mod link;
mod recall;
mod reason;
mod remember;

pub use import::ImportReport;
pub use link::{LinkRequest, LinkResult};
pub use recall::{RecallRequest, RecallResult};
pub use reason::{
    AnalysisType, Contradiction, ContradictionKind, ReasonRequest, ReasonResult,
};
pub use remember::{RememberRequest, RememberResult};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheStats, CacheTelemetry, CachedStore, MemoryCache};
use crate::chunking::ChunkingEngine;
use crate::config::MemoryConfig;
use crate::error::{Error, Result};
use crate::llm::LLMClient;
use crate::memory::{AutoLinker, CompactionReport, LayeredMemoryStore, PartitionStats, StorageBackend};
use crate::policy::{Identity, PolicyResolver};
use crate::sandbox::{RetrievalSession, Sandbox, SandboxLimits};

/// A caller error reported inside an operation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    /// Stable class name, e.g. `policy_violation`
    pub kind: String,
    pub message: String,
}

impl OperationError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Turn a caller error into a result field; pass anything else through.
pub(crate) fn capture(error: Error) -> Result<OperationError> {
    if error.is_caller_error() {
        Ok(OperationError::new(error.kind(), error.to_string()))
    } else {
        Err(error)
    }
}

/// Entry point for the memory operations.
pub struct MemoryEngine {
    store: Arc<LayeredMemoryStore>,
    cached: CachedStore,
    chunker: ChunkingEngine,
    linker: AutoLinker,
    llm: Option<Arc<dyn LLMClient>>,
    limits: SandboxLimits,
}

impl MemoryEngine {
    /// Build an engine over `backend` from a validated configuration.
    pub fn new(config: &MemoryConfig, backend: StorageBackend) -> Result<Self> {
        config.validate()?;
        let resolver = PolicyResolver::new(config.policy.clone())?;
        let store = Arc::new(LayeredMemoryStore::open(
            backend,
            resolver,
            config.chunking.max_tokens,
        ));
        let cache = Arc::new(MemoryCache::from_config(&config.cache));
        let cached = CachedStore::new(Arc::clone(&store), cache)?;

        Ok(Self {
            store,
            cached,
            chunker: ChunkingEngine::new(config.chunking)?,
            linker: AutoLinker::new(config.linker.clone()),
            llm: config.llm.build()?,
            limits: config.sandbox.clone(),
        })
    }

    /// Open the memory of a project, reading its configuration file.
    pub fn open(project_root: &Path) -> Result<Self> {
        let config = MemoryConfig::load(project_root)?;
        let backend = config.disk_backend(project_root)?;
        info!(project_root = %project_root.display(), "Opening memory engine");
        Self::new(&config, backend)
    }

    /// An engine with no persistence.
    pub fn in_memory(config: &MemoryConfig) -> Result<Self> {
        Self::new(config, StorageBackend::InMemory)
    }

    /// Use `llm` for retrieval sessions and synthesis.
    pub fn with_llm(mut self, llm: Arc<dyn LLMClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn store(&self) -> &LayeredMemoryStore {
        &self.store
    }

    pub fn cached(&self) -> &CachedStore {
        &self.cached
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    /// A sandbox for callers that drive sessions themselves, e.g. to cancel them.
    pub fn sandbox(&self) -> Option<Sandbox> {
        self.llm
            .as_ref()
            .map(|llm| Sandbox::new(self.cached.clone(), Arc::clone(llm), self.limits.clone()))
    }

    pub fn session(&self, identity: &Identity) -> Option<RetrievalSession> {
        self.sandbox().map(|sandbox| sandbox.session(identity))
    }

    pub fn cache_stats(&self) -> Result<CacheStats> {
        self.cached.cache().stats()
    }

    pub fn cache_telemetry(&self) -> Result<CacheTelemetry> {
        self.cached.cache().telemetry()
    }

    /// Compact every partition the caller may write.
    pub fn compact(&self, identity: &Identity) -> Result<Vec<CompactionReport>> {
        self.store.compact(identity)
    }

    pub fn stats(&self, identity: &Identity) -> Result<Vec<PartitionStats>> {
        self.store.stats(identity)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::llm::ScriptedClient;
    use crate::policy::PolicyConfig;

    pub fn engine() -> MemoryEngine {
        MemoryEngine::in_memory(&MemoryConfig::default()).unwrap()
    }

    pub fn engine_with(policy: PolicyConfig) -> MemoryEngine {
        MemoryEngine::in_memory(&MemoryConfig::default().with_policy(policy)).unwrap()
    }

    pub fn scripted<I, S>(engine: MemoryEngine, script: I) -> (MemoryEngine, Arc<ScriptedClient>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Arc::new(ScriptedClient::new(script));
        (engine.with_llm(client.clone()), client)
    }

    pub fn me() -> Identity {
        Identity::new("proj", "agent")
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_capture_splits_errors() {
        let captured = capture(Error::policy("nope")).unwrap();
        assert_eq!(captured.kind, "policy_violation");
        assert!(capture(Error::MemoryStorage("disk".into())).is_err());
    }

    #[test]
    fn test_engine_without_llm() {
        let engine = engine();
        assert!(!engine.has_llm());
        assert!(engine.session(&me()).is_none());
        assert_eq!(engine.cache_stats().unwrap().capacity, 256);
    }

    #[test]
    fn test_open_reads_project_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig::default()
            .with_user_root(dir.path().join("user").to_string_lossy().to_string())
            .with_sandbox(SandboxLimits::default().with_max_iterations(3));
        config.save(dir.path()).unwrap();

        let engine = MemoryEngine::open(dir.path()).unwrap();
        assert_eq!(engine.limits().max_iterations, 3);
    }
}
