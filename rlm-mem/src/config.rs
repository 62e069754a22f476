//! Memory configuration, read from `.agents/memory/config.yaml`.
//!
//! ```yaml
//! policy:
//!   read_layers: [project_agent, project_global, user_global]
//!   write_layers: [project_agent, project_global]
//!   retention_days: 30
//! sandbox:
//!   max_iterations: 6
//! llm:
//!   provider: anthropic
//!   model: claude-3-5-haiku-20241022
//! ```
//!
//! Every section is optional and falls back to its defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::cache::CacheConfig;
use crate::chunking::ChunkingConfig;
use crate::error::{Error, Result};
use crate::llm::LlmConfig;
use crate::memory::{LinkerConfig, StorageBackend};
use crate::policy::PolicyConfig;
use crate::sandbox::SandboxLimits;

/// File name of the configuration inside the project memory directory.
pub const CONFIG_FILE: &str = "config.yaml";

/// Default location of user-scoped memory.
pub const DEFAULT_USER_ROOT: &str = "~/.agents/memory";

/// Complete memory configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub policy: PolicyConfig,
    pub chunking: ChunkingConfig,
    pub linker: LinkerConfig,
    pub cache: CacheConfig,
    pub sandbox: SandboxLimits,
    pub llm: LlmConfig,
    /// Root of the user-scoped layers; `~` is expanded
    pub user_root: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            policy: PolicyConfig::default(),
            chunking: ChunkingConfig::default(),
            linker: LinkerConfig::default(),
            cache: CacheConfig::default(),
            sandbox: SandboxLimits::default(),
            llm: LlmConfig::default(),
            user_root: DEFAULT_USER_ROOT.to_string(),
        }
    }
}

impl MemoryConfig {
    /// Where the configuration of a project lives.
    pub fn path_for(project_root: &Path) -> PathBuf {
        StorageBackend::project_memory_dir(project_root).join(CONFIG_FILE)
    }

    /// Load a project's configuration; a missing file yields defaults.
    pub fn load(project_root: &Path) -> Result<Self> {
        let path = Self::path_for(project_root);
        if !path.exists() {
            debug!(path = %path.display(), "No memory config, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        let config = Self::from_yaml(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        info!(path = %path.display(), "Loaded memory config");
        Ok(config)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = if text.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(text)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Write the configuration into a project, creating directories.
    pub fn save(&self, project_root: &Path) -> Result<PathBuf> {
        self.validate()?;
        let path = Self::path_for(project_root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, self.to_yaml()?)?;
        Ok(path)
    }

    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;
        self.chunking.validate()?;
        self.sandbox.validate()?;
        if self.cache.capacity == 0 {
            return Err(Error::Config("cache capacity must be at least 1".into()));
        }
        if self.user_root.trim().is_empty() {
            return Err(Error::Config("user_root must not be empty".into()));
        }
        Ok(())
    }

    /// The user root with `~` and environment variables expanded.
    pub fn user_root_path(&self) -> Result<PathBuf> {
        let expanded = shellexpand::full(&self.user_root)
            .map_err(|e| Error::Config(format!("cannot expand user_root: {}", e)))?;
        Ok(PathBuf::from(expanded.as_ref()))
    }

    /// On-disk backend rooted at `project_root`.
    pub fn disk_backend(&self, project_root: &Path) -> Result<StorageBackend> {
        Ok(StorageBackend::Disk {
            project_root: project_root.to_path_buf(),
            user_root: self.user_root_path()?,
        })
    }

    pub fn with_policy(mut self, policy: PolicyConfig) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn with_linker(mut self, linker: LinkerConfig) -> Self {
        self.linker = linker;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxLimits) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_llm(mut self, llm: LlmConfig) -> Self {
        self.llm = llm;
        self
    }

    pub fn with_user_root(mut self, root: impl Into<String>) -> Self {
        self.user_root = root.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Provider;
    use crate::policy::Layer;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = MemoryConfig::default();
        assert_eq!(config.policy.read_layers, vec![Layer::ProjectAgent, Layer::ProjectGlobal]);
        assert_eq!(config.policy.write_layers, vec![Layer::ProjectAgent]);
        assert_eq!(config.policy.retention_days, 90);
        assert_eq!(config.chunking.min_tokens, 100);
        assert_eq!(config.chunking.max_tokens, 800);
        assert_eq!(config.linker.recency_window_secs, 300);
        assert_eq!(config.cache.capacity, 256);
        assert_eq!(config.sandbox.max_iterations, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml() {
        let config = MemoryConfig::from_yaml(
            "policy:\n  read_layers: [project_agent, project_global, user_global]\n  retention_days: 30\nsandbox:\n  max_iterations: 4\nllm:\n  provider: openai\n",
        )
        .unwrap();
        assert_eq!(config.policy.read_layers.len(), 3);
        assert_eq!(config.policy.retention_days, 30);
        assert_eq!(config.policy.write_layers, vec![Layer::ProjectAgent]);
        assert_eq!(config.sandbox.max_iterations, 4);
        assert_eq!(config.sandbox.max_depth, 3);
        assert_eq!(config.llm.provider, Some(Provider::OpenAI));
    }

    #[test]
    fn test_unsafe_write_layers_rejected() {
        let result = MemoryConfig::from_yaml("policy:\n  write_layers: [project_agent, user_global]\n");
        assert!(matches!(result, Err(Error::Config(_))));

        let allowed = MemoryConfig::from_yaml(
            "policy:\n  write_layers: [user_global]\n  allow_user_global_write: true\n",
        );
        assert!(allowed.is_ok());
    }

    #[test]
    fn test_unparseable_yaml() {
        assert!(matches!(
            MemoryConfig::from_yaml("policy: [not, a, map"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            MemoryConfig::from_yaml("chunking:\n  min_tokens: 900\n  max_tokens: 800\n"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_missing_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(MemoryConfig::load(dir.path()).unwrap(), MemoryConfig::default());

        let config = MemoryConfig::default()
            .with_sandbox(SandboxLimits::default().with_max_depth(1))
            .with_user_root("/tmp/rlm-user");
        let path = config.save(dir.path()).unwrap();
        assert!(path.ends_with(".agents/memory/config.yaml"));
        assert_eq!(MemoryConfig::load(dir.path()).unwrap(), config);
    }

    #[test]
    fn test_user_root_expansion() {
        let config = MemoryConfig::default().with_user_root("/srv/memory");
        assert_eq!(config.user_root_path().unwrap(), PathBuf::from("/srv/memory"));

        let home = MemoryConfig::default().user_root_path().unwrap();
        assert!(!home.to_string_lossy().starts_with('~'));
    }
}
