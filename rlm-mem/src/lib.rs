//! # rlm-mem
//!
//! Durable, scope-isolated memory for autonomous agents, with bounded
//! recursive retrieval.
//!
//! ## Core Components
//!
//! - **Policy**: which memory layers an agent may read and write
//! - **Memory**: layered, append-only chunk storage with a provenance graph
//! - **Chunking**: splitting free text into bounded, typed chunks
//! - **Cache**: read-through cache invalidated by store writes
//! - **Sandbox**: retrieval sessions driven by a model over a closed command set
//! - **Ops**: the `remember`, `recall` and `reason` operations
//!
//! ## Example
//!
//! ```rust,ignore
//! use rlm_mem::{Identity, MemoryEngine, RecallRequest, RememberRequest};
//!
//! let engine = MemoryEngine::open(project_root)?;
//! let me = Identity::new("my-project", "coder");
//!
//! engine.remember(&me, RememberRequest::new("We decided to use JWT for the API.", "conv-1"))?;
//! let recalled = engine.recall(&me, RecallRequest::new("How does the API authenticate?")).await?;
//! if let Some(answer) = recalled.answer {
//!     println!("{} (confidence {:.2})", answer, recalled.confidence);
//! }
//! ```

pub mod cache;
pub mod chunking;
pub mod config;
pub mod error;
pub mod llm;
pub mod memory;
pub mod ops;
pub mod policy;
pub mod sandbox;

// Re-exports for convenience
pub use cache::{CacheConfig, CacheStats, CachedStore, MemoryCache};
pub use chunking::{count_tokens, ChunkingConfig, ChunkingEngine};
pub use config::MemoryConfig;
pub use error::{Error, Result};
pub use llm::{
    AnthropicClient, ClientConfig, CompletionRequest, CompletionResponse, LLMClient, LlmConfig,
    OpenAIClient, Provider, ScriptedClient,
};
pub use memory::{
    ChunkFilter, ChunkId, ChunkType, Edge, EdgeType, LayeredMemoryStore, MemoryChunk, NewChunk,
    StorageBackend,
};
pub use ops::{
    AnalysisType, Contradiction, ImportReport, LinkRequest, LinkResult, MemoryEngine,
    OperationError, ReasonRequest, ReasonResult, RecallRequest, RecallResult, RememberRequest,
    RememberResult,
};
pub use policy::{Identity, Layer, PolicyConfig, PolicyResolver};
pub use sandbox::{
    CancelHandle, FailureReason, RetrievalSession, Sandbox, SandboxLimits, SessionOutcome,
    SessionStatus,
};
