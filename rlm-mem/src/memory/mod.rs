//! Layered, policy-scoped chunk storage.
//!
//! Chunks live in one append-only log per partition, where a partition is a
//! layer plus, for agent-scoped layers, the owning agent:
//!
//! - **project_agent**: private to one agent within one project
//! - **project_global**: shared by all agents of a project
//! - **user_agent**: one agent's memory across projects
//! - **user_global**: shared by everything the user runs
//!
//! Reads resolve narrowest layer first. Updates and deletes append new
//! records; compaction reclaims the superseded ones.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rlm_mem::memory::{LayeredMemoryStore, NewChunk};
//! use rlm_mem::policy::{Identity, PolicyConfig, PolicyResolver};
//!
//! let store = LayeredMemoryStore::in_memory(PolicyResolver::new(PolicyConfig::default())?);
//! let me = Identity::new("my-project", "coder");
//!
//! let chunk = store.create(&me, NewChunk::new("We use JWT for auth", "conv-1"), None)?;
//! let hits = store.search(&me, "authentication jwt", 5, None)?;
//! ```

mod linker;
mod partition;
mod schema;
mod search;
mod store;
mod types;

pub use linker::{follows_strength, related_strength, AutoLinker, LinkerConfig};
pub use partition::{CompactionReport, PartitionStats, Tombstone};
pub use schema::{get_schema_version, initialize_schema, is_initialized, SCHEMA_VERSION};
pub use search::{score_chunks, tokenize, weighted_confidence};
pub use store::{LayeredMemoryStore, PartitionObserver, StorageBackend};
pub use types::{
    validate_id, ChunkFilter, ChunkId, ChunkMetadata, ChunkType, ChunkUpdate, Edge, EdgeKey,
    EdgeType, MemoryChunk, NewChunk, ScoredChunk, MAX_ID_LEN,
};
