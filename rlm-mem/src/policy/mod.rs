//! Memory policy: which layers an identity may read and write.
//!
//! Policy is explicit. A [`PolicyResolver`] is built once from configuration
//! and handed to the store; every call resolves the caller's [`Identity`]
//! into a [`ResolvedPolicy`] listing concrete partitions. Cross-scope access
//! is denied by default:
//!
//! - user layers are writable only with `allow_user_global_write`
//! - agent layers belong to one agent unless an [`AccessGrant`] shares them
//!
//! ## Example
//!
//! ```rust,ignore
//! use rlm_mem::policy::{Identity, Layer, PolicyConfig, PolicyResolver};
//!
//! let resolver = PolicyResolver::new(PolicyConfig::default())?;
//! let resolved = resolver.resolve(&Identity::new("my-project", "coder"))?;
//! let target = resolved.write_partition(Layer::ProjectAgent)?;
//! let clean = resolved.redact("password=hunter2")?;
//! ```

mod redaction;
mod resolver;
mod types;

pub use redaction::{Redacted, Redactor, REDACTED};
pub use resolver::{PolicyResolver, ResolvedPolicy};
pub use types::{
    AccessGrant, Identity, Layer, PartitionKey, PolicyConfig, Scope, DEFAULT_REDACTION_RULES,
};
