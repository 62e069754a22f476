//! Error types for rlm-mem.

use thiserror::Error;

/// Result type alias using rlm-mem's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during memory operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed fields or values outside their allowed range
    #[error("Validation error: {0}")]
    Validation(String),

    /// Disallowed layer access or content that could not be redacted
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// Unknown chunk id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Security breach inside a retrieval session
    #[error("Sandbox violation: {0}")]
    SandboxViolation(String),

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Iteration cap reached before a final answer
    #[error("Maximum iterations ({max_iterations}) reached without a final answer")]
    MaxIterations { max_iterations: u32 },

    /// A persisted record failed schema validation on read
    #[error("Storage corruption in {partition}: {detail}")]
    StorageCorruption { partition: String, detail: String },

    /// Memory storage error
    #[error("Memory storage error: {0}")]
    MemoryStorage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// LLM API error
    #[error("LLM API error: {provider} - {message}")]
    LlmApi { provider: String, message: String },

    /// LLM error (simple variant)
    #[error("LLM error: {0}")]
    LLM(String),

    /// Recursion depth exceeded
    #[error("Maximum recursion depth {max_depth} exceeded")]
    MaxDepthExceeded { max_depth: u32 },

    /// Budget exhausted
    #[error("Budget exhausted: {resource}")]
    BudgetExhausted { resource: String },

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a policy violation.
    pub fn policy(message: impl Into<String>) -> Self {
        Self::PolicyViolation(message.into())
    }

    /// Create a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a sandbox violation.
    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::SandboxViolation(message.into())
    }

    /// Create a storage corruption error.
    pub fn corruption(partition: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::StorageCorruption {
            partition: partition.into(),
            detail: detail.into(),
        }
    }

    /// Create an LLM API error.
    pub fn llm_api(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmApi {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a max iterations error.
    pub fn max_iterations(max_iterations: u32) -> Self {
        Self::MaxIterations { max_iterations }
    }

    /// Create a max depth exceeded error.
    pub fn max_depth_exceeded(max_depth: u32) -> Self {
        Self::MaxDepthExceeded { max_depth }
    }

    /// Create a budget exhausted error.
    pub fn budget_exhausted(resource: impl Into<String>) -> Self {
        Self::BudgetExhausted {
            resource: resource.into(),
        }
    }

    /// Stable class name reported in structured operation results.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::PolicyViolation(_) => "policy_violation",
            Self::NotFound(_) => "not_found",
            Self::SandboxViolation(_) => "sandbox_violation",
            Self::Timeout { .. } => "timeout",
            Self::MaxIterations { .. } => "max_iterations",
            Self::StorageCorruption { .. } => "storage_corruption",
            Self::MemoryStorage(_) | Self::Io(_) => "storage_error",
            Self::Serialization(_) => "serialization_error",
            Self::Config(_) => "config_error",
            Self::LlmApi { .. } | Self::LLM(_) => "llm_error",
            Self::MaxDepthExceeded { .. } => "max_depth_exceeded",
            Self::BudgetExhausted { .. } => "budget_exhausted",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether this error is one the operation boundary reports as a result
    /// rather than treating as an infrastructure failure.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::PolicyViolation(_) | Self::NotFound(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::MemoryStorage(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::validation("x").kind(), "validation_error");
        assert_eq!(Error::policy("x").kind(), "policy_violation");
        assert_eq!(Error::not_found("x").kind(), "not_found");
        assert_eq!(Error::sandbox("x").kind(), "sandbox_violation");
        assert_eq!(Error::timeout(10).kind(), "timeout");
        assert_eq!(Error::corruption("p", "bad").kind(), "storage_corruption");
    }

    #[test]
    fn test_caller_errors() {
        assert!(Error::validation("x").is_caller_error());
        assert!(Error::policy("x").is_caller_error());
        assert!(!Error::sandbox("x").is_caller_error());
        assert!(!Error::timeout(1).is_caller_error());
    }

    #[test]
    fn test_display() {
        let err = Error::corruption("project_global", "missing field `id`");
        assert_eq!(
            err.to_string(),
            "Storage corruption in project_global: missing field `id`"
        );
    }
}
