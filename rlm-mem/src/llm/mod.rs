//! Model clients used by the retrieval loop and by the reason operation.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rlm_mem::llm::{AnthropicClient, ChatMessage, ClientConfig, CompletionRequest, LLMClient};
//!
//! let client = AnthropicClient::new(
//!     ClientConfig::new("your-api-key").with_default_model("claude-3-5-haiku-20241022"),
//! )?;
//!
//! let request = CompletionRequest::new()
//!     .with_system("Answer from memory only")
//!     .with_message(ChatMessage::user("What auth scheme did we choose?"));
//!
//! let response = client.complete(request).await?;
//! ```

mod client;
mod types;

pub use client::{AnthropicClient, ClientConfig, LLMClient, LlmConfig, OpenAIClient, ScriptedClient};
pub use types::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, CostTracker, ModelSpec,
    Provider, StopReason, TokenUsage,
};
