//! Request, response and pricing types shared by the model clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Model provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
    /// In-process scripted responses
    Scripted,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic => write!(f, "anthropic"),
            Self::OpenAI => write!(f, "openai"),
            Self::Scripted => write!(f, "scripted"),
        }
    }
}

/// A model and its pricing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    pub provider: Provider,
    /// Input cost per million tokens (USD)
    pub input_cost_per_m: f64,
    /// Output cost per million tokens (USD)
    pub output_cost_per_m: f64,
}

impl ModelSpec {
    /// Calculate cost for given token usage.
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let input_cost = (input_tokens as f64 / 1_000_000.0) * self.input_cost_per_m;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * self.output_cost_per_m;
        input_cost + output_cost
    }

    fn priced(id: &str, provider: Provider, input: f64, output: f64) -> Self {
        Self {
            id: id.to_string(),
            provider,
            input_cost_per_m: input,
            output_cost_per_m: output,
        }
    }

    pub fn claude_sonnet() -> Self {
        Self::priced("claude-3-5-sonnet-20241022", Provider::Anthropic, 3.0, 15.0)
    }

    pub fn claude_haiku() -> Self {
        Self::priced("claude-3-5-haiku-20241022", Provider::Anthropic, 0.8, 4.0)
    }

    pub fn gpt4o() -> Self {
        Self::priced("gpt-4o", Provider::OpenAI, 2.5, 10.0)
    }

    pub fn gpt4o_mini() -> Self {
        Self::priced("gpt-4o-mini", Provider::OpenAI, 0.15, 0.60)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Completion request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model to use; the client's default when unset
    pub model: Option<String>,
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    /// Temperature (0.0 - 1.0)
    pub temperature: Option<f64>,
}

impl CompletionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 1.0));
        self
    }
}

/// Token usage of one completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub model: String,
    pub content: String,
    pub stop_reason: Option<StopReason>,
    pub usage: TokenUsage,
    pub timestamp: DateTime<Utc>,
    /// Cost in USD (if calculable)
    pub cost: Option<f64>,
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
}

/// Spend of a retrieval session or operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostTracker {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Total cost in USD
    pub total_cost: f64,
    pub request_count: u64,
    /// Requests per model
    pub by_model: HashMap<String, u64>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record usage from a completion response.
    pub fn record(&mut self, response: &CompletionResponse) {
        self.total_input_tokens += response.usage.input_tokens;
        self.total_output_tokens += response.usage.output_tokens;
        self.total_cost += response.cost.unwrap_or(0.0);
        self.request_count += 1;
        *self.by_model.entry(response.model.clone()).or_default() += 1;
    }

    /// Whether spending has reached `budget_usd`.
    pub fn exceeds(&self, budget_usd: Option<f64>) -> bool {
        budget_usd.is_some_and(|budget| self.total_cost >= budget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(model: &str, input: u64, output: u64, cost: f64) -> CompletionResponse {
        CompletionResponse {
            id: "r".into(),
            model: model.into(),
            content: String::new(),
            stop_reason: Some(StopReason::EndTurn),
            usage: TokenUsage {
                input_tokens: input,
                output_tokens: output,
            },
            timestamp: Utc::now(),
            cost: Some(cost),
        }
    }

    #[test]
    fn test_model_cost_calculation() {
        let sonnet = ModelSpec::claude_sonnet();
        // 1M input + 500k output
        let cost = sonnet.calculate_cost(1_000_000, 500_000);
        // 1M * $3/M + 0.5M * $15/M = $3 + $7.5 = $10.5
        assert!((cost - 10.5).abs() < 0.01);
    }

    #[test]
    fn test_completion_request_builder() {
        let req = CompletionRequest::new()
            .with_model("gpt-4o-mini")
            .with_system("Answer from memory only")
            .with_message(ChatMessage::user("Hi"))
            .with_max_tokens(1000)
            .with_temperature(1.7);

        assert_eq!(req.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.max_tokens, Some(1000));
        assert_eq!(req.temperature, Some(1.0));
    }

    #[test]
    fn test_cost_tracker_and_budget() {
        let mut tracker = CostTracker::new();
        tracker.record(&response("m", 1000, 500, 0.01));
        tracker.record(&response("m", 2000, 1000, 0.02));

        assert_eq!(tracker.total_input_tokens, 3000);
        assert_eq!(tracker.total_output_tokens, 1500);
        assert_eq!(tracker.request_count, 2);
        assert_eq!(tracker.by_model.get("m"), Some(&2));
        assert!(tracker.exceeds(Some(0.025)));
        assert!(!tracker.exceeds(Some(0.5)));
        assert!(!tracker.exceeds(None));
    }
}
