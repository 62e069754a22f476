//! Ordered record of what a retrieval session did.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Kinds of trace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceEventType {
    /// Session started
    Start,
    /// Model call issued
    ModelCall,
    /// Command accepted for execution
    Command,
    /// Command output fed back to the model
    Result,
    /// Instruction rejected without executing
    Rejection,
    /// Nested retrieval loop started
    RecurseStart,
    /// Nested retrieval loop returned
    RecurseEnd,
    /// Final answer accepted
    Final,
    /// Limits reached before a final answer
    Exhausted,
    /// Session failed
    Failure,
}

impl std::fmt::Display for TraceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Start => "START",
            Self::ModelCall => "MODEL_CALL",
            Self::Command => "COMMAND",
            Self::Result => "RESULT",
            Self::Rejection => "REJECTION",
            Self::RecurseStart => "RECURSE_START",
            Self::RecurseEnd => "RECURSE_END",
            Self::Final => "FINAL",
            Self::Exhausted => "EXHAUSTED",
            Self::Failure => "FAILURE",
        };
        write!(f, "{}", s)
    }
}

/// One step of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub event_type: TraceEventType,
    /// Nesting depth (0 = top-level loop)
    pub depth: u32,
    /// Model calls made so far
    pub iteration: u32,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    pub timestamp: DateTime<Utc>,
}

impl TraceEvent {
    pub fn new(
        event_type: TraceEventType,
        depth: u32,
        iteration: u32,
        content: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            depth,
            iteration,
            content: content.into(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref()?.get(key)
    }

    /// Format as a single-line log entry.
    pub fn as_log_line(&self) -> String {
        let indent = "  ".repeat(self.depth as usize);
        format!(
            "[{}] {}{} #{}: {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            indent,
            self.event_type,
            self.iteration,
            self.content.lines().next().unwrap_or("")
        )
    }
}

/// Events of one session, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionTrace {
    events: Vec<TraceEvent>,
}

impl SessionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: TraceEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events of a type.
    pub fn count(&self, event_type: TraceEventType) -> usize {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn last(&self) -> Option<&TraceEvent> {
        self.events.last()
    }

    /// The whole trace as log lines.
    pub fn render(&self) -> String {
        self.events
            .iter()
            .map(TraceEvent::as_log_line)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
