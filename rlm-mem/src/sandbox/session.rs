//! Bounded recursive retrieval sessions.
//!
//! A session drives a model through a loop of retrieval commands until it
//! submits a final answer:
//!
//! ```text
//! Created -> Executing -> { Executing | Completed | Failed }
//! ```
//!
//! Every command runs under the per-command timeout and the session deadline,
//! and is checked for cancellation at entry and exit. Model calls, nested
//! ones included, count against the iteration cap. Hitting the cap or the
//! cost budget ends the session as exhausted, which is a normal outcome.
//! Sessions only read from the store.

use futures::future::{self, BoxFuture, Either};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::command::{parse_instruction, Command, Parsed};
use super::limits::{clip, SandboxLimits};
use super::trace::{SessionTrace, TraceEvent, TraceEventType};
use crate::cache::CachedStore;
use crate::error::{Error, Result};
use crate::llm::{ChatMessage, CompletionRequest, CompletionResponse, CostTracker, LLMClient};
use crate::memory::{ChunkFilter, ChunkId, MemoryChunk};
use crate::policy::Identity;

const SYSTEM_PROMPT: &str = "You answer questions from a memory store by issuing retrieval commands.
Reply with exactly one JSON object per turn, chosen from:
  {\"op\": \"search\", \"query\": \"...\", \"limit\": 5}
  {\"op\": \"read\", \"id\": \"chunk-...\"}
  {\"op\": \"list_by_tag\", \"tags\": [\"...\"], \"limit\": 10}
  {\"op\": \"get_links\", \"id\": \"chunk-...\", \"edge_type\": \"related_to\"}
  {\"op\": \"ask\", \"prompt\": \"...\", \"context_ids\": [\"chunk-...\"], \"recursive\": false}
  {\"op\": \"final\", \"answer\": \"...\", \"confidence\": 0.8, \"source_ids\": [\"chunk-...\"]}
The result of each command arrives in the next message. Answer only from retrieved memory; \
if nothing relevant exists, say so in the final answer.";

const ASK_PROMPT: &str =
    "Answer the question using only the supplied memory excerpts. Be brief.";

const TRUNCATION_NOTE: &str = " [truncated]";

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Executing,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Why a session failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Violation,
    Timeout,
    Cancelled,
    /// Model or storage failure
    Error,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Violation => "violation",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Completed,
    /// Limits reached without a final answer
    Exhausted,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Exhausted => "exhausted",
            Self::Failed => "failed",
        }
    }
}

/// Everything a finished session reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub status: SessionStatus,
    pub answer: Option<String>,
    pub confidence: f64,
    pub source_ids: Vec<ChunkId>,
    pub iterations_used: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cost_usd: f64,
    pub elapsed_ms: u64,
    pub trace: Vec<TraceEvent>,
}

/// Reply to one submitted instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum StepReply {
    /// Text fed back to the model
    Feedback(String),
    /// An accepted final answer
    Final(String),
}

/// Cancels a running session from another task.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

/// Opens sessions over a shared store and model.
#[derive(Clone)]
pub struct Sandbox {
    store: CachedStore,
    llm: Arc<dyn LLMClient>,
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn new(store: CachedStore, llm: Arc<dyn LLMClient>, limits: SandboxLimits) -> Self {
        Self { store, llm, limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// A fresh session for one retrieval attempt.
    pub fn session(&self, identity: &Identity) -> RetrievalSession {
        RetrievalSession::new(
            self.store.clone(),
            identity.clone(),
            Arc::clone(&self.llm),
            self.limits.clone(),
        )
    }
}

/// Internal ways a session stops early.
enum Halt {
    Exhausted(Error),
    Failed(FailureReason, Error),
}

struct FinalAnswer {
    answer: String,
    confidence: Option<f64>,
    source_ids: Vec<ChunkId>,
}

/// One bounded retrieval attempt. Never shared between callers.
pub struct RetrievalSession {
    store: CachedStore,
    identity: Identity,
    llm: Arc<dyn LLMClient>,
    limits: SandboxLimits,
    state: SessionState,
    iterations: u32,
    started: Option<Instant>,
    cost: CostTracker,
    trace: SessionTrace,
    /// Chunks returned by commands, with their confidence
    seen: Vec<(ChunkId, f64)>,
    final_answer: Option<FinalAnswer>,
    exhausted: Option<String>,
    failure: Option<(FailureReason, String)>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl RetrievalSession {
    pub fn new(
        store: CachedStore,
        identity: Identity,
        llm: Arc<dyn LLMClient>,
        limits: SandboxLimits,
    ) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            store,
            identity,
            llm,
            limits,
            state: SessionState::Created,
            iterations: 0,
            started: None,
            cost: CostTracker::new(),
            trace: SessionTrace::new(),
            seen: Vec::new(),
            final_answer: None,
            exhausted: None,
            failure: None,
            cancel_tx: Arc::new(tx),
            cancel_rx: rx,
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancel_tx))
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn trace(&self) -> &SessionTrace {
        &self.trace
    }

    /// Drive the model until it answers or a limit ends the session.
    pub async fn run(mut self, query: &str) -> SessionOutcome {
        if self.state.is_terminal() {
            warn!("Run requested on a finished session");
            return self.finish();
        }
        self.begin(query);
        if let Err(halt) = self.drive(query.to_string(), 0).await {
            self.halt(halt);
        }
        self.finish()
    }

    /// Execute one instruction at the top level, without a driving model.
    pub async fn submit(&mut self, instruction: &str) -> Result<StepReply> {
        if self.state.is_terminal() {
            let repeated_final = matches!(
                parse_instruction(instruction, self.limits.max_buffer_bytes),
                Parsed::Command(Command::Final { .. })
            );
            if repeated_final
                && self.state == SessionState::Completed
                && self.final_answer.is_some()
            {
                self.halt(Halt::Failed(
                    FailureReason::Violation,
                    Error::sandbox("final answer already submitted"),
                ));
            }
            return Err(Error::sandbox("session already complete"));
        }
        self.begin("direct submission");
        match self.step(instruction, 0).await {
            Ok(reply) => Ok(reply),
            Err(halt) => Err(self.halt(halt)),
        }
    }

    fn result_cap(&self) -> usize {
        self.limits.max_results.max(1)
    }

    /// Close the session and report its outcome.
    pub fn finish(self) -> SessionOutcome {
        let elapsed_ms = self
            .started
            .map(|s| s.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let seen_ids: Vec<ChunkId> = self.seen.iter().map(|(id, _)| id.clone()).collect();

        let (status, answer, confidence, source_ids, failure, error) =
            if let Some((reason, message)) = self.failure {
                (SessionStatus::Failed, None, 0.0, seen_ids, Some(reason), Some(message))
            } else if let Some(last) = self.final_answer {
                let sources = if last.source_ids.is_empty() {
                    seen_ids
                } else {
                    last.source_ids
                };
                let confidence = match last.confidence {
                    Some(c) => c.clamp(0.0, 1.0),
                    None => mean_confidence(&self.seen, &sources),
                };
                (SessionStatus::Completed, Some(last.answer), confidence, sources, None, None)
            } else {
                let message = self
                    .exhausted
                    .unwrap_or_else(|| "session ended without a final answer".to_string());
                (SessionStatus::Exhausted, None, 0.0, seen_ids, None, Some(message))
            };

        SessionOutcome {
            status,
            answer,
            confidence,
            source_ids,
            iterations_used: self.iterations,
            failure,
            error,
            cost_usd: self.cost.total_cost,
            elapsed_ms,
            trace: self.trace.into_events(),
        }
    }

    fn begin(&mut self, query: &str) {
        if self.state != SessionState::Created {
            return;
        }
        self.started = Some(Instant::now());
        self.transition(SessionState::Executing);
        let event = self.event(TraceEventType::Start, 0, query);
        self.trace.push(event);
        info!(identity = %self.identity, max_iterations = self.limits.max_iterations, "Retrieval session started");
    }

    fn transition(&mut self, to: SessionState) {
        debug!(from = ?self.state, to = ?to, "Session state change");
        self.state = to;
    }

    fn halt(&mut self, halt: Halt) -> Error {
        match halt {
            Halt::Exhausted(error) => {
                info!(iterations = self.iterations, %error, "Retrieval session exhausted");
                let event = self.event(TraceEventType::Exhausted, 0, error.to_string());
                self.trace.push(event);
                self.exhausted = Some(error.to_string());
                self.transition(SessionState::Completed);
                error
            }
            Halt::Failed(reason, error) => {
                warn!(reason = reason.as_str(), %error, "Retrieval session failed");
                let event = self
                    .event(TraceEventType::Failure, 0, error.to_string())
                    .with_metadata("reason", reason.as_str());
                self.trace.push(event);
                self.failure = Some((reason, error.to_string()));
                self.transition(SessionState::Failed);
                error
            }
        }
    }

    fn event(&self, event_type: TraceEventType, depth: u32, content: impl Into<String>) -> TraceEvent {
        TraceEvent::new(event_type, depth, self.iterations, content)
    }

    fn deadline(&self) -> Instant {
        self.started.unwrap_or_else(Instant::now) + self.limits.session_timeout()
    }

    /// Cancellation and deadline check at command boundaries.
    fn checkpoint(&self) -> std::result::Result<(), Halt> {
        if *self.cancel_rx.borrow() {
            return Err(Halt::Failed(
                FailureReason::Cancelled,
                Error::sandbox("session cancelled"),
            ));
        }
        if Instant::now() >= self.deadline() {
            return Err(Halt::Failed(
                FailureReason::Timeout,
                Error::timeout(self.limits.session_timeout_ms),
            ));
        }
        Ok(())
    }

    /// Time the next command may take.
    fn command_budget(&self) -> std::result::Result<Duration, Halt> {
        self.checkpoint()?;
        let remaining = self.deadline().saturating_duration_since(Instant::now());
        Ok(remaining.min(self.limits.command_timeout()))
    }

    fn drive(&mut self, query: String, depth: u32) -> BoxFuture<'_, std::result::Result<String, Halt>> {
        Box::pin(async move {
            let mut messages = vec![ChatMessage::user(opening(&query, depth, &self.limits))];
            loop {
                let request = CompletionRequest::new()
                    .with_system(SYSTEM_PROMPT)
                    .with_messages(messages.clone())
                    .with_max_tokens(1024);
                let response = self.call_model(request, depth).await?;
                let reply = self.step(&response.content, depth).await?;

                let (turn, _) = clip(&response.content, self.limits.max_buffer_bytes);
                messages.push(ChatMessage::assistant(turn));
                match reply {
                    StepReply::Feedback(feedback) => messages.push(ChatMessage::user(feedback)),
                    StepReply::Final(answer) => return Ok(answer),
                }
            }
        })
    }

    async fn call_model(
        &mut self,
        request: CompletionRequest,
        depth: u32,
    ) -> std::result::Result<CompletionResponse, Halt> {
        if self.iterations >= self.limits.max_iterations {
            return Err(Halt::Exhausted(Error::max_iterations(self.limits.max_iterations)));
        }
        if self.cost.exceeds(self.limits.max_cost_usd) {
            return Err(Halt::Exhausted(Error::budget_exhausted(format!(
                "${:.4} spent",
                self.cost.total_cost
            ))));
        }
        let budget = self.command_budget()?;

        self.iterations += 1;
        let event = self.event(TraceEventType::ModelCall, depth, format!("model call {}", self.iterations));
        self.trace.push(event);

        let llm = Arc::clone(&self.llm);
        let call = tokio::time::timeout(budget, async move { llm.complete(request).await });
        let response = match self.guarded(call).await? {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(Halt::Failed(FailureReason::Error, e)),
            Err(_) => {
                return Err(Halt::Failed(
                    FailureReason::Timeout,
                    Error::timeout(budget.as_millis() as u64),
                ))
            }
        };
        self.cost.record(&response);
        Ok(response)
    }

    /// Race `work` against cancellation.
    async fn guarded<F: Future>(&self, work: F) -> std::result::Result<F::Output, Halt> {
        let mut cancel = self.cancel_rx.clone();
        let cancelled = async move {
            let closed = cancel.wait_for(|c| *c).await.is_err();
            if closed {
                future::pending::<()>().await;
            }
        };
        let work = pin!(work);
        let cancelled = pin!(cancelled);
        match future::select(work, cancelled).await {
            Either::Left((output, _)) => Ok(output),
            Either::Right(_) => Err(Halt::Failed(
                FailureReason::Cancelled,
                Error::sandbox("session cancelled"),
            )),
        }
    }

    async fn step(&mut self, raw: &str, depth: u32) -> std::result::Result<StepReply, Halt> {
        self.checkpoint()?;
        match parse_instruction(raw, self.limits.max_buffer_bytes) {
            Parsed::Violation(reason) => {
                warn!(depth, %reason, "Rejected sandbox instruction");
                let event = self
                    .event(TraceEventType::Rejection, depth, reason.as_str())
                    .with_metadata("fatal", true);
                self.trace.push(event);
                Err(Halt::Failed(FailureReason::Violation, Error::sandbox(reason)))
            }
            Parsed::Malformed(problem) => {
                warn!(depth, %problem, "Unusable sandbox instruction");
                let event = self
                    .event(TraceEventType::Rejection, depth, problem.as_str())
                    .with_metadata("fatal", false);
                self.trace.push(event);
                Ok(StepReply::Feedback(format!(
                    "Error: {}. Reply with exactly one JSON command.",
                    problem
                )))
            }
            Parsed::Command(command) => {
                debug!(depth, op = command.op(), "Executing sandbox command");
                let event = self.event(TraceEventType::Command, depth, command.describe());
                self.trace.push(event);

                let started = Instant::now();
                let reply = self.execute(command, depth).await?;
                self.checkpoint()?;
                if started.elapsed() > self.limits.command_timeout() {
                    return Err(Halt::Failed(
                        FailureReason::Timeout,
                        Error::timeout(self.limits.command_timeout_ms),
                    ));
                }

                if let StepReply::Feedback(text) = &reply {
                    let preview: String = text.chars().take(200).collect();
                    let event = self
                        .event(TraceEventType::Result, depth, preview)
                        .with_metadata("bytes", text.len() as u64);
                    self.trace.push(event);
                }
                Ok(reply)
            }
        }
    }

    async fn execute(
        &mut self,
        command: Command,
        depth: u32,
    ) -> std::result::Result<StepReply, Halt> {
        let edge_filter = command.edge_filter();
        let output = match command {
            Command::Read { id } => {
                let id = parse_id(&id)?;
                match self.store.peek(&self.identity, &id) {
                    Ok(Some(chunk)) => {
                        self.saw(&chunk);
                        json!({ "chunk": chunk_view(&chunk) })
                    }
                    Ok(None) => json!({ "error": format!("chunk {} not found", id) }),
                    Err(e) => absorb(e)?,
                }
            }
            Command::Search { query, limit } => {
                let limit = limit.unwrap_or(5).clamp(1, self.result_cap());
                match self.store.search(&self.identity, &query, limit, None) {
                    Ok(hits) => {
                        let mut results = Vec::with_capacity(hits.len());
                        for hit in &hits {
                            self.saw(&hit.chunk);
                            let mut view = chunk_view(&hit.chunk);
                            view["score"] = json!((hit.score * 1000.0).round() / 1000.0);
                            results.push(view);
                        }
                        json!({ "hits": results })
                    }
                    Err(e) => absorb(e)?,
                }
            }
            Command::ListByTag { tags, limit } => {
                let mut filter = ChunkFilter::new()
                    .with_limit(limit.unwrap_or(10).clamp(1, self.result_cap()));
                for tag in tags {
                    filter = filter.with_tag(tag);
                }
                match self.store.list(&self.identity, &filter) {
                    Ok(chunks) => {
                        for chunk in &chunks {
                            self.saw(chunk);
                        }
                        json!({ "chunks": chunks.iter().map(chunk_view).collect::<Vec<_>>() })
                    }
                    Err(e) => absorb(e)?,
                }
            }
            Command::GetLinks { id, .. } => {
                let id = parse_id(&id)?;
                match self.store.store().get_links(&self.identity, &id, edge_filter) {
                    Ok(links) => {
                        let mut results = Vec::with_capacity(links.len());
                        for (edge, target) in links.iter().take(self.limits.max_results) {
                            self.saw(target);
                            results.push(json!({
                                "edge_type": edge.edge_type.name(),
                                "strength": edge.strength,
                                "target": chunk_view(target),
                            }));
                        }
                        json!({ "links": results })
                    }
                    Err(e) => absorb(e)?,
                }
            }
            Command::Ask {
                prompt,
                context_ids,
                recursive,
            } => {
                if recursive {
                    return self.ask_recursive(prompt, context_ids, depth).await;
                }
                return self.ask(prompt, context_ids, depth).await;
            }
            Command::Final {
                answer,
                confidence,
                source_ids,
            } => {
                let (answer, _) = clip(&answer, self.limits.max_buffer_bytes);
                let event = self.event(TraceEventType::Final, depth, answer.as_str());
                self.trace.push(event);
                if depth == 0 {
                    let mut sources = Vec::with_capacity(source_ids.len());
                    for raw in &source_ids {
                        sources.push(parse_id(raw)?);
                    }
                    info!(iterations = self.iterations, "Retrieval session answered");
                    self.final_answer = Some(FinalAnswer {
                        answer: answer.clone(),
                        confidence,
                        source_ids: sources,
                    });
                    self.transition(SessionState::Completed);
                }
                return Ok(StepReply::Final(answer));
            }
        };
        Ok(StepReply::Feedback(self.bounded(&output)))
    }

    async fn ask(
        &mut self,
        prompt: String,
        context_ids: Vec<String>,
        depth: u32,
    ) -> std::result::Result<StepReply, Halt> {
        let mut context = String::new();
        for raw in &context_ids {
            let id = parse_id(raw)?;
            match self.store.peek(&self.identity, &id) {
                Ok(Some(chunk)) => {
                    self.saw(&chunk);
                    context.push_str(&format!("[{}] {}\n", chunk.id, chunk.content));
                }
                Ok(None) => {}
                Err(e) => {
                    absorb(e)?;
                }
            }
        }
        let (context, _) = clip(&context, self.limits.max_buffer_bytes);
        let message = if context.is_empty() {
            prompt
        } else {
            format!("Memory excerpts:\n{}\nQuestion: {}", context, prompt)
        };

        let request = CompletionRequest::new()
            .with_system(ASK_PROMPT)
            .with_message(ChatMessage::user(message))
            .with_max_tokens(1024);
        let response = self.call_model(request, depth).await?;
        Ok(StepReply::Feedback(
            self.bounded(&json!({ "answer": response.content })),
        ))
    }

    async fn ask_recursive(
        &mut self,
        prompt: String,
        context_ids: Vec<String>,
        depth: u32,
    ) -> std::result::Result<StepReply, Halt> {
        let child = depth + 1;
        if child > self.limits.max_depth {
            let message = Error::max_depth_exceeded(self.limits.max_depth).to_string();
            warn!(depth, "Recursive ask beyond depth limit");
            let event = self
                .event(TraceEventType::Rejection, depth, message.as_str())
                .with_metadata("fatal", false);
            self.trace.push(event);
            return Ok(StepReply::Feedback(format!(
                "Error: {}. Ask without `recursive` or answer with what you have.",
                message
            )));
        }

        let query = if context_ids.is_empty() {
            prompt
        } else {
            format!("{}\nStart from chunks: {}", prompt, context_ids.join(", "))
        };
        let event = self.event(TraceEventType::RecurseStart, child, query.as_str());
        self.trace.push(event);

        let answer = self.drive(query, child).await?;

        let event = self.event(TraceEventType::RecurseEnd, child, answer.as_str());
        self.trace.push(event);
        Ok(StepReply::Feedback(self.bounded(&json!({ "answer": answer }))))
    }

    fn saw(&mut self, chunk: &MemoryChunk) {
        if !self.seen.iter().any(|(id, _)| id == &chunk.id) {
            self.seen.push((chunk.id.clone(), chunk.metadata.confidence));
        }
    }

    fn bounded(&self, value: &Value) -> String {
        let text = value.to_string();
        let room = self
            .limits
            .max_buffer_bytes
            .saturating_sub(TRUNCATION_NOTE.len());
        let (mut text, truncated) = clip(&text, room);
        if truncated {
            text.push_str(TRUNCATION_NOTE);
        }
        text
    }
}

fn opening(query: &str, depth: u32, limits: &SandboxLimits) -> String {
    if depth == 0 {
        format!(
            "Question: {}\n\nThis session allows {} model calls in total.",
            query, limits.max_iterations
        )
    } else {
        format!(
            "Sub-question (depth {} of {}): {}\n\nAnswer it with `final`; the answer returns to the outer question.",
            depth, limits.max_depth, query
        )
    }
}

fn parse_id(raw: &str) -> std::result::Result<ChunkId, Halt> {
    ChunkId::parse(raw).map_err(|_| {
        Halt::Failed(
            FailureReason::Violation,
            Error::sandbox(format!("invalid chunk id {:?}", raw)),
        )
    })
}

/// Caller-class store errors become feedback; anything else fails the session.
fn absorb(error: Error) -> std::result::Result<Value, Halt> {
    if error.is_caller_error() {
        Ok(json!({ "error": error.to_string() }))
    } else {
        Err(Halt::Failed(FailureReason::Error, error))
    }
}

fn chunk_view(chunk: &MemoryChunk) -> Value {
    json!({
        "id": chunk.id.as_str(),
        "type": chunk.chunk_type.name(),
        "layer": chunk.layer.name(),
        "content": chunk.content,
        "tags": chunk.tags,
        "confidence": chunk.metadata.confidence,
        "created_at": chunk.metadata.created_at.to_rfc3339(),
    })
}

fn mean_confidence(seen: &[(ChunkId, f64)], sources: &[ChunkId]) -> f64 {
    let values: Vec<f64> = seen
        .iter()
        .filter(|(id, _)| sources.contains(id))
        .map(|(_, c)| c.clamp(0.0, 1.0))
        .collect();
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::llm::{ModelSpec, Provider, ScriptedClient};
    use crate::memory::{LayeredMemoryStore, NewChunk};
    use crate::policy::{PolicyConfig, PolicyResolver};
    use async_trait::async_trait;

    struct Fixture {
        store: CachedStore,
        identity: Identity,
        chunk_id: ChunkId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(LayeredMemoryStore::in_memory(
            PolicyResolver::new(PolicyConfig::default()).unwrap(),
        ));
        let cached = CachedStore::new(store, Arc::new(MemoryCache::new(64))).unwrap();
        let identity = Identity::new("proj", "agent");
        let chunk = cached
            .store()
            .create(
                &identity,
                NewChunk::new("We chose JWT for API authentication", "conv-1")
                    .with_tags(["auth"])
                    .with_confidence(0.9),
                None,
            )
            .unwrap();
        Fixture {
            store: cached,
            identity,
            chunk_id: chunk.id,
        }
    }

    fn session(f: &Fixture, client: Arc<ScriptedClient>, limits: SandboxLimits) -> RetrievalSession {
        RetrievalSession::new(f.store.clone(), f.identity.clone(), client, limits)
    }

    struct SlowClient;

    #[async_trait]
    impl LLMClient for SlowClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(Error::LLM("too slow".into()))
        }

        fn provider(&self) -> Provider {
            Provider::Scripted
        }

        fn available_models(&self) -> Vec<ModelSpec> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_completes_with_final_answer() {
        let f = fixture();
        let client = Arc::new(ScriptedClient::new([
            r#"{"op": "search", "query": "api authentication"}"#.to_string(),
            format!(
                r#"Found it. {{"op": "final", "answer": "JWT", "source_ids": ["{}"]}}"#,
                f.chunk_id
            ),
        ]));
        let outcome = session(&f, client, SandboxLimits::default())
            .run("How do we authenticate?")
            .await;

        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.answer.as_deref(), Some("JWT"));
        assert_eq!(outcome.iterations_used, 2);
        assert_eq!(outcome.source_ids, vec![f.chunk_id.clone()]);
        assert!((outcome.confidence - 0.9).abs() < 1e-9);
        assert!(outcome.trace.iter().any(|e| e.event_type == TraceEventType::Final));
    }

    #[tokio::test]
    async fn test_iteration_cap_is_graceful() {
        let f = fixture();
        let search = r#"{"op": "search", "query": "auth"}"#;
        let client = Arc::new(ScriptedClient::new([search, search, search]));
        let outcome = session(&f, client.clone(), SandboxLimits::default().with_max_iterations(2))
            .run("needs three calls")
            .await;

        assert_eq!(outcome.status, SessionStatus::Exhausted);
        assert_eq!(outcome.answer, None);
        assert_eq!(outcome.iterations_used, 2);
        assert_eq!(client.remaining(), 1);
    }

    #[tokio::test]
    async fn test_violation_fails_session() {
        let f = fixture();
        let client = Arc::new(ScriptedClient::new([r#"{"op": "delete", "id": "x"}"#]));
        let outcome = session(&f, client, SandboxLimits::default()).run("q").await;

        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(outcome.failure, Some(FailureReason::Violation));
        assert!(outcome.error.unwrap().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_rejected_instruction_has_no_side_effects() {
        let f = fixture();
        let client = Arc::new(ScriptedClient::new(Vec::<String>::new()));
        let mut session = session(&f, client, SandboxLimits::default());

        let result = session
            .submit(r#"{"op": "search", "query": "auth", "__import__": "os"}"#)
            .await;
        assert!(matches!(result, Err(Error::SandboxViolation(_))));
        assert_eq!(session.state(), SessionState::Failed);

        let stats = f.store.cache().stats().unwrap();
        assert_eq!(stats.hits + stats.misses, 0);

        let again = session
            .submit(&format!(r#"{{"op": "read", "id": "{}"}}"#, f.chunk_id))
            .await;
        assert!(again.unwrap_err().to_string().contains("session already complete"));
    }

    #[tokio::test]
    async fn test_second_final_fails_session() {
        let f = fixture();
        let client = Arc::new(ScriptedClient::new(Vec::<String>::new()));
        let mut session = session(&f, client, SandboxLimits::default());

        let first = session.submit(r#"{"op": "final", "answer": "one"}"#).await.unwrap();
        assert_eq!(first, StepReply::Final("one".into()));
        assert_eq!(session.state(), SessionState::Completed);

        assert!(session.submit(r#"{"op": "final", "answer": "two"}"#).await.is_err());
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.finish().status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_final_after_exhaustion_keeps_status() {
        let f = fixture();
        let client = Arc::new(ScriptedClient::new(["JWT"]));
        let mut session = session(&f, client, SandboxLimits::default().with_max_iterations(1));

        session.submit(r#"{"op": "ask", "prompt": "Which scheme?"}"#).await.unwrap();
        assert!(session.submit(r#"{"op": "ask", "prompt": "Again?"}"#).await.is_err());
        assert_eq!(session.state(), SessionState::Completed);

        let late = session.submit(r#"{"op": "final", "answer": "JWT"}"#).await;
        assert!(late.unwrap_err().to_string().contains("session already complete"));
        let outcome = session.finish();
        assert_eq!(outcome.status, SessionStatus::Exhausted);
        assert_eq!(outcome.failure, None);
    }

    #[tokio::test]
    async fn test_search_for_code_terms_completes() {
        let f = fixture();
        let code = f
            .store
            .store()
            .create(&f.identity, NewChunk::new("The build script shells out via subprocess", "conv-2"), None)
            .unwrap();
        let client = Arc::new(ScriptedClient::new([
            r#"{"op": "search", "query": "subprocess"}"#.to_string(),
            format!(
                r#"{{"op": "final", "answer": "It uses subprocess", "source_ids": ["{}"]}}"#,
                code.id
            ),
        ]));
        let outcome = session(&f, client, SandboxLimits::default()).run("q").await;

        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.failure, None);
        assert_eq!(outcome.source_ids, vec![code.id]);
    }

    #[tokio::test]
    async fn test_zero_result_cap_still_searches() {
        let f = fixture();
        let client = Arc::new(ScriptedClient::new([
            r#"{"op": "search", "query": "api authentication", "limit": 4}"#,
            r#"{"op": "list_by_tag", "tags": ["auth"]}"#,
            r#"{"op": "final", "answer": "JWT"}"#,
        ]));
        let outcome = session(&f, client, SandboxLimits::default().with_max_results(0))
            .run("q")
            .await;

        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.source_ids, vec![f.chunk_id.clone()]);
    }

    #[tokio::test]
    async fn test_malformed_turn_consumes_iteration() {
        let f = fixture();
        let client = Arc::new(ScriptedClient::new([
            "Let me think about this first.",
            r#"{"op": "final", "answer": "nothing stored"}"#,
        ]));
        let outcome = session(&f, client.clone(), SandboxLimits::default()).run("q").await;

        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.iterations_used, 2);
        assert_eq!(
            outcome
                .trace
                .iter()
                .filter(|e| e.event_type == TraceEventType::Rejection)
                .count(),
            1
        );
        let second = &client.requests()[1];
        assert!(second.messages.last().unwrap().content.starts_with("Error: no JSON command"));
    }

    #[tokio::test]
    async fn test_recursive_ask_runs_nested_loop() {
        let f = fixture();
        let client = Arc::new(ScriptedClient::new([
            r#"{"op": "ask", "prompt": "Which auth scheme?", "recursive": true}"#,
            r#"{"op": "search", "query": "auth scheme"}"#,
            r#"{"op": "final", "answer": "JWT"}"#,
            r#"{"op": "final", "answer": "Authentication uses JWT"}"#,
        ]));
        let outcome = session(&f, client.clone(), SandboxLimits::default()).run("q").await;

        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.answer.as_deref(), Some("Authentication uses JWT"));
        assert_eq!(outcome.iterations_used, 4);
        assert!(outcome
            .trace
            .iter()
            .any(|e| e.event_type == TraceEventType::RecurseEnd && e.depth == 1));
        let last = client.requests().pop().unwrap();
        assert!(last.messages.last().unwrap().content.contains("JWT"));
    }

    #[tokio::test]
    async fn test_depth_limit_is_feedback() {
        let f = fixture();
        let client = Arc::new(ScriptedClient::new([
            r#"{"op": "ask", "prompt": "deeper", "recursive": true}"#,
            r#"{"op": "final", "answer": "done"}"#,
        ]));
        let outcome = session(&f, client.clone(), SandboxLimits::default().with_max_depth(0))
            .run("q")
            .await;

        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.iterations_used, 2);
        let requests = client.requests();
        let feedback = &requests[1].messages.last().unwrap().content;
        assert!(feedback.contains("Maximum recursion depth 0 exceeded"));
    }

    #[tokio::test]
    async fn test_plain_ask_sees_context() {
        let f = fixture();
        let client = Arc::new(ScriptedClient::new([
            format!(
                r#"{{"op": "ask", "prompt": "Which scheme?", "context_ids": ["{}"]}}"#,
                f.chunk_id
            ),
            "JWT".to_string(),
            r#"{"op": "final", "answer": "JWT"}"#.to_string(),
        ]));
        let outcome = session(&f, client.clone(), SandboxLimits::default()).run("q").await;

        assert_eq!(outcome.status, SessionStatus::Completed);
        let ask = &client.requests()[1];
        assert!(ask.messages[0].content.contains("We chose JWT"));
        assert_eq!(outcome.source_ids, vec![f.chunk_id.clone()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_model_times_out() {
        let f = fixture();
        let session = RetrievalSession::new(
            f.store.clone(),
            f.identity.clone(),
            Arc::new(SlowClient),
            SandboxLimits::default(),
        );
        let outcome = session.run("q").await;

        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(outcome.failure, Some(FailureReason::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_model_call() {
        let f = fixture();
        let session = RetrievalSession::new(
            f.store.clone(),
            f.identity.clone(),
            Arc::new(SlowClient),
            SandboxLimits::default().with_command_timeout_ms(60_000),
        );
        let handle = session.cancel_handle();
        let running = tokio::spawn(async move { session.run("q").await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();
        let outcome = running.await.unwrap();

        assert!(handle.is_cancelled());
        assert_eq!(outcome.failure, Some(FailureReason::Cancelled));
    }

    #[tokio::test]
    async fn test_budget_exhaustion() {
        let f = fixture();
        let search = r#"{"op": "search", "query": "auth"}"#;
        let client = Arc::new(
            ScriptedClient::new([search, search, search, r#"{"op": "final", "answer": "x"}"#])
                .with_cost_per_call(0.02),
        );
        let outcome = session(&f, client, SandboxLimits::default().with_max_cost_usd(0.03))
            .run("q")
            .await;

        assert_eq!(outcome.status, SessionStatus::Exhausted);
        assert_eq!(outcome.iterations_used, 2);
        assert!((outcome.cost_usd - 0.04).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_output_is_bounded() {
        let f = fixture();
        let long = f
            .store
            .store()
            .create(&f.identity, NewChunk::new("word ".repeat(200), "conv-2"), None)
            .unwrap();
        let client = Arc::new(ScriptedClient::new([
            format!(r#"{{"op": "read", "id": "{}"}}"#, long.id),
            r#"{"op": "final", "answer": "long"}"#.to_string(),
        ]));
        session(&f, client.clone(), SandboxLimits::default().with_max_buffer_bytes(256))
            .run("q")
            .await;

        let requests = client.requests();
        let feedback = &requests[1].messages.last().unwrap().content;
        assert!(feedback.len() <= 256);
        assert!(feedback.ends_with(TRUNCATION_NOTE));
    }

    #[tokio::test]
    async fn test_unknown_chunk_is_feedback() {
        let f = fixture();
        let client = Arc::new(ScriptedClient::new([
            r#"{"op": "read", "id": "chunk-missing"}"#,
            r#"{"op": "final", "answer": "not stored"}"#,
        ]));
        let outcome = session(&f, client, SandboxLimits::default()).run("q").await;
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert!(outcome.source_ids.is_empty());
        assert_eq!(outcome.confidence, 0.0);
    }
}
