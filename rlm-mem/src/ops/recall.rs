//! `recall`: answer a question from memory.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::{capture, MemoryEngine, OperationError};
use crate::error::{Error, Result};
use crate::llm::LLMClient;
use crate::memory::{weighted_confidence, ChunkId};
use crate::policy::Identity;
use crate::sandbox::{FailureReason, RetrievalSession, SessionOutcome, SessionStatus, TraceEvent};

/// A question to answer from memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallRequest {
    pub query: String,
    /// Overrides the configured iteration cap for this call
    pub max_iterations: Option<u32>,
    /// Overrides the configured result limit for this call
    pub max_results: Option<usize>,
}

impl RecallRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            max_iterations: None,
            max_results: None,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }
}

/// What `recall` found.
///
/// `answer` is `None` both when the retrieval limits ran out and when
/// nothing relevant is stored; `status` tells the two apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallResult {
    pub success: bool,
    pub answer: Option<String>,
    pub confidence: f64,
    pub source_chunks: Vec<ChunkId>,
    pub iterations_used: u32,
    pub status: SessionStatus,
    pub cost_usd: f64,
    #[serde(default)]
    pub trace: Vec<TraceEvent>,
    pub failure: Option<FailureReason>,
    pub error: Option<OperationError>,
}

impl RecallResult {
    fn failed(error: OperationError) -> Self {
        Self {
            success: false,
            answer: None,
            confidence: 0.0,
            source_chunks: Vec::new(),
            iterations_used: 0,
            status: SessionStatus::Failed,
            cost_usd: 0.0,
            trace: Vec::new(),
            failure: None,
            error: Some(error),
        }
    }

    fn from_outcome(outcome: SessionOutcome) -> Self {
        let error = match (outcome.failure, &outcome.error) {
            (Some(reason), Some(message)) => Some(OperationError::new(failure_kind(reason), message.as_str())),
            (Some(reason), None) => Some(OperationError::new(failure_kind(reason), reason.as_str())),
            _ => None,
        };
        Self {
            success: outcome.status != SessionStatus::Failed,
            answer: outcome.answer,
            confidence: outcome.confidence,
            source_chunks: outcome.source_ids,
            iterations_used: outcome.iterations_used,
            status: outcome.status,
            cost_usd: outcome.cost_usd,
            trace: outcome.trace,
            failure: outcome.failure,
            error,
        }
    }
}

fn failure_kind(reason: FailureReason) -> &'static str {
    match reason {
        FailureReason::Violation => "sandbox_violation",
        FailureReason::Timeout => "timeout",
        FailureReason::Cancelled => "cancelled",
        FailureReason::Error => "session_error",
    }
}

impl MemoryEngine {
    /// Answer `request.query`.
    ///
    /// With a model client a bounded retrieval session runs over the cached
    /// store; otherwise the best keyword hit is returned. Running out of
    /// iterations is a normal outcome (`status == Exhausted`, no answer).
    /// Source chunks are marked as accessed only after a session completes.
    #[instrument(skip(self, request), fields(identity = %identity))]
    pub async fn recall(&self, identity: &Identity, request: RecallRequest) -> Result<RecallResult> {
        if request.query.trim().is_empty() {
            return Ok(RecallResult::failed(capture(Error::validation(
                "query must not be empty",
            ))?));
        }
        if let Err(e) = self.store.resolve(identity) {
            return Ok(RecallResult::failed(capture(e)?));
        }

        let result = match &self.llm {
            Some(llm) => self.recall_with_session(identity, &request, Arc::clone(llm)).await?,
            None => self.recall_by_keywords(identity, &request)?,
        };
        info!(
            status = result.status.as_str(),
            iterations = result.iterations_used,
            sources = result.source_chunks.len(),
            "Recall finished"
        );
        Ok(result)
    }

    async fn recall_with_session(
        &self,
        identity: &Identity,
        request: &RecallRequest,
        llm: Arc<dyn LLMClient>,
    ) -> Result<RecallResult> {
        let mut limits = self.limits.clone();
        if let Some(max_iterations) = request.max_iterations {
            limits = limits.with_max_iterations(max_iterations);
        }
        if let Some(max_results) = request.max_results {
            limits = limits.with_max_results(max_results.max(1));
        }

        let session = RetrievalSession::new(self.cached.clone(), identity.clone(), llm, limits);
        let outcome = session.run(&request.query).await;
        if let Some(reason) = outcome.failure {
            warn!(reason = reason.as_str(), error = ?outcome.error, "Retrieval session failed");
        }

        if outcome.status == SessionStatus::Completed {
            for id in &outcome.source_ids {
                self.store.get(identity, id)?;
            }
        }
        Ok(RecallResult::from_outcome(outcome))
    }

    fn recall_by_keywords(&self, identity: &Identity, request: &RecallRequest) -> Result<RecallResult> {
        let limit = request.max_results.unwrap_or(self.limits.max_results).max(1);
        let hits = self.cached.search(identity, &request.query, limit, None)?;
        for hit in &hits {
            self.store.get(identity, &hit.chunk.id)?;
        }

        Ok(RecallResult {
            success: true,
            answer: hits.first().map(|h| h.chunk.content.clone()),
            confidence: weighted_confidence(&hits),
            source_chunks: hits.iter().map(|h| h.chunk.id.clone()).collect(),
            iterations_used: 0,
            status: SessionStatus::Completed,
            cost_usd: 0.0,
            trace: Vec::new(),
            failure: None,
            error: None,
        })
    }
}
