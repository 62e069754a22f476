//! `reason`: analyse what memory holds about a topic or a set of claims.
//!
//! Analysis is deterministic. A model client, when configured, only adds a
//! narrative paragraph on top of the computed result.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::{capture, MemoryEngine, OperationError};
use crate::error::{Error, Result};
use crate::llm::{ChatMessage, CompletionRequest, LLMClient};
use crate::memory::{tokenize, ChunkId, ChunkType, EdgeType, MemoryChunk};
use crate::policy::Identity;

/// Lines shown in a synthesis before the rest is summarised.
const SYNTHESIS_LINES: usize = 7;

/// Chunks below this confidence count as weak evidence.
const LOW_CONFIDENCE: f64 = 0.6;

const NEGATIONS: [&str; 6] = ["not", "don't", "dislike", "hate", "avoid", "stop"];

const QUESTION_WORDS: [&str; 10] = [
    "what", "which", "when", "where", "does", "with", "about", "that", "this", "from",
];

const NARRATIVE_PROMPT: &str = "You summarise excerpts from an agent's memory. \
Write one short paragraph answering the topic from the excerpts only. \
Mention disagreements between excerpts. Do not invent facts.";

/// Kind of analysis to run over the evidence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    /// Ranked summary of the evidence
    #[default]
    Synthesis,
    /// Side by side listing of distinct sources
    Comparison,
    /// Recurring tags, types and time span
    Pattern,
    /// Weak, isolated or missing evidence
    Gap,
}

impl AnalysisType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Synthesis => "synthesis",
            Self::Comparison => "comparison",
            Self::Pattern => "pattern",
            Self::Gap => "gap",
        }
    }
}

/// What to reason about: a search topic, explicit chunk ids, or both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasonRequest {
    #[serde(default)]
    pub topic: String,
    /// Chunk ids used as evidence instead of a search
    #[serde(default)]
    pub claims: Vec<String>,
    #[serde(default)]
    pub analysis: AnalysisType,
    #[serde(default = "default_max_evidence")]
    pub max_evidence: usize,
}

fn default_max_evidence() -> usize {
    10
}

impl ReasonRequest {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            claims: Vec::new(),
            analysis: AnalysisType::default(),
            max_evidence: default_max_evidence(),
        }
    }

    pub fn claims<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topic: String::new(),
            claims: ids.into_iter().map(Into::into).collect(),
            analysis: AnalysisType::default(),
            max_evidence: default_max_evidence(),
        }
    }

    pub fn with_analysis(mut self, analysis: AnalysisType) -> Self {
        self.analysis = analysis;
        self
    }

    pub fn with_max_evidence(mut self, max_evidence: usize) -> Self {
        self.max_evidence = max_evidence;
        self
    }
}

/// How a contradiction was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContradictionKind {
    /// A stored `contradicts` edge
    Explicit,
    /// Two preferences on the same tag that disagree
    Preference,
    /// A negated statement against an affirmed one on the same tag
    Negation,
}

/// A pair of chunks that appear to disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contradiction {
    pub kind: ContradictionKind,
    /// Shared tag, for heuristic findings
    pub topic: Option<String>,
    pub chunk_ids: [ChunkId; 2],
    pub reason: String,
    /// Edge strength, for explicit findings
    pub strength: Option<f64>,
}

/// Result of `reason`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasonResult {
    pub success: bool,
    pub analysis: AnalysisType,
    pub synthesis: String,
    pub insights: Vec<String>,
    pub contradictions: Vec<Contradiction>,
    pub confidence: f64,
    pub source_chunks: Vec<ChunkId>,
    /// Model-written paragraph, when a model client is configured
    pub narrative: Option<String>,
    pub cost_usd: f64,
    pub error: Option<OperationError>,
}

impl ReasonResult {
    fn failed(analysis: AnalysisType, error: OperationError) -> Self {
        Self {
            analysis,
            error: Some(error),
            ..Self::default()
        }
    }
}

impl MemoryEngine {
    /// Analyse the evidence for `request` and surface contradictions.
    #[instrument(skip(self, request), fields(identity = %identity, analysis = request.analysis.name()))]
    pub async fn reason(&self, identity: &Identity, request: ReasonRequest) -> Result<ReasonResult> {
        let evidence = match self.gather_evidence(identity, &request) {
            Ok(evidence) => evidence,
            Err(e) => return Ok(ReasonResult::failed(request.analysis, capture(e)?)),
        };
        let evidence = rank_unique(evidence);
        debug!(evidence = evidence.len(), "Gathered evidence");

        let subject = if request.topic.trim().is_empty() {
            "the given claims".to_string()
        } else {
            request.topic.trim().to_string()
        };

        if evidence.is_empty() {
            return Ok(ReasonResult {
                success: true,
                analysis: request.analysis,
                synthesis: "No relevant evidence found for analysis".into(),
                ..ReasonResult::default()
            });
        }

        let mut result = match request.analysis {
            AnalysisType::Synthesis => synthesize(&subject, &evidence),
            AnalysisType::Comparison => compare(&subject, &evidence),
            AnalysisType::Pattern => find_patterns(&evidence),
            AnalysisType::Gap => identify_gaps(&request.topic, &evidence),
        };

        result.contradictions = detect_contradictions(&evidence);
        if !result.contradictions.is_empty() {
            result.insights.push(format!(
                "Identified {} potential conflicts in memory",
                result.contradictions.len()
            ));
        }

        if let Some(llm) = &self.llm {
            self.narrate(Arc::clone(llm), &subject, &evidence, &mut result).await;
        }

        info!(
            sources = result.source_chunks.len(),
            contradictions = result.contradictions.len(),
            "Reasoning finished"
        );
        Ok(result)
    }

    fn gather_evidence(&self, identity: &Identity, request: &ReasonRequest) -> Result<Vec<MemoryChunk>> {
        let limit = request.max_evidence.max(1);
        if request.claims.is_empty() {
            if request.topic.trim().is_empty() {
                return Err(Error::validation("reason needs a topic or claim ids"));
            }
            let hits = self.cached.search(identity, &request.topic, limit, None)?;
            return Ok(hits.into_iter().map(|h| h.chunk).collect());
        }

        let mut chunks = Vec::new();
        for raw in request.claims.iter().take(limit) {
            let id = ChunkId::parse(raw.as_str())?;
            let chunk = self
                .cached
                .get(identity, &id)?
                .ok_or_else(|| Error::not_found(format!("chunk {}", id)))?;
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    async fn narrate(
        &self,
        llm: Arc<dyn LLMClient>,
        subject: &str,
        evidence: &[MemoryChunk],
        result: &mut ReasonResult,
    ) {
        let budget = self.limits.max_buffer_bytes;
        let mut excerpts = String::new();
        for (i, chunk) in evidence.iter().enumerate() {
            let line = format!("{}. {}\n", i + 1, one_line(&chunk.content));
            if excerpts.len() + line.len() > budget {
                break;
            }
            excerpts.push_str(&line);
        }

        let request = CompletionRequest::new()
            .with_system(NARRATIVE_PROMPT)
            .with_message(ChatMessage::user(format!(
                "Topic: {}\nAnalysis: {}\n\nExcerpts:\n{}",
                subject,
                result.analysis.name(),
                excerpts
            )))
            .with_max_tokens(512);

        match tokio::time::timeout(self.limits.command_timeout(), llm.complete(request)).await {
            Ok(Ok(response)) => {
                result.cost_usd += response.cost.unwrap_or(0.0);
                let text = response.content.trim();
                if !text.is_empty() {
                    result.narrative = Some(text.to_string());
                }
            }
            Ok(Err(e)) => warn!(error = %e, "Narrative generation failed"),
            Err(_) => warn!(
                timeout_ms = self.limits.command_timeout_ms,
                "Narrative generation timed out"
            ),
        }
    }
}

/// Drop duplicate content and order by confidence, then recency.
fn rank_unique(chunks: Vec<MemoryChunk>) -> Vec<MemoryChunk> {
    let mut seen_ids = HashSet::new();
    let mut seen_content = HashSet::new();
    let mut unique: Vec<MemoryChunk> = chunks
        .into_iter()
        .filter(|c| seen_ids.insert(c.id.clone()))
        .collect();

    unique.sort_by(|a, b| {
        b.metadata
            .confidence
            .total_cmp(&a.metadata.confidence)
            .then(b.metadata.created_at.cmp(&a.metadata.created_at))
    });
    unique.retain(|c| seen_content.insert(normalize(&c.content)));
    unique
}

fn normalize(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn ids(evidence: &[MemoryChunk]) -> Vec<ChunkId> {
    evidence.iter().map(|c| c.id.clone()).collect()
}

fn mean_confidence(evidence: &[MemoryChunk]) -> f64 {
    evidence.iter().map(|c| c.metadata.confidence).sum::<f64>() / evidence.len() as f64
}

/// `(name, count)` pairs, most frequent first.
fn ranked<I>(items: I) -> Vec<(String, usize)>
where
    I: IntoIterator<Item = String>,
{
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for item in items {
        *counts.entry(item).or_default() += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked
}

fn tag_summary(evidence: &[MemoryChunk], top: usize) -> Vec<(String, usize)> {
    let mut tags = ranked(evidence.iter().flat_map(|c| c.tags.iter().cloned()));
    tags.truncate(top);
    tags
}

fn type_summary(evidence: &[MemoryChunk]) -> String {
    ranked(evidence.iter().map(|c| c.chunk_type.name().to_string()))
        .iter()
        .map(|(name, count)| format!("{} {}", count, name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn synthesize(subject: &str, evidence: &[MemoryChunk]) -> ReasonResult {
    let mut lines = vec![
        format!("Synthesized analysis for: \"{}\"", subject),
        String::new(),
        format!("Based on {} unique sources (ranked by relevance):", evidence.len()),
    ];
    for (i, chunk) in evidence.iter().take(SYNTHESIS_LINES).enumerate() {
        lines.push(format!(" {}. {}", i + 1, one_line(&chunk.content)));
    }
    if evidence.len() > SYNTHESIS_LINES {
        lines.push(format!(
            " ... and {} other supporting memories.",
            evidence.len() - SYNTHESIS_LINES
        ));
    }

    let mut insights = vec![format!("Source types: {}", type_summary(evidence))];
    let tags = tag_summary(evidence, 3);
    if let Some((tag, count)) = tags.first() {
        if *count > 1 {
            insights.push(format!("Dominant tag: {} ({} sources)", tag, count));
        }
    }
    for chunk in evidence.iter().filter(|c| c.chunk_type == ChunkType::Preference).take(3) {
        insights.push(format!("Preference identified: {}", preview(&chunk.content)));
    }

    ReasonResult {
        success: true,
        analysis: AnalysisType::Synthesis,
        synthesis: lines.join("\n"),
        insights,
        confidence: mean_confidence(evidence),
        source_chunks: ids(evidence),
        ..ReasonResult::default()
    }
}

fn compare(subject: &str, evidence: &[MemoryChunk]) -> ReasonResult {
    if evidence.len() < 2 {
        return ReasonResult {
            success: true,
            analysis: AnalysisType::Comparison,
            synthesis: "Comparison needs at least two distinct sources".into(),
            source_chunks: ids(evidence),
            ..ReasonResult::default()
        };
    }

    let mut lines = vec![format!("Comparison for: \"{}\"", subject)];
    for (i, chunk) in evidence.iter().enumerate() {
        lines.push(format!(
            " Option {} ({}, confidence {:.2}): {}",
            i + 1,
            chunk.chunk_type,
            chunk.metadata.confidence,
            one_line(&chunk.content)
        ));
    }

    ReasonResult {
        success: true,
        analysis: AnalysisType::Comparison,
        synthesis: lines.join("\n"),
        insights: vec![format!("Comparing {} distinct sources", evidence.len())],
        confidence: 0.7,
        source_chunks: ids(evidence),
        ..ReasonResult::default()
    }
}

fn find_patterns(evidence: &[MemoryChunk]) -> ReasonResult {
    let mut insights = Vec::new();

    let tags = tag_summary(evidence, 5);
    if !tags.is_empty() {
        let names: Vec<&str> = tags.iter().map(|(t, _)| t.as_str()).collect();
        insights.push(format!("Common themes: {}", names.join(", ")));
    }
    insights.push(format!("Source types: {}", type_summary(evidence)));

    let habits = evidence
        .iter()
        .filter(|c| c.chunk_type == ChunkType::Pattern)
        .count();
    if habits > 0 {
        insights.push(format!("{} recorded recurring behaviours", habits));
    }

    let days: BTreeSet<_> = evidence
        .iter()
        .map(|c| c.metadata.created_at.date_naive())
        .collect();
    insights.push(format!("Evidence spans {} unique days", days.len()));

    ReasonResult {
        success: true,
        analysis: AnalysisType::Pattern,
        synthesis: format!(
            "Found {} patterns across {} memories",
            insights.len(),
            evidence.len()
        ),
        insights,
        confidence: 0.75,
        source_chunks: ids(evidence),
        ..ReasonResult::default()
    }
}

fn identify_gaps(topic: &str, evidence: &[MemoryChunk]) -> ReasonResult {
    let mut gaps = Vec::new();

    let weak = evidence
        .iter()
        .filter(|c| c.metadata.confidence < LOW_CONFIDENCE)
        .count();
    if weak > 0 {
        gaps.push(format!("{} sources have low confidence scores", weak));
    }

    let isolated = evidence
        .iter()
        .filter(|c| {
            !c.links
                .iter()
                .any(|e| matches!(e.edge_type, EdgeType::ContextOf | EdgeType::RelatedTo))
        })
        .count();
    if isolated > 0 {
        gaps.push(format!("{} items are isolated (no graph links)", isolated));
    }

    let covered: HashSet<String> = evidence
        .iter()
        .flat_map(|c| tokenize(&c.content).into_iter().chain(c.tags.iter().cloned()))
        .collect();
    let mut missing: Vec<String> = tokenize(topic)
        .into_iter()
        .filter(|t| t.len() >= 4 && !QUESTION_WORDS.contains(&t.as_str()))
        .filter(|t| !covered.contains(t))
        .collect();
    missing.dedup();
    if !missing.is_empty() {
        gaps.push(format!("No memory mentions: {}", missing.join(", ")));
    }

    if gaps.is_empty() {
        gaps.push("No significant structural gaps identified in the available evidence".into());
    }

    ReasonResult {
        success: true,
        analysis: AnalysisType::Gap,
        synthesis: format!("Knowledge gap analysis: {}", gaps.join("; ")),
        insights: gaps,
        confidence: 0.6,
        source_chunks: ids(evidence),
        ..ReasonResult::default()
    }
}

fn preview(text: &str) -> String {
    let line = one_line(text);
    if line.chars().count() <= 100 {
        return line;
    }
    let cut: String = line.chars().take(100).collect();
    format!("{}...", cut)
}

fn words(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| c.is_ascii_punctuation() && c != '\'').to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

fn prefers(words: &HashSet<String>) -> bool {
    words.contains("prefer") || words.contains("prefers")
}

fn negated(words: &HashSet<String>) -> bool {
    NEGATIONS.iter().any(|n| words.contains(*n))
}

/// Stored `contradicts` edges first, then per-tag heuristics. One finding per pair.
fn detect_contradictions(evidence: &[MemoryChunk]) -> Vec<Contradiction> {
    let mut found = Vec::new();

    for chunk in evidence {
        for edge in chunk.links.iter().filter(|e| e.edge_type == EdgeType::Contradicts) {
            found.push(Contradiction {
                kind: ContradictionKind::Explicit,
                topic: None,
                chunk_ids: [edge.source_id.clone(), edge.target_id.clone()],
                reason: edge
                    .rationale
                    .clone()
                    .unwrap_or_else(|| "Marked as contradicting".into()),
                strength: Some(edge.strength),
            });
        }
    }

    let mut by_tag: BTreeMap<&str, Vec<(&MemoryChunk, HashSet<String>)>> = BTreeMap::new();
    for chunk in evidence {
        for tag in &chunk.tags {
            by_tag
                .entry(tag.as_str())
                .or_default()
                .push((chunk, words(&chunk.content)));
        }
    }

    for (tag, group) in &by_tag {
        for (i, (a, a_words)) in group.iter().enumerate() {
            for (b, b_words) in &group[i + 1..] {
                let pair = [a.id.clone(), b.id.clone()];
                if prefers(a_words) && prefers(b_words) && a_words.symmetric_difference(b_words).count() >= 2 {
                    found.push(Contradiction {
                        kind: ContradictionKind::Preference,
                        topic: Some(tag.to_string()),
                        chunk_ids: pair.clone(),
                        reason: format!("Divergent preferences detected for topic '{}'", tag),
                        strength: None,
                    });
                }
                if negated(a_words) != negated(b_words) {
                    found.push(Contradiction {
                        kind: ContradictionKind::Negation,
                        topic: Some(tag.to_string()),
                        chunk_ids: pair,
                        reason: format!("Opposing sentiments detected for topic '{}'", tag),
                        strength: None,
                    });
                }
            }
        }
    }

    let mut seen = HashSet::new();
    found.retain(|c| {
        let [a, b] = &c.chunk_ids;
        let key = if a <= b { (a.clone(), b.clone()) } else { (b.clone(), a.clone()) };
        seen.insert(key)
    });
    found
}
