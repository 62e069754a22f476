//! Core memory types: chunks, edges, filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::policy::Layer;

/// Maximum length of any id used to build partition paths.
pub const MAX_ID_LEN: usize = 128;

/// Check that an id only uses `[A-Za-z0-9_-]`.
///
/// Ids end up in filesystem paths, so `.` and separators are never accepted.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(Error::validation(format!("invalid id length: {:?}", id)));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::validation(format!("invalid id: {:?}", id)));
    }
    Ok(())
}

/// Unique, time-ordered chunk identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChunkId(String);

impl ChunkId {
    /// Generate a new id; ids sort by creation time.
    pub fn generate() -> Self {
        Self(format!("chunk-{}", Uuid::now_v7().simple()))
    }

    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        validate_id(&s)?;
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ChunkId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<ChunkId> for String {
    fn from(id: ChunkId) -> Self {
        id.0
    }
}

impl FromStr for ChunkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Kind of content a chunk holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Fact,
    Preference,
    Pattern,
    Decision,
    Note,
}

impl ChunkType {
    pub const ALL: [ChunkType; 5] = [
        ChunkType::Fact,
        ChunkType::Preference,
        ChunkType::Pattern,
        ChunkType::Decision,
        ChunkType::Note,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Preference => "preference",
            Self::Pattern => "pattern",
            Self::Decision => "decision",
            Self::Note => "note",
        }
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ChunkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| Error::validation(format!("unknown chunk type: {}", s)))
    }
}

/// Provenance and usage metadata of a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub confidence: f64,
    pub conversation_id: String,
    /// Project the chunk was written from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Agent that wrote the chunk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Relationship kind between two chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    /// Written in the same batch of the same conversation
    ContextOf,
    /// Immediately follows the target within a conversation
    Follows,
    /// Shares tags with the target
    RelatedTo,
    /// Manually asserted support
    Supports,
    /// Manually asserted contradiction
    Contradicts,
}

impl EdgeType {
    pub const ALL: [EdgeType; 5] = [
        EdgeType::ContextOf,
        EdgeType::Follows,
        EdgeType::RelatedTo,
        EdgeType::Supports,
        EdgeType::Contradicts,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ContextOf => "context_of",
            Self::Follows => "follows",
            Self::RelatedTo => "related_to",
            Self::Supports => "supports",
            Self::Contradicts => "contradicts",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == s)
    }

    /// Manual edges are only added through an explicit call and are never pruned.
    pub fn is_manual(&self) -> bool {
        matches!(self, Self::Supports | Self::Contradicts)
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A directed edge. Identity is `(source_id, target_id, edge_type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source_id: ChunkId,
    pub target_id: ChunkId,
    pub edge_type: EdgeType,
    pub strength: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl Edge {
    pub fn new(source_id: ChunkId, target_id: ChunkId, edge_type: EdgeType, strength: f64) -> Self {
        Self {
            source_id,
            target_id,
            edge_type,
            strength: strength.clamp(0.0, 1.0),
            created_at: Utc::now(),
            rationale: None,
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            source_id: self.source_id.clone(),
            target_id: self.target_id.clone(),
            edge_type: self.edge_type,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.strength) {
            return Err(Error::validation(format!(
                "edge strength {} outside [0, 1]",
                self.strength
            )));
        }
        if self.source_id == self.target_id {
            return Err(Error::validation(format!(
                "self-referencing edge on {}",
                self.source_id
            )));
        }
        Ok(())
    }
}

/// Identity of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeKey {
    pub source_id: ChunkId,
    pub target_id: ChunkId,
    pub edge_type: EdgeType,
}

/// A persisted memory unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryChunk {
    pub id: ChunkId,
    pub content: String,
    pub token_count: u32,
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
    pub metadata: ChunkMetadata,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub layer: Layer,
    #[serde(default)]
    pub links: Vec<Edge>,
}

impl MemoryChunk {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        (now - self.metadata.created_at).num_seconds().max(0) as f64 / 86_400.0
    }
}

/// Fields supplied by a writer for a new chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub content: String,
    pub chunk_type: ChunkType,
    pub tags: BTreeSet<String>,
    pub confidence: f64,
    pub conversation_id: String,
}

impl NewChunk {
    pub fn new(content: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            chunk_type: ChunkType::Note,
            tags: BTreeSet::new(),
            confidence: 0.8,
            conversation_id: conversation_id.into(),
        }
    }

    pub fn with_type(mut self, chunk_type: ChunkType) -> Self {
        self.chunk_type = chunk_type;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

/// Partial update of a chunk. Layer is not updatable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkUpdate {
    pub content: Option<String>,
    pub chunk_type: Option<ChunkType>,
    pub tags: Option<BTreeSet<String>>,
    pub confidence: Option<f64>,
}

impl ChunkUpdate {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.chunk_type.is_none()
            && self.tags.is_none()
            && self.confidence.is_none()
    }
}

/// Filters for listing chunks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkFilter {
    /// Chunks must carry every tag listed
    #[serde(default)]
    pub tags: Vec<String>,
    pub conversation_id: Option<String>,
    pub chunk_type: Option<ChunkType>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Restrict to these layers (all readable layers when unset)
    pub layers: Option<Vec<Layer>>,
    pub limit: Option<usize>,
}

impl ChunkFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_type(mut self, chunk_type: ChunkType) -> Self {
        self.chunk_type = Some(chunk_type);
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn with_layers(mut self, layers: impl IntoIterator<Item = Layer>) -> Self {
        self.layers = Some(layers.into_iter().collect());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: MemoryChunk,
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_validation() {
        assert!(validate_id("chunk-0190abc").is_ok());
        assert!(validate_id("chunk_2026-02-01").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("../escape").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("a.b").is_err());
        assert!(validate_id(&"x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_generated_ids_sort_by_creation() {
        let a = ChunkId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = ChunkId::generate();
        assert!(a < b);
        assert!(a.as_str().starts_with("chunk-"));
        assert!(validate_id(a.as_str()).is_ok());
    }

    #[test]
    fn test_chunk_id_deserialize_validates() {
        let ok: std::result::Result<ChunkId, _> = serde_json::from_str("\"chunk-1\"");
        assert!(ok.is_ok());
        let bad: std::result::Result<ChunkId, _> = serde_json::from_str("\"../../etc\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_edge_type_names() {
        for t in EdgeType::ALL {
            assert_eq!(EdgeType::from_name(t.name()), Some(t));
        }
        assert!(EdgeType::Supports.is_manual());
        assert!(!EdgeType::Follows.is_manual());
    }

    #[test]
    fn test_edge_validation() {
        let a = ChunkId::parse("chunk-a").unwrap();
        let b = ChunkId::parse("chunk-b").unwrap();
        assert!(Edge::new(a.clone(), b, EdgeType::Follows, 0.5).validate().is_ok());
        assert!(Edge::new(a.clone(), a, EdgeType::Follows, 0.5).validate().is_err());
    }

    #[test]
    fn test_chunk_type_parse() {
        assert_eq!("decision".parse::<ChunkType>().unwrap(), ChunkType::Decision);
        assert!("opinion".parse::<ChunkType>().is_err());
    }
}
