//! `remember`: chunk, store and link new content.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::{capture, MemoryEngine, OperationError};
use crate::error::{Error, Result};
use crate::memory::{ChunkId, ChunkType, NewChunk};
use crate::policy::{Identity, Layer};

/// Content to store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RememberRequest {
    pub content: String,
    pub conversation_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Confidence applied to every chunk (default 0.8)
    pub confidence: Option<f64>,
    /// Overrides the detected type of every chunk
    pub type_hint: Option<ChunkType>,
    /// Target layer; the first writable layer when unset
    pub layer: Option<Layer>,
}

impl RememberRequest {
    pub fn new(content: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            conversation_id: conversation_id.into(),
            tags: Vec::new(),
            confidence: None,
            type_hint: None,
            layer: None,
        }
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
        self.confidence = Some(confidence);
        self
    }

    pub fn with_type_hint(mut self, chunk_type: ChunkType) -> Self {
        self.type_hint = Some(chunk_type);
        self
    }

    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layer = Some(layer);
        self
    }
}

/// What `remember` stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RememberResult {
    pub success: bool,
    pub chunk_ids: Vec<ChunkId>,
    pub total_tokens: u32,
    pub chunks_created: usize,
    pub layer: Option<Layer>,
    pub edges_created: usize,
    pub error: Option<OperationError>,
}

impl RememberResult {
    fn failed(error: OperationError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

impl MemoryEngine {
    /// Chunk `request.content` and store every chunk in one atomic append.
    ///
    /// Caller errors (empty content, a layer outside the write policy, bad
    /// identifiers or confidence) are reported in the result and nothing is
    /// written.
    #[instrument(skip(self, request), fields(identity = %identity, conversation = %request.conversation_id))]
    pub fn remember(&self, identity: &Identity, request: RememberRequest) -> Result<RememberResult> {
        match self.try_remember(identity, request) {
            Ok(result) => Ok(result),
            Err(e) => Ok(RememberResult::failed(capture(e)?)),
        }
    }

    fn try_remember(&self, identity: &Identity, request: RememberRequest) -> Result<RememberResult> {
        if request.content.trim().is_empty() {
            return Err(Error::validation("content must not be empty"));
        }
        // Chunk the redacted text; masks are longer than the values they replace
        let content = self.store.resolve(identity)?.redact(&request.content)?.text;

        let drafts = self.chunker.chunk(&content);
        let chunks: Vec<NewChunk> = drafts
            .into_iter()
            .map(|draft| {
                let mut chunk = NewChunk::new(draft.content, request.conversation_id.as_str())
                    .with_type(request.type_hint.unwrap_or(draft.chunk_type))
                    .with_tags(request.tags.iter().cloned());
                if let Some(confidence) = request.confidence {
                    chunk = chunk.with_confidence(confidence);
                }
                chunk
            })
            .collect();

        let stored = self.store.create_batch(identity, chunks, request.layer)?;
        let edges = self.linker.link_batch(&self.store, identity, &stored)?;

        let result = RememberResult {
            success: true,
            chunk_ids: stored.iter().map(|c| c.id.clone()).collect(),
            total_tokens: stored.iter().map(|c| c.token_count).sum(),
            chunks_created: stored.len(),
            layer: stored.first().map(|c| c.layer),
            edges_created: edges.len(),
            error: None,
        };
        info!(
            chunks = result.chunks_created,
            tokens = result.total_tokens,
            edges = result.edges_created,
            "Remembered content"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::chunking::count_tokens;
    use crate::memory::{ChunkFilter, EdgeType};
    use crate::policy::PolicyConfig;

    fn paragraph(topic: &str, words: usize) -> String {
        (0..words)
            .map(|i| format!("{}{}", topic, i % 7))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_remember_small_note() {
        let engine = engine();
        let result = engine
            .remember(
                &me(),
                RememberRequest::new("I prefer dark mode in every editor.", "conv-1")
                    .with_tags(["ui"])
                    .with_confidence(0.9),
            )
            .unwrap();

        assert!(result.success);
        assert_eq!(result.chunks_created, 1);
        assert_eq!(result.layer, Some(Layer::ProjectAgent));

        let chunk = engine.store().peek(&me(), &result.chunk_ids[0]).unwrap().unwrap();
        assert_eq!(chunk.chunk_type, ChunkType::Preference);
        assert!(chunk.has_tag("ui"));
        assert_eq!(chunk.metadata.confidence, 0.9);
        assert_eq!(result.total_tokens, chunk.token_count);
    }

    #[test]
    fn test_long_text_is_bounded_and_linked() {
        let engine = engine();
        let text = (0..8)
            .map(|i| paragraph(&format!("topic{}", i), 150))
            .collect::<Vec<_>>()
            .join("\n\n");

        let result = engine
            .remember(&me(), RememberRequest::new(text, "conv-long"))
            .unwrap();
        assert!(result.success);
        assert!(result.chunks_created > 1);

        let count = result.chunk_ids.len();
        for (i, id) in result.chunk_ids.iter().enumerate() {
            let chunk = engine.store().get(&me(), id).unwrap().unwrap();
            assert!(chunk.token_count <= 800);
            if i + 1 < count {
                assert!(chunk.token_count >= 100, "chunk {} has {} tokens", i, chunk.token_count);
            }
        }

        let first = &result.chunk_ids[0];
        let context = engine
            .store()
            .edges(&me(), first, Some(EdgeType::ContextOf))
            .unwrap();
        assert_eq!(context.len(), count - 1);
        assert!(result.edges_created >= count * (count - 1));
    }

    #[test]
    fn test_type_hint_overrides_detection() {
        let engine = engine();
        let result = engine
            .remember(
                &me(),
                RememberRequest::new("We decided to use JWT.", "c").with_type_hint(ChunkType::Fact),
            )
            .unwrap();
        let chunk = engine.store().peek(&me(), &result.chunk_ids[0]).unwrap().unwrap();
        assert_eq!(chunk.chunk_type, ChunkType::Fact);
    }

    #[test]
    fn test_denied_layer_writes_nothing() {
        let engine = engine();
        let result = engine
            .remember(
                &me(),
                RememberRequest::new("secret plan", "c").with_layer(Layer::UserGlobal),
            )
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.error.as_ref().map(|e| e.kind.as_str()), Some("policy_violation"));
        assert!(result.chunk_ids.is_empty());

        let listed = engine.store().list(&me(), &ChunkFilter::new()).unwrap();
        assert!(listed.is_empty());
    }

    #[test]
    fn test_caller_errors_are_results() {
        let engine = engine();

        let empty = engine.remember(&me(), RememberRequest::new("   ", "c")).unwrap();
        assert_eq!(empty.error.unwrap().kind, "validation_error");

        let bad_confidence = engine
            .remember(&me(), RememberRequest::new("text", "c").with_confidence(1.5))
            .unwrap();
        assert_eq!(bad_confidence.error.unwrap().kind, "validation_error");

        let bad_identity = engine
            .remember(&Identity::new("../etc", "agent"), RememberRequest::new("text", "c"))
            .unwrap();
        assert!(!bad_identity.success);
    }

    #[test]
    fn test_agents_are_isolated() {
        let engine = engine_with(
            PolicyConfig::default().with_write_layers([Layer::ProjectAgent, Layer::ProjectGlobal]),
        );
        let alice = Identity::new("proj", "alice");
        let bob = Identity::new("proj", "bob");

        let private = engine
            .remember(&alice, RememberRequest::new("alice's scratch notes", "c"))
            .unwrap();
        let shared = engine
            .remember(
                &alice,
                RememberRequest::new("team uses postgres", "c").with_layer(Layer::ProjectGlobal),
            )
            .unwrap();

        assert!(engine.store().peek(&bob, &private.chunk_ids[0]).unwrap().is_none());
        assert!(engine.store().peek(&bob, &shared.chunk_ids[0]).unwrap().is_some());
    }

    #[test]
    fn test_redaction_never_pushes_chunk_over_limit() {
        let engine = engine();
        let content = format!("{}{}", "password a ".repeat(10), "word ".repeat(617));
        let content = content.trim_end();
        assert_eq!(count_tokens(content), 798);

        let result = engine
            .remember(&me(), RememberRequest::new(content, "conv-secrets"))
            .unwrap();
        assert!(result.success, "{:?}", result.error);
        assert!(result.chunks_created >= 2);

        let mut masked = 0;
        for id in &result.chunk_ids {
            let chunk = engine.store().peek(&me(), id).unwrap().unwrap();
            assert!(chunk.token_count <= 800);
            assert!(!chunk.content.contains("password a"));
            masked += chunk.content.matches("[REDACTED]").count();
        }
        assert_eq!(masked, 10);
    }
}
