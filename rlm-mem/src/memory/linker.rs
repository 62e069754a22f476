//! Edges derived at write time.
//!
//! For each batch of freshly created chunks:
//!
//! - `context_of`: every ordered pair of chunks in the batch sharing a
//!   conversation, strength 1.0
//! - `follows`: each chunk points at the chunk immediately before it in its
//!   conversation, if that one was written within the recency window; the
//!   strength decays from 1.0 to a floor of 0.3 over the window
//! - `related_to`: the top-K readable chunks by number of shared tags,
//!   strength `min(0.9, 0.3 + 0.2 * shared)`

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::store::LayeredMemoryStore;
use super::types::{ChunkFilter, ChunkId, Edge, EdgeType, MemoryChunk};
use crate::error::Result;
use crate::policy::Identity;

/// Auto-linking settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkerConfig {
    /// How far back a `follows` predecessor may be, in seconds
    pub recency_window_secs: u64,
    /// Maximum `related_to` edges per new chunk
    pub related_top_k: usize,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            recency_window_secs: 300,
            related_top_k: 5,
        }
    }
}

impl LinkerConfig {
    pub fn with_recency_window_secs(mut self, secs: u64) -> Self {
        self.recency_window_secs = secs;
        self
    }

    pub fn with_related_top_k(mut self, k: usize) -> Self {
        self.related_top_k = k;
        self
    }
}

/// Strength of a `follows` edge for a gap of `minutes` between two chunks.
pub fn follows_strength(minutes: f64, window_minutes: f64) -> f64 {
    if window_minutes <= 0.0 {
        return 1.0;
    }
    (1.0 - minutes / window_minutes).max(0.3)
}

/// Strength of a `related_to` edge for `shared` common tags.
pub fn related_strength(shared: usize) -> f64 {
    (0.3 + 0.2 * shared as f64).min(0.9)
}

/// Derives and persists automatic edges for new chunks.
#[derive(Debug, Clone, Default)]
pub struct AutoLinker {
    config: LinkerConfig,
}

impl AutoLinker {
    pub fn new(config: LinkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LinkerConfig {
        &self.config
    }

    fn window(&self) -> Duration {
        let secs = i64::try_from(self.config.recency_window_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs.min(i64::MAX / 1000))
    }

    /// Derive edges for `batch` (in creation order) and persist them.
    pub fn link_batch(
        &self,
        store: &LayeredMemoryStore,
        identity: &Identity,
        batch: &[MemoryChunk],
    ) -> Result<Vec<Edge>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let batch_ids: HashSet<&ChunkId> = batch.iter().map(|c| &c.id).collect();
        let mut edges = Vec::new();

        let mut conversations: Vec<(&str, Vec<&MemoryChunk>)> = Vec::new();
        for chunk in batch {
            let conversation = chunk.metadata.conversation_id.as_str();
            match conversations.iter_mut().find(|(c, _)| *c == conversation) {
                Some((_, members)) => members.push(chunk),
                None => conversations.push((conversation, vec![chunk])),
            }
        }

        for (conversation, members) in &conversations {
            for source in members {
                for target in members {
                    if source.id != target.id {
                        edges.push(Edge::new(
                            source.id.clone(),
                            target.id.clone(),
                            EdgeType::ContextOf,
                            1.0,
                        ));
                    }
                }
            }

            let mut previous = self.predecessor(store, identity, conversation, members[0], &batch_ids)?;
            for chunk in members {
                if let Some(prev) = previous.take() {
                    let gap = chunk.metadata.created_at - prev.metadata.created_at;
                    let minutes = gap.num_milliseconds().max(0) as f64 / 60_000.0;
                    let window_minutes = self.config.recency_window_secs as f64 / 60.0;
                    edges.push(Edge::new(
                        chunk.id.clone(),
                        prev.id.clone(),
                        EdgeType::Follows,
                        follows_strength(minutes, window_minutes),
                    ));
                }
                previous = Some((*chunk).clone());
            }
        }

        for chunk in batch {
            if chunk.tags.is_empty() || self.config.related_top_k == 0 {
                continue;
            }
            let same_context: HashSet<&ChunkId> = batch
                .iter()
                .filter(|c| c.metadata.conversation_id == chunk.metadata.conversation_id)
                .map(|c| &c.id)
                .collect();

            let mut candidates: Vec<(ChunkId, usize)> = store
                .tag_overlap(identity, &chunk.tags)?
                .into_iter()
                .filter(|(id, _)| !same_context.contains(id))
                .collect();
            candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
            candidates.dedup_by(|a, b| a.0 == b.0);
            candidates.truncate(self.config.related_top_k);

            for (target, shared) in candidates {
                edges.push(Edge::new(
                    chunk.id.clone(),
                    target,
                    EdgeType::RelatedTo,
                    related_strength(shared),
                ));
            }
        }

        store.put_edges(identity, &edges)?;

        let mut counts: HashMap<EdgeType, usize> = HashMap::new();
        for edge in &edges {
            *counts.entry(edge.edge_type).or_default() += 1;
        }
        debug!(
            chunks = batch.len(),
            context = counts.get(&EdgeType::ContextOf).copied().unwrap_or(0),
            follows = counts.get(&EdgeType::Follows).copied().unwrap_or(0),
            related = counts.get(&EdgeType::RelatedTo).copied().unwrap_or(0),
            "Auto-linked batch"
        );
        Ok(edges)
    }

    /// Latest earlier chunk of `conversation` within the recency window of `first`.
    fn predecessor(
        &self,
        store: &LayeredMemoryStore,
        identity: &Identity,
        conversation: &str,
        first: &MemoryChunk,
        batch_ids: &HashSet<&ChunkId>,
    ) -> Result<Option<MemoryChunk>> {
        let created = first.metadata.created_at;
        let filter = ChunkFilter::new()
            .with_conversation(conversation)
            .created_after(created - self.window())
            .created_before(created);
        Ok(store
            .list(identity, &filter)?
            .into_iter()
            .find(|c| !batch_ids.contains(&c.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::NewChunk;
    use crate::policy::{PolicyConfig, PolicyResolver};

    fn setup() -> (LayeredMemoryStore, Identity, AutoLinker) {
        let store =
            LayeredMemoryStore::in_memory(PolicyResolver::new(PolicyConfig::default()).unwrap());
        (store, Identity::new("proj", "agent"), AutoLinker::default())
    }

    #[test]
    fn test_strength_curves() {
        assert_eq!(follows_strength(0.0, 5.0), 1.0);
        assert!((follows_strength(2.5, 5.0) - 0.5).abs() < 1e-9);
        assert_eq!(follows_strength(10.0, 5.0), 0.3);
        assert!((related_strength(1) - 0.5).abs() < 1e-9);
        assert_eq!(related_strength(5), 0.9);
    }

    #[test]
    fn test_batch_is_pairwise_context() {
        let (store, id, linker) = setup();
        let batch = store
            .create_batch(
                &id,
                vec![
                    NewChunk::new("a", "conv"),
                    NewChunk::new("b", "conv"),
                    NewChunk::new("c", "conv"),
                ],
                None,
            )
            .unwrap();
        linker.link_batch(&store, &id, &batch).unwrap();

        for source in &batch {
            let context = store.edges(&id, &source.id, Some(EdgeType::ContextOf)).unwrap();
            assert_eq!(context.len(), 2);
        }
    }

    #[test]
    fn test_follows_points_backwards_only() {
        let (store, id, linker) = setup();
        let earlier = store.create_batch(&id, vec![NewChunk::new("first", "conv")], None).unwrap();
        linker.link_batch(&store, &id, &earlier).unwrap();
        let later = store
            .create_batch(
                &id,
                vec![NewChunk::new("second", "conv"), NewChunk::new("third", "conv")],
                None,
            )
            .unwrap();
        linker.link_batch(&store, &id, &later).unwrap();

        let first_follows = store.edges(&id, &earlier[0].id, Some(EdgeType::Follows)).unwrap();
        assert!(first_follows.is_empty());

        let second = store.edges(&id, &later[0].id, Some(EdgeType::Follows)).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].target_id, earlier[0].id);

        let third = store.edges(&id, &later[1].id, Some(EdgeType::Follows)).unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].target_id, later[0].id);
    }

    #[test]
    fn test_other_conversation_not_linked() {
        let (store, id, linker) = setup();
        let batch = store
            .create_batch(
                &id,
                vec![NewChunk::new("a", "conv-1"), NewChunk::new("b", "conv-2")],
                None,
            )
            .unwrap();
        let edges = linker.link_batch(&store, &id, &batch).unwrap();
        assert!(edges.is_empty());
    }

    #[test]
    fn test_related_to_top_k() {
        let (store, id, _) = setup();
        let linker = AutoLinker::new(LinkerConfig::default().with_related_top_k(2));
        for (i, tags) in [vec!["db"], vec!["db", "perf"], vec!["db", "perf", "sqlite"], vec!["ui"]]
            .into_iter()
            .enumerate()
        {
            store
                .create(&id, NewChunk::new(format!("note {}", i), format!("old-{}", i)).with_tags(tags), None)
                .unwrap();
        }

        let batch = store
            .create_batch(
                &id,
                vec![NewChunk::new("new", "fresh").with_tags(["db", "perf", "sqlite"])],
                None,
            )
            .unwrap();
        let edges = linker.link_batch(&store, &id, &batch).unwrap();

        let related: Vec<&Edge> = edges
            .iter()
            .filter(|e| e.edge_type == EdgeType::RelatedTo)
            .collect();
        assert_eq!(related.len(), 2);
        assert!((related[0].strength - 0.9).abs() < 1e-9);
        assert!((related[1].strength - 0.7).abs() < 1e-9);
    }
}
