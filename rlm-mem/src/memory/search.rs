//! Keyword-overlap scoring over chunks.
//!
//! No embeddings: a query is tokenized into lowercase alphanumeric terms and
//! each chunk is scored by term frequency weighted with a lightweight IDF
//! over the candidate set, plus boosts for tag hits and verbatim phrase
//! matches. Confidence and age adjust the score mildly so relevance still
//! dominates.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use super::types::{MemoryChunk, ScoredChunk};

const PHRASE_BOOST: f64 = 6.0;
const TAG_BOOST: f64 = 8.0;

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9_]+").expect("invalid regex"));

/// Lowercase alphanumeric tokens of `text`.
pub fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    TOKEN
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}

struct Candidate {
    chunk: MemoryChunk,
    term_counts: HashMap<String, usize>,
    tag_tokens: HashSet<String>,
}

/// Score `chunks` against `query`, best first, keeping at most `limit` hits.
///
/// Chunks with no overlap at all are dropped. Ties break toward newer chunks.
pub fn score_chunks(
    query: &str,
    chunks: Vec<MemoryChunk>,
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<ScoredChunk> {
    let terms: HashSet<String> = tokenize(query).into_iter().collect();
    let phrase = query.trim().to_lowercase();
    if terms.is_empty() || chunks.is_empty() || limit == 0 {
        return Vec::new();
    }

    let candidates: Vec<Candidate> = chunks
        .into_iter()
        .map(|chunk| {
            let mut term_counts = HashMap::new();
            for token in tokenize(&chunk.content) {
                *term_counts.entry(token).or_insert(0) += 1;
            }
            let tag_tokens = chunk.tags.iter().flat_map(|t| tokenize(t)).collect();
            Candidate {
                chunk,
                term_counts,
                tag_tokens,
            }
        })
        .collect();

    let doc_count = candidates.len() as f64;
    let idf: HashMap<&str, f64> = terms
        .iter()
        .map(|term| {
            let df = candidates
                .iter()
                .filter(|c| c.term_counts.contains_key(term) || c.tag_tokens.contains(term))
                .count() as f64;
            (term.as_str(), 1.0 + ((doc_count + 1.0) / (df + 1.0)).ln())
        })
        .collect();

    let mut scored: Vec<ScoredChunk> = candidates
        .into_iter()
        .filter_map(|c| {
            let mut score = 0.0;
            if !phrase.is_empty() && c.chunk.content.to_lowercase().contains(&phrase) {
                score += PHRASE_BOOST;
            }
            for term in &terms {
                let weight = idf.get(term.as_str()).copied().unwrap_or(1.0);
                if let Some(tf) = c.term_counts.get(term) {
                    score += *tf as f64 * (1.0 + weight);
                }
                if c.tag_tokens.contains(term) {
                    score += TAG_BOOST * (1.0 + weight * 0.2);
                }
            }
            if score <= 0.0 {
                return None;
            }

            let confidence = c.chunk.metadata.confidence.clamp(0.0, 1.0);
            score *= 0.85 + 0.3 * confidence;
            score *= recency_multiplier(c.chunk.age_days(now));

            Some(ScoredChunk {
                chunk: c.chunk,
                score,
            })
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.chunk.metadata.created_at.cmp(&a.chunk.metadata.created_at))
    });
    scored.truncate(limit);
    scored
}

fn recency_multiplier(age_days: f64) -> f64 {
    if age_days <= 7.0 {
        1.10
    } else if age_days <= 30.0 {
        1.04
    } else if age_days > 180.0 {
        0.92
    } else {
        1.0
    }
}

/// Confidence of a result set, weighted by score.
pub fn weighted_confidence(hits: &[ScoredChunk]) -> f64 {
    let total: f64 = hits.iter().map(|h| h.score).sum();
    if total <= 0.0 {
        return 0.0;
    }
    hits.iter()
        .map(|h| h.chunk.metadata.confidence.clamp(0.0, 1.0) * h.score)
        .sum::<f64>()
        / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{ChunkId, ChunkMetadata, ChunkType};
    use crate::policy::Layer;
    use chrono::Duration;

    fn chunk(id: &str, content: &str, tags: &[&str], age_days: i64) -> MemoryChunk {
        let created = Utc::now() - Duration::days(age_days);
        MemoryChunk {
            id: ChunkId::parse(id).unwrap(),
            content: content.to_string(),
            token_count: 10,
            chunk_type: ChunkType::Note,
            metadata: ChunkMetadata {
                created_at: created,
                modified_at: created,
                accessed_at: created,
                access_count: 0,
                confidence: 0.8,
                conversation_id: "conv".into(),
                project_id: None,
                agent_id: None,
            },
            tags: tags.iter().map(|t| t.to_string()).collect(),
            layer: Layer::ProjectGlobal,
            links: Vec::new(),
        }
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Hello, World! rust_2024"), vec!["hello", "world", "rust_2024"]);
    }

    #[test]
    fn test_no_overlap_is_dropped() {
        let hits = score_chunks(
            "database",
            vec![chunk("c1", "cats and dogs", &[], 1)],
            Utc::now(),
            5,
        );
        assert!(hits.is_empty());
    }

    #[test]
    fn test_tag_hit_outranks_single_mention() {
        let hits = score_chunks(
            "sqlite",
            vec![
                chunk("c1", "we mention sqlite once", &[], 1),
                chunk("c2", "storage engine choice", &["sqlite"], 1),
            ],
            Utc::now(),
            5,
        );
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.id.as_str(), "c2");
    }

    #[test]
    fn test_phrase_boost_and_limit() {
        let hits = score_chunks(
            "dark mode",
            vec![
                chunk("c1", "user likes dark mode everywhere", &[], 1),
                chunk("c2", "mode of transport is dark blue", &[], 1),
                chunk("c3", "dark", &[], 1),
            ],
            Utc::now(),
            2,
        );
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.id.as_str(), "c1");
    }

    #[test]
    fn test_recency_breaks_ties() {
        let hits = score_chunks(
            "rust",
            vec![chunk("old", "rust", &[], 60), chunk("new", "rust", &[], 60)],
            Utc::now(),
            5,
        );
        // Equal age bucket and score: newer creation time first
        assert_eq!(hits.len(), 2);
        assert!(hits[0].chunk.metadata.created_at >= hits[1].chunk.metadata.created_at);
    }

    #[test]
    fn test_weighted_confidence() {
        assert_eq!(weighted_confidence(&[]), 0.0);
        let hits = score_chunks("rust", vec![chunk("c1", "rust", &[], 1)], Utc::now(), 5);
        assert!((weighted_confidence(&hits) - 0.8).abs() < 1e-9);
    }
}
