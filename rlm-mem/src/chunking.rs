//! Bounded chunking of free text into typed memory units.
//!
//! Text is split on paragraph boundaries and consecutive paragraphs are
//! merged greedily until a chunk reaches `min_tokens`. A chunk never exceeds
//! `max_tokens`: a paragraph that is too large on its own is split at
//! sentence boundaries, and a sentence that is still too large is split at
//! word boundaries. A chunk closes below `min_tokens` only at the end of the
//! text, at the end of a split, or when the next paragraph would overflow it.
//!
//! Chunking is a pure function of its input and configuration.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::error::{Error, Result};
use crate::memory::ChunkType;

/// Approximate characters per token.
const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of `text` (never less than 1).
pub fn count_tokens(text: &str) -> u32 {
    (text.chars().count() / CHARS_PER_TOKEN).max(1) as u32
}

/// Size bounds for chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub min_tokens: u32,
    pub max_tokens: u32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_tokens: 100,
            max_tokens: 800,
        }
    }
}

impl ChunkingConfig {
    pub fn new(min_tokens: u32, max_tokens: u32) -> Self {
        Self {
            min_tokens,
            max_tokens,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_tokens == 0 || self.min_tokens > self.max_tokens {
            return Err(Error::Config(format!(
                "invalid chunk bounds: min {} max {}",
                self.min_tokens, self.max_tokens
            )));
        }
        Ok(())
    }
}

/// One chunk produced from input text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDraft {
    pub content: String,
    pub token_count: u32,
    pub chunk_type: ChunkType,
}

/// Splits text into bounded, typed chunks.
#[derive(Debug, Clone, Default)]
pub struct ChunkingEngine {
    config: ChunkingConfig,
}

impl ChunkingEngine {
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Chunk `text`. Empty or whitespace-only text yields no chunks.
    pub fn chunk(&self, text: &str) -> Vec<ChunkDraft> {
        self.chunk_contents(text)
            .into_iter()
            .map(|content| ChunkDraft {
                token_count: count_tokens(&content),
                chunk_type: detect_type(&content),
                content,
            })
            .collect()
    }

    fn chunk_contents(&self, text: &str) -> Vec<String> {
        let min = self.config.min_tokens;
        let max = self.config.max_tokens;

        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();

        for paragraph in split_paragraphs(text) {
            if count_tokens(&paragraph) > max {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                }
                chunks.extend(self.split_oversized(&paragraph));
                continue;
            }

            if current.is_empty() {
                current = paragraph;
            } else {
                let candidate = format!("{}\n\n{}", current, paragraph);
                if count_tokens(&candidate) > max {
                    chunks.push(std::mem::replace(&mut current, paragraph));
                } else {
                    current = candidate;
                }
            }

            if count_tokens(&current) >= min {
                chunks.push(std::mem::take(&mut current));
            }
        }

        if !current.is_empty() {
            // A short tail joins the previous chunk when it fits
            let tail = std::mem::take(&mut current);
            match chunks.last_mut() {
                Some(prev)
                    if count_tokens(&tail) < min
                        && count_tokens(prev) + count_tokens(&tail) + 2 <= max =>
                {
                    prev.push_str("\n\n");
                    prev.push_str(&tail);
                }
                _ => chunks.push(tail),
            }
        }

        chunks
    }

    /// Split a paragraph larger than `max_tokens` at sentence boundaries.
    fn split_oversized(&self, paragraph: &str) -> Vec<String> {
        let max = self.config.max_tokens;
        let sentences = split_sentences(paragraph);
        if sentences.len() <= 1 {
            return self.force_split(paragraph);
        }

        let mut out = Vec::new();
        let mut current = String::new();
        for sentence in sentences {
            if count_tokens(sentence) > max {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
                out.extend(self.force_split(sentence));
                continue;
            }
            if current.is_empty() {
                current = sentence.to_string();
            } else if count_tokens(&current) + count_tokens(sentence) + 1 > max {
                out.push(std::mem::replace(&mut current, sentence.to_string()));
            } else {
                current.push(' ');
                current.push_str(sentence);
            }
        }
        if !current.is_empty() {
            out.push(current);
        }
        out
    }

    /// Split at word boundaries, and inside words only when a word alone is too long.
    fn force_split(&self, text: &str) -> Vec<String> {
        let max_chars = self.config.max_tokens as usize * CHARS_PER_TOKEN;
        let mut out = Vec::new();
        let mut current = String::new();
        let mut current_chars = 0usize;

        for word in text.split_whitespace() {
            let word_chars = word.chars().count();
            if word_chars > max_chars {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                    current_chars = 0;
                }
                let chars: Vec<char> = word.chars().collect();
                out.extend(chars.chunks(max_chars).map(|c| c.iter().collect::<String>()));
                continue;
            }
            let needed = if current.is_empty() {
                word_chars
            } else {
                current_chars + 1 + word_chars
            };
            if needed > max_chars {
                out.push(std::mem::take(&mut current));
                current.push_str(word);
                current_chars = word_chars;
            } else {
                if !current.is_empty() {
                    current.push(' ');
                }
                current.push_str(word);
                current_chars = needed;
            }
        }
        if !current.is_empty() {
            out.push(current);
        }
        out
    }
}

static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n\s*").expect("invalid regex"));

static INLINE_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+").expect("invalid regex"));

fn split_paragraphs(text: &str) -> Vec<String> {
    PARAGRAPH_BREAK
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| INLINE_SPACE.replace_all(p, " ").into_owned())
        .collect()
}

fn starts_sentence(c: char) -> bool {
    c.is_uppercase() || matches!(c, '"' | '\'' | '(')
}

/// Sentence boundaries: terminal punctuation, whitespace, then a sentence opener.
fn split_sentences(text: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let (idx, c) = chars[i];
        if matches!(c, '.' | '!' | '?') {
            let end = idx + c.len_utf8();
            let mut j = i + 1;
            while j < chars.len() && chars[j].1.is_whitespace() {
                j += 1;
            }
            if j > i + 1 && j < chars.len() && starts_sentence(chars[j].1) {
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    out.push(sentence);
                }
                start = chars[j].0;
                i = j;
                continue;
            }
        }
        i += 1;
    }

    let rest = text[start..].trim();
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

// ==================== Type Detection ====================

static DECISION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(decided|decide to|chose|selected|going with|went with|opted for|settled on|concluded|agreed to|we will use)\b")
        .expect("invalid regex")
});

static PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    // Checked before preferences: "generally prefer" describes a habit
    Regex::new(r"(?i)\b(usually|often|tends to|pattern|always|typically|generally|frequently|regularly|every time|most of the time|whenever)\b")
        .expect("invalid regex")
});

static PREFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(prefer|prefers|preferred|rather|dislike|hate|favou?rite|would like|(i|we)\s+(really\s+)?(like|love|want|enjoy))\b")
        .expect("invalid regex")
});

static FACT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(is an?|are an?|was an?|were an?|is the|are the|works as|works at|works for|located in|lives in|born in|studied at|graduated from|runs on|is written in|has\s+\d+|there are\s+\d+|there is)\b")
        .expect("invalid regex")
});

static HEDGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(maybe|might|perhaps|probably|possibly|i think|i guess|not sure|could be|seems)\b")
        .expect("invalid regex")
});

/// Classify content by lexical rules, first match wins.
pub fn detect_type(content: &str) -> ChunkType {
    if DECISION.is_match(content) {
        ChunkType::Decision
    } else if PATTERN.is_match(content) {
        ChunkType::Pattern
    } else if PREFERENCE.is_match(content) {
        ChunkType::Preference
    } else if FACT.is_match(content) && !HEDGE.is_match(content) {
        ChunkType::Fact
    } else {
        ChunkType::Note
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of_tokens(tokens: usize, word: &str) -> String {
        let mut s = String::new();
        while s.chars().count() < tokens * CHARS_PER_TOKEN {
            s.push_str(word);
            s.push(' ');
        }
        s.trim_end().to_string()
    }

    #[test]
    fn test_count_tokens() {
        assert_eq!(count_tokens(""), 1);
        assert_eq!(count_tokens("abcd"), 1);
        assert_eq!(count_tokens(&"a".repeat(400)), 100);
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        let engine = ChunkingEngine::default();
        assert!(engine.chunk("").is_empty());
        assert!(engine.chunk("   \n\n  \n").is_empty());
    }

    #[test]
    fn test_small_paragraphs_merge() {
        let engine = ChunkingEngine::default();
        let text = format!(
            "{}\n\n{}",
            text_of_tokens(50, "alpha"),
            text_of_tokens(60, "beta")
        );
        let chunks = engine.chunk(&text);
        assert_eq!(chunks.len(), 1);
        assert!((108..=115).contains(&chunks[0].token_count));
    }

    #[test]
    fn test_two_large_paragraphs_stay_apart() {
        let engine = ChunkingEngine::default();
        let text = format!(
            "{}\n\n{}",
            text_of_tokens(750, "gamma"),
            text_of_tokens(750, "delta")
        );
        let chunks = engine.chunk(&text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.token_count <= 800));
    }

    #[test]
    fn test_oversized_paragraph_split_at_sentences() {
        let engine = ChunkingEngine::default();
        let sentence = format!("{}.", text_of_tokens(100, "word"));
        let paragraph = (0..12)
            .map(|i| format!("Sentence{} {}", i, sentence))
            .collect::<Vec<_>>()
            .join(" ");
        assert!(count_tokens(&paragraph) > 800);

        let chunks = engine.chunk(&paragraph);
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.token_count <= 800));
        // Every chunk ends on a sentence boundary
        assert!(chunks.iter().all(|c| c.content.ends_with('.')));
    }

    #[test]
    fn test_force_split_without_sentences() {
        let engine = ChunkingEngine::new(ChunkingConfig::new(10, 50)).unwrap();
        let text = text_of_tokens(200, "run");
        let chunks = engine.chunk(&text);
        assert!(chunks.len() >= 4);
        assert!(chunks.iter().all(|c| c.token_count <= 50));
    }

    #[test]
    fn test_sentence_splitting() {
        let s = split_sentences("First one. Second one! \"Quoted\" third? lower. case");
        assert_eq!(s, vec!["First one.", "Second one!", "\"Quoted\" third? lower. case"]);
    }

    #[test]
    fn test_paragraph_whitespace_normalized() {
        let p = split_paragraphs("a  b\t c\n\n\n\n  d   e  ");
        assert_eq!(p, vec!["a b c".to_string(), "d e".to_string()]);
    }

    #[test]
    fn test_type_detection() {
        assert_eq!(detect_type("We decided to use SQLite."), ChunkType::Decision);
        assert_eq!(detect_type("I generally prefer tabs."), ChunkType::Pattern);
        assert_eq!(detect_type("I prefer dark mode."), ChunkType::Preference);
        assert_eq!(detect_type("The server is written in Rust."), ChunkType::Fact);
        assert_eq!(detect_type("The server might be a VM."), ChunkType::Note);
        assert_eq!(detect_type("Random musing."), ChunkType::Note);
    }

    #[test]
    fn test_invalid_bounds() {
        assert!(ChunkingEngine::new(ChunkingConfig::new(0, 10)).is_err());
        assert!(ChunkingEngine::new(ChunkingConfig::new(20, 10)).is_err());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn document() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z]{1,12}( [a-z]{1,12}){0,400}\\.", 0..8)
            .prop_map(|paragraphs| paragraphs.join("\n\n"))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn chunks_never_exceed_max(doc in document()) {
            let engine = ChunkingEngine::new(ChunkingConfig::new(20, 120)).unwrap();
            for chunk in engine.chunk(&doc) {
                prop_assert!(chunk.token_count <= 120);
            }
        }

        #[test]
        fn chunking_preserves_words(doc in document()) {
            let engine = ChunkingEngine::new(ChunkingConfig::new(20, 120)).unwrap();
            let original: Vec<&str> = doc.split_whitespace().collect();
            let chunks = engine.chunk(&doc);
            let rejoined: Vec<String> = chunks
                .iter()
                .flat_map(|c| c.content.split_whitespace().map(str::to_string).collect::<Vec<_>>())
                .collect();
            prop_assert_eq!(rejoined, original);
        }

        #[test]
        fn chunking_is_deterministic(doc in document()) {
            let engine = ChunkingEngine::default();
            prop_assert_eq!(engine.chunk(&doc), engine.chunk(&doc));
        }
    }
}
