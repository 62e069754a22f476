//! Import of legacy one-file-per-chunk memory directories.
//!
//! Legacy chunks are JSON files named `chunk-*.json`, usually grouped in
//! month directories:
//!
//! ```json
//! {"id": "chunk-20260201-1", "content": "...", "type": "decision",
//!  "tags": ["auth"], "metadata": {"created_at": "2026-02-01T10:00:00Z",
//!  "confidence": 0.9, "conversation_id": "conv-1"}}
//! ```
//!
//! Ids are kept, so importing the same directory twice is a no-op.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use super::MemoryEngine;
use crate::chunking::count_tokens;
use crate::error::{Error, Result};
use crate::memory::{ChunkId, ChunkMetadata, ChunkType, MemoryChunk};
use crate::policy::{Identity, Layer};

const LEGACY_CONVERSATION: &str = "legacy-import";
const LEGACY_CONFIDENCE: f64 = 0.8;

/// Outcome of an import run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub scanned: usize,
    /// Chunks written, or that would be written on a dry run
    pub imported: usize,
    /// Ids already present
    pub skipped: usize,
    pub failed: Vec<(PathBuf, String)>,
    pub dry_run: bool,
}

#[derive(Debug, Deserialize)]
struct LegacyChunk {
    id: String,
    content: String,
    #[serde(default, rename = "type")]
    chunk_type: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    metadata: LegacyMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct LegacyMetadata {
    #[serde(default, alias = "created")]
    created_at: Option<String>,
    confidence: Option<f64>,
    conversation_id: Option<String>,
}

impl LegacyChunk {
    fn into_chunk(self, layer: Layer) -> Result<MemoryChunk> {
        let id = ChunkId::parse(self.id)?;
        let created_at = self
            .metadata
            .created_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);
        let chunk_type = self
            .chunk_type
            .as_deref()
            .and_then(|t| t.parse::<ChunkType>().ok())
            .unwrap_or(ChunkType::Note);

        Ok(MemoryChunk {
            id,
            token_count: count_tokens(&self.content),
            content: self.content,
            chunk_type,
            metadata: ChunkMetadata {
                created_at,
                modified_at: created_at,
                accessed_at: created_at,
                access_count: 0,
                confidence: self.metadata.confidence.unwrap_or(LEGACY_CONFIDENCE),
                conversation_id: self
                    .metadata
                    .conversation_id
                    .unwrap_or_else(|| LEGACY_CONVERSATION.to_string()),
                project_id: None,
                agent_id: None,
            },
            tags: self.tags.into_iter().collect(),
            layer,
            links: Vec::new(),
        })
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn legacy_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!(
        "{}/**/chunk-*.json",
        glob::Pattern::escape(&dir.to_string_lossy())
    );
    let paths = glob::glob(&pattern)
        .map_err(|e| Error::Internal(format!("bad import pattern {}: {}", pattern, e)))?;
    let mut files = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) => files.push(path),
            Err(e) => warn!(error = %e, "Skipping unreadable path"),
        }
    }
    files.sort();
    Ok(files)
}

impl MemoryEngine {
    /// Import legacy chunk files under `dir` into `layer`.
    ///
    /// Malformed files are listed in the report and do not stop the run. A
    /// dry run writes nothing and counts ids visible to the caller as
    /// already present.
    #[instrument(skip(self), fields(identity = %identity, dir = %dir.display()))]
    pub fn import_legacy(
        &self,
        identity: &Identity,
        dir: &Path,
        layer: Layer,
        dry_run: bool,
    ) -> Result<ImportReport> {
        if !dir.is_dir() {
            return Err(Error::validation(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        self.store.resolve(identity)?.write_partition(layer)?;

        let files = legacy_files(dir)?;
        let mut report = ImportReport {
            scanned: files.len(),
            dry_run,
            ..ImportReport::default()
        };

        for path in files {
            let parsed = std::fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|text| Ok(serde_json::from_str::<LegacyChunk>(&text)?))
                .and_then(|legacy| legacy.into_chunk(layer));
            let chunk = match parsed {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Malformed legacy chunk");
                    report.failed.push((path, e.to_string()));
                    continue;
                }
            };

            if dry_run {
                if self.store.peek(identity, &chunk.id)?.is_some() {
                    report.skipped += 1;
                } else {
                    report.imported += 1;
                }
                continue;
            }

            match self.store.import_chunk(identity, chunk, layer) {
                Ok(true) => report.imported += 1,
                Ok(false) => report.skipped += 1,
                Err(e) if e.is_caller_error() => report.failed.push((path, e.to_string())),
                Err(e) => return Err(e),
            }
        }

        info!(
            scanned = report.scanned,
            imported = report.imported,
            skipped = report.skipped,
            failed = report.failed.len(),
            dry_run,
            "Legacy import finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::memory::ChunkFilter;
    use pretty_assertions::assert_eq;

    fn write(dir: &Path, rel: &str, body: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn legacy_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "2026-02/chunk-a.json",
            r#"{"id": "chunk-a", "content": "We decided to use JWT.", "type": "decision",
                "tags": ["auth"], "metadata": {"created_at": "2026-02-01T10:00:00Z",
                "confidence": 0.9, "conversation_id": "conv-1"}}"#,
        );
        write(
            dir.path(),
            "2026-02/chunk-b.json",
            r#"{"id": "chunk-b", "content": "Dark mode everywhere.",
                "metadata": {"created_at": "2026-02-02T08:30:00"}}"#,
        );
        write(dir.path(), "2026-03/chunk-c.json", "{not json");
        write(dir.path(), "notes.json", r#"{"id": "ignored", "content": "x"}"#);
        dir
    }

    #[test]
    fn test_import_keeps_ids_and_metadata() {
        let engine = engine();
        let dir = legacy_dir();

        let report = engine
            .import_legacy(&me(), dir.path(), Layer::ProjectAgent, false)
            .unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.imported, 2);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].0.ends_with("chunk-c.json"));

        let a = engine
            .store()
            .peek(&me(), &ChunkId::parse("chunk-a").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(a.chunk_type, ChunkType::Decision);
        assert_eq!(a.metadata.confidence, 0.9);
        assert_eq!(a.metadata.conversation_id, "conv-1");
        assert!(a.has_tag("auth"));
        assert_eq!(a.metadata.created_at.to_rfc3339(), "2026-02-01T10:00:00+00:00");

        let b = engine
            .store()
            .peek(&me(), &ChunkId::parse("chunk-b").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(b.chunk_type, ChunkType::Note);
        assert_eq!(b.metadata.conversation_id, LEGACY_CONVERSATION);
    }

    #[test]
    fn test_import_is_idempotent() {
        let engine = engine();
        let dir = legacy_dir();
        engine
            .import_legacy(&me(), dir.path(), Layer::ProjectAgent, false)
            .unwrap();
        let again = engine
            .import_legacy(&me(), dir.path(), Layer::ProjectAgent, false)
            .unwrap();

        assert_eq!(again.imported, 0);
        assert_eq!(again.skipped, 2);
        assert_eq!(engine.store().list(&me(), &ChunkFilter::new()).unwrap().len(), 2);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let engine = engine();
        let dir = legacy_dir();
        let report = engine
            .import_legacy(&me(), dir.path(), Layer::ProjectAgent, true)
            .unwrap();

        assert!(report.dry_run);
        assert_eq!(report.imported, 2);
        assert!(engine.store().list(&me(), &ChunkFilter::new()).unwrap().is_empty());
    }

    #[test]
    fn test_import_requires_writable_layer() {
        let engine = engine();
        let dir = legacy_dir();
        let result = engine.import_legacy(&me(), dir.path(), Layer::ProjectGlobal, false);
        assert!(matches!(result, Err(Error::PolicyViolation(_))));

        let missing = engine.import_legacy(&me(), &dir.path().join("nope"), Layer::ProjectAgent, false);
        assert!(matches!(missing, Err(Error::Validation(_))));
    }
}
