//! One physical partition: an append-only record log plus in-memory indexes.
//!
//! Records are immutable rows in SQLite. On open the log is replayed in
//! sequence order to rebuild the indexes:
//!
//! - id index: chunk id -> sequence number of its latest record
//! - tag index: tag -> ids carrying it
//! - edge index: source id -> outgoing edges, unique per `(target, type)`
//!
//! Writers go through a [`PartitionWriter`], which holds the partition's
//! write lock for its lifetime. The indexes are only updated after the
//! append transaction commits, so readers never resolve an id to a record
//! that is not fully written.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use super::schema::{initialize_schema, is_initialized};
use super::types::{ChunkFilter, ChunkId, ChunkType, Edge, EdgeType, MemoryChunk};
use crate::error::{Error, Result};
use crate::policy::{Layer, PartitionKey};

/// Kind column of the records table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordKind {
    Chunk,
    Tombstone,
    Edge,
}

impl RecordKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Chunk => "chunk",
            Self::Tombstone => "tombstone",
            Self::Edge => "edge",
        }
    }
}

/// Soft-delete marker. Serialized with `"tombstone": true` so it is
/// recognizable on disk without the kind column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tombstone {
    pub tombstone: bool,
    pub id: ChunkId,
    pub layer: Layer,
    pub deleted_at: DateTime<Utc>,
    /// Remove every record of this id at the next compaction
    #[serde(default)]
    pub permanent: bool,
}

/// Indexed view of a live chunk, enough to answer list filters without disk reads.
#[derive(Debug, Clone)]
pub(crate) struct ChunkSummary {
    pub seq: i64,
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub chunk_type: ChunkType,
    pub tags: BTreeSet<String>,
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct TombstoneState {
    seq: i64,
    deleted_at: DateTime<Utc>,
    permanent: bool,
}

#[derive(Debug, Clone)]
struct IndexedEdge {
    seq: i64,
    edge: Edge,
}

#[derive(Debug, Default)]
struct PartitionIndex {
    live: HashMap<ChunkId, ChunkSummary>,
    tombstones: HashMap<ChunkId, TombstoneState>,
    tags: HashMap<String, HashSet<ChunkId>>,
    outgoing: HashMap<ChunkId, Vec<IndexedEdge>>,
    records: usize,
    corrupted: usize,
}

impl PartitionIndex {
    fn apply_raw(&mut self, label: &str, seq: i64, kind: &str, payload: &str) -> Result<()> {
        let corrupt = |detail: String| Error::corruption(label, format!("record {}: {}", seq, detail));
        match kind {
            "chunk" => {
                let chunk: MemoryChunk =
                    serde_json::from_str(payload).map_err(|e| corrupt(e.to_string()))?;
                validate_record(&chunk).map_err(|e| corrupt(e.to_string()))?;
                self.apply_chunk(seq, &chunk);
            }
            "tombstone" => {
                let tombstone: Tombstone =
                    serde_json::from_str(payload).map_err(|e| corrupt(e.to_string()))?;
                self.apply_tombstone(seq, &tombstone);
            }
            "edge" => {
                let edge: Edge = serde_json::from_str(payload).map_err(|e| corrupt(e.to_string()))?;
                edge.validate().map_err(|e| corrupt(e.to_string()))?;
                self.apply_edge(seq, edge);
            }
            other => return Err(corrupt(format!("unknown record kind {}", other))),
        }
        Ok(())
    }

    fn untag(&mut self, id: &ChunkId, tags: &BTreeSet<String>) {
        for tag in tags {
            if let Some(ids) = self.tags.get_mut(tag) {
                ids.remove(id);
                if ids.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
    }

    fn apply_chunk(&mut self, seq: i64, chunk: &MemoryChunk) {
        if let Some(previous) = self.live.remove(&chunk.id) {
            self.untag(&chunk.id, &previous.tags);
        }
        self.tombstones.remove(&chunk.id);
        for tag in &chunk.tags {
            self.tags
                .entry(tag.clone())
                .or_default()
                .insert(chunk.id.clone());
        }
        self.live.insert(
            chunk.id.clone(),
            ChunkSummary {
                seq,
                conversation_id: chunk.metadata.conversation_id.clone(),
                created_at: chunk.metadata.created_at,
                chunk_type: chunk.chunk_type,
                tags: chunk.tags.clone(),
                project_id: chunk.metadata.project_id.clone(),
            },
        );
    }

    fn apply_tombstone(&mut self, seq: i64, tombstone: &Tombstone) {
        if let Some(previous) = self.live.remove(&tombstone.id) {
            self.untag(&tombstone.id, &previous.tags);
        }
        let permanent = tombstone.permanent
            || self
                .tombstones
                .get(&tombstone.id)
                .is_some_and(|t| t.permanent);
        self.tombstones
            .insert(
                tombstone.id.clone(),
                TombstoneState {
                    seq,
                    deleted_at: tombstone.deleted_at,
                    permanent,
                },
            );
    }

    fn apply_edge(&mut self, seq: i64, edge: Edge) {
        let edges = self.outgoing.entry(edge.source_id.clone()).or_default();
        match edges
            .iter_mut()
            .find(|e| e.edge.target_id == edge.target_id && e.edge.edge_type == edge.edge_type)
        {
            Some(existing) => *existing = IndexedEdge { seq, edge },
            None => edges.push(IndexedEdge { seq, edge }),
        }
    }

    fn outgoing(&self, id: &ChunkId, edge_type: Option<EdgeType>) -> Vec<Edge> {
        self.outgoing
            .get(id)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|e| edge_type.map_or(true, |t| e.edge.edge_type == t))
                    .map(|e| e.edge.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn validate_record(chunk: &MemoryChunk) -> Result<()> {
    if !(0.0..=1.0).contains(&chunk.metadata.confidence) {
        return Err(Error::validation("confidence outside [0, 1]"));
    }
    if chunk.content.is_empty() {
        return Err(Error::validation("empty content"));
    }
    Ok(())
}

/// Counters for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStats {
    pub partition: PartitionKey,
    pub live_chunks: usize,
    pub tombstoned_chunks: usize,
    pub records: usize,
    pub edges: usize,
    pub tags: usize,
    pub corrupted_records: usize,
}

/// Outcome of compacting one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub partition: PartitionKey,
    pub removed_records: usize,
    pub purged_chunks: Vec<ChunkId>,
    /// Live chunks that lost edges pointing at purged chunks
    pub pruned_edge_sources: Vec<ChunkId>,
    pub remaining_records: usize,
}

/// A partition log and its indexes.
pub(crate) struct Partition {
    key: PartitionKey,
    label: String,
    conn: Mutex<Connection>,
    write_lock: Mutex<()>,
    index: RwLock<PartitionIndex>,
}

impl Partition {
    /// Open the partition at `path`, or an in-memory one when `path` is `None`.
    pub fn open(key: PartitionKey, path: Option<&Path>) -> Result<Self> {
        let conn = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };

        if !is_initialized(&conn) {
            initialize_schema(&conn)?;
        }

        let label = key.to_string();
        let index = Self::replay(&label, &conn)?;
        info!(
            partition = %label,
            chunks = index.live.len(),
            records = index.records,
            corrupted = index.corrupted,
            "Opened partition"
        );

        Ok(Self {
            key,
            label,
            conn: Mutex::new(conn),
            write_lock: Mutex::new(()),
            index: RwLock::new(index),
        })
    }

    fn replay(label: &str, conn: &Connection) -> Result<PartitionIndex> {
        let mut stmt = conn.prepare("SELECT seq, chunk_id, kind, payload FROM records ORDER BY seq")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut index = PartitionIndex::default();
        for row in rows {
            let (seq, chunk_id, kind, payload) = row?;
            index.records += 1;
            if let Err(e) = index.apply_raw(label, seq, &kind, &payload) {
                index.corrupted += 1;
                warn!(partition = %label, seq, chunk_id = %chunk_id, error = %e, "Skipping corrupt record");
            }
        }
        Ok(index)
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))
    }

    fn read_index(&self) -> Result<RwLockReadGuard<'_, PartitionIndex>> {
        self.index
            .read()
            .map_err(|e| Error::Internal(format!("Failed to lock index: {}", e)))
    }

    fn write_index(&self) -> Result<RwLockWriteGuard<'_, PartitionIndex>> {
        self.index
            .write()
            .map_err(|e| Error::Internal(format!("Failed to lock index: {}", e)))
    }

    /// Take the partition's write lock. Only one writer exists at a time.
    pub fn writer(&self) -> Result<PartitionWriter<'_>> {
        let guard = self
            .write_lock
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock partition writer: {}", e)))?;
        Ok(PartitionWriter {
            partition: self,
            _guard: guard,
        })
    }

    // ==================== Reads ====================

    pub fn is_live(&self, id: &ChunkId) -> Result<bool> {
        Ok(self.read_index()?.live.contains_key(id))
    }

    /// Whether the id has any record here, live or tombstoned.
    pub fn knows(&self, id: &ChunkId) -> Result<bool> {
        let index = self.read_index()?;
        Ok(index.live.contains_key(id) || index.tombstones.contains_key(id))
    }

    pub fn summary(&self, id: &ChunkId) -> Result<Option<ChunkSummary>> {
        Ok(self.read_index()?.live.get(id).cloned())
    }

    /// Read the latest record of a live chunk.
    ///
    /// A record that fails to decode is logged and reported as absent.
    pub fn read_chunk(&self, id: &ChunkId) -> Result<Option<MemoryChunk>> {
        let (seq, links) = {
            let index = self.read_index()?;
            match index.live.get(id) {
                Some(summary) => (summary.seq, index.outgoing(id, None)),
                None => return Ok(None),
            }
        };

        let row: Option<(String, Option<i64>, Option<String>)> = {
            let conn = self.lock_conn()?;
            conn.query_row(
                "SELECT r.payload, a.access_count, a.accessed_at
                 FROM records r LEFT JOIN access a ON a.chunk_id = r.chunk_id
                 WHERE r.seq = ?1",
                params![seq],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
        };

        Ok(row.and_then(|(payload, count, accessed)| {
            let mut chunk = self.decode_chunk(seq, &payload)?;
            apply_access(&mut chunk, count, accessed);
            chunk.links = links;
            Some(chunk)
        }))
    }

    /// Read every live chunk.
    pub fn scan_live(&self) -> Result<Vec<MemoryChunk>> {
        let (live_seqs, mut links): (HashSet<i64>, HashMap<ChunkId, Vec<Edge>>) = {
            let index = self.read_index()?;
            (
                index.live.values().map(|s| s.seq).collect(),
                index
                    .live
                    .keys()
                    .map(|id| (id.clone(), index.outgoing(id, None)))
                    .collect(),
            )
        };

        let rows: Vec<(i64, String, Option<i64>, Option<String>)> = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare(
                "SELECT r.seq, r.payload, a.access_count, a.accessed_at
                 FROM records r LEFT JOIN access a ON a.chunk_id = r.chunk_id
                 WHERE r.kind = 'chunk' ORDER BY r.seq",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        Ok(rows
            .into_iter()
            .filter(|(seq, ..)| live_seqs.contains(seq))
            .filter_map(|(seq, payload, count, accessed)| {
                let mut chunk = self.decode_chunk(seq, &payload)?;
                apply_access(&mut chunk, count, accessed);
                chunk.links = links.remove(&chunk.id).unwrap_or_default();
                Some(chunk)
            })
            .collect())
    }

    fn decode_chunk(&self, seq: i64, payload: &str) -> Option<MemoryChunk> {
        match serde_json::from_str::<MemoryChunk>(payload)
            .map_err(Error::from)
            .and_then(|c| validate_record(&c).map(|_| c))
        {
            Ok(chunk) => Some(chunk),
            Err(e) => {
                let err = Error::corruption(self.label.as_str(), format!("record {}: {}", seq, e));
                warn!(error = %err, "Treating corrupt record as absent");
                None
            }
        }
    }

    /// Record a read of `id`, returning the new access count and time.
    pub fn touch(&self, id: &ChunkId) -> Result<(u64, DateTime<Utc>)> {
        let now = Utc::now();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO access (chunk_id, access_count, accessed_at) VALUES (?1, 1, ?2)
             ON CONFLICT(chunk_id) DO UPDATE SET
                access_count = access_count + 1,
                accessed_at = excluded.accessed_at",
            params![id.as_str(), now.to_rfc3339()],
        )?;
        let count: i64 = conn.query_row(
            "SELECT access_count FROM access WHERE chunk_id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok((count.max(0) as u64, now))
    }

    /// Live chunks matching `filter`, as `(id, summary)` pairs.
    ///
    /// Tag filters go through the tag index, intersecting the smallest set
    /// with the others; remaining filters scan the summaries.
    pub fn filter(&self, filter: &ChunkFilter) -> Result<Vec<(ChunkId, ChunkSummary)>> {
        let index = self.read_index()?;

        let candidates: Vec<&ChunkId> = if filter.tags.is_empty() {
            index.live.keys().collect()
        } else {
            let mut sets: Vec<&HashSet<ChunkId>> = Vec::with_capacity(filter.tags.len());
            for tag in &filter.tags {
                match index.tags.get(tag) {
                    Some(ids) => sets.push(ids),
                    None => return Ok(Vec::new()),
                }
            }
            sets.sort_by_key(|s| s.len());
            let (first, rest) = sets.split_at(1);
            first[0]
                .iter()
                .filter(|id| rest.iter().all(|s| s.contains(*id)))
                .collect()
        };

        Ok(candidates
            .into_iter()
            .filter_map(|id| index.live.get(id).map(|s| (id, s)))
            .filter(|(_, s)| {
                filter
                    .conversation_id
                    .as_ref()
                    .map_or(true, |c| &s.conversation_id == c)
                    && filter.chunk_type.map_or(true, |t| s.chunk_type == t)
                    && filter.created_after.map_or(true, |at| s.created_at >= at)
                    && filter.created_before.map_or(true, |at| s.created_at <= at)
            })
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect())
    }

    /// Live ids sharing at least one of `tags`, with the number shared.
    pub fn tag_overlap(&self, tags: &BTreeSet<String>) -> Result<HashMap<ChunkId, (usize, DateTime<Utc>)>> {
        let index = self.read_index()?;
        let mut overlap: HashMap<ChunkId, (usize, DateTime<Utc>)> = HashMap::new();
        for tag in tags {
            if let Some(ids) = index.tags.get(tag) {
                for id in ids {
                    if let Some(summary) = index.live.get(id) {
                        overlap.entry(id.clone()).or_insert((0, summary.created_at)).0 += 1;
                    }
                }
            }
        }
        Ok(overlap)
    }

    pub fn outgoing(&self, id: &ChunkId, edge_type: Option<EdgeType>) -> Result<Vec<Edge>> {
        Ok(self.read_index()?.outgoing(id, edge_type))
    }

    pub fn stats(&self) -> Result<PartitionStats> {
        let index = self.read_index()?;
        Ok(PartitionStats {
            partition: self.key.clone(),
            live_chunks: index.live.len(),
            tombstoned_chunks: index.tombstones.len(),
            records: index.records,
            edges: index.outgoing.values().map(Vec::len).sum(),
            tags: index.tags.len(),
            corrupted_records: index.corrupted,
        })
    }

    /// Append records in one transaction, returning their sequence numbers.
    fn append(&self, entries: &[(String, RecordKind, String)]) -> Result<Vec<i64>> {
        let written_at = Utc::now().to_rfc3339();
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut seqs = Vec::with_capacity(entries.len());
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO records (chunk_id, kind, payload, written_at) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (chunk_id, kind, payload) in entries {
                stmt.execute(params![chunk_id, kind.as_str(), payload, written_at])?;
                seqs.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;
        Ok(seqs)
    }
}

fn apply_access(chunk: &mut MemoryChunk, count: Option<i64>, accessed: Option<String>) {
    if let Some(count) = count {
        chunk.metadata.access_count = count.max(0) as u64;
    }
    if let Some(at) = accessed
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    {
        chunk.metadata.accessed_at = at.with_timezone(&Utc);
    }
}

/// Exclusive write access to a partition.
pub(crate) struct PartitionWriter<'a> {
    partition: &'a Partition,
    _guard: MutexGuard<'a, ()>,
}

impl PartitionWriter<'_> {
    /// Append chunk records. Each record embeds the chunk's current outgoing edges.
    pub fn append_chunks(&self, chunks: &[MemoryChunk]) -> Result<()> {
        let mut entries = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let mut record = chunk.clone();
            record.links = self.partition.outgoing(&chunk.id, None)?;
            entries.push((
                chunk.id.to_string(),
                RecordKind::Chunk,
                serde_json::to_string(&record)?,
            ));
        }

        let seqs = self.partition.append(&entries)?;
        let mut index = self.partition.write_index()?;
        for (chunk, seq) in chunks.iter().zip(seqs) {
            index.apply_chunk(seq, chunk);
            index.records += 1;
        }
        debug!(partition = %self.partition.label, count = chunks.len(), "Appended chunk records");
        Ok(())
    }

    pub fn append_tombstone(&self, id: &ChunkId, permanent: bool) -> Result<Tombstone> {
        let tombstone = Tombstone {
            tombstone: true,
            id: id.clone(),
            layer: self.partition.key.layer,
            deleted_at: Utc::now(),
            permanent,
        };
        let seqs = self.partition.append(&[(
            id.to_string(),
            RecordKind::Tombstone,
            serde_json::to_string(&tombstone)?,
        )])?;

        let mut index = self.partition.write_index()?;
        for seq in seqs {
            index.apply_tombstone(seq, &tombstone);
            index.records += 1;
        }
        info!(partition = %self.partition.label, chunk_id = %id, permanent, "Tombstoned chunk");
        Ok(tombstone)
    }

    pub fn append_edges(&self, edges: &[Edge]) -> Result<()> {
        if edges.is_empty() {
            return Ok(());
        }
        let mut entries = Vec::with_capacity(edges.len());
        for edge in edges {
            entries.push((
                edge.source_id.to_string(),
                RecordKind::Edge,
                serde_json::to_string(edge)?,
            ));
        }

        let seqs = self.partition.append(&entries)?;
        let mut index = self.partition.write_index()?;
        for (edge, seq) in edges.iter().zip(seqs) {
            index.apply_edge(seq, edge.clone());
            index.records += 1;
        }
        debug!(partition = %self.partition.label, count = edges.len(), "Appended edge records");
        Ok(())
    }

    /// Drop records no read can reach any more.
    ///
    /// Kept: the latest record of each live chunk, the latest tombstone of
    /// each soft-deleted chunk, and the current record of each edge. Chunks
    /// deleted permanently, or soft-deleted longer than `retention` ago, lose
    /// every record, as do their outgoing edges and automatic edges pointing
    /// at them.
    pub fn compact(&self, retention: Duration) -> Result<CompactionReport> {
        let cutoff = Utc::now() - retention;
        let (keep, purged, dropped_edges) = {
            let index = self.partition.read_index()?;
            let purged: HashSet<ChunkId> = index
                .tombstones
                .iter()
                .filter(|(_, t)| t.permanent || t.deleted_at < cutoff)
                .map(|(id, _)| id.clone())
                .collect();

            let mut keep: HashSet<i64> = index.live.values().map(|s| s.seq).collect();
            keep.extend(
                index
                    .tombstones
                    .iter()
                    .filter(|(id, _)| !purged.contains(*id))
                    .map(|(_, t)| t.seq),
            );

            let mut dropped_edges = Vec::new();
            for (source, edges) in &index.outgoing {
                for e in edges {
                    let orphaned = purged.contains(source)
                        || (purged.contains(&e.edge.target_id) && !e.edge.edge_type.is_manual());
                    if orphaned {
                        dropped_edges.push(e.edge.key());
                    } else {
                        keep.insert(e.seq);
                    }
                }
            }
            (keep, purged, dropped_edges)
        };

        let removed = {
            let mut conn = self.partition.lock_conn()?;
            let tx = conn.transaction()?;
            let all: Vec<i64> = {
                let mut stmt = tx.prepare("SELECT seq FROM records")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            let mut removed = 0usize;
            {
                let mut delete = tx.prepare_cached("DELETE FROM records WHERE seq = ?1")?;
                for seq in all.iter().filter(|s| !keep.contains(s)) {
                    removed += delete.execute(params![seq])?;
                }
                let mut forget = tx.prepare_cached("DELETE FROM access WHERE chunk_id = ?1")?;
                for id in &purged {
                    forget.execute(params![id.as_str()])?;
                }
            }
            tx.commit()?;
            removed
        };

        let remaining = {
            let mut index = self.partition.write_index()?;
            for id in &purged {
                index.tombstones.remove(id);
                index.outgoing.remove(id);
            }
            for key in &dropped_edges {
                if let Some(edges) = index.outgoing.get_mut(&key.source_id) {
                    edges.retain(|e| {
                        !(e.edge.target_id == key.target_id && e.edge.edge_type == key.edge_type)
                    });
                }
            }
            index.outgoing.retain(|_, edges| !edges.is_empty());
            index.records = keep.len();
            index.corrupted = 0;
            index.records
        };

        let mut purged_chunks: Vec<ChunkId> = purged.into_iter().collect();
        purged_chunks.sort();
        let pruned_edge_sources: Vec<ChunkId> = dropped_edges
            .into_iter()
            .map(|k| k.source_id)
            .filter(|id| purged_chunks.binary_search(id).is_err())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        info!(
            partition = %self.partition.label,
            removed,
            purged = purged_chunks.len(),
            "Compacted partition"
        );

        Ok(CompactionReport {
            partition: self.partition.key.clone(),
            removed_records: removed,
            purged_chunks,
            pruned_edge_sources,
            remaining_records: remaining,
        })
    }
}
