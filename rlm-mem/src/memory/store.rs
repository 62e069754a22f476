//! Layered memory store: policy-checked access to the partition logs.

use chrono::{Duration, Utc};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use super::partition::{CompactionReport, Partition, PartitionStats, PartitionWriter};
use super::search::score_chunks;
use super::types::{
    validate_id, ChunkFilter, ChunkId, ChunkMetadata, ChunkUpdate, Edge, EdgeType, MemoryChunk,
    NewChunk, ScoredChunk,
};
use crate::chunking::count_tokens;
use crate::error::{Error, Result};
use crate::policy::{Identity, Layer, PartitionKey, PolicyResolver, ResolvedPolicy, Scope};

/// Where partition logs live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// Every partition is a private in-memory database
    InMemory,
    /// `<project_root>/.agents/memory/...` for project layers, `user_root/...` for user layers
    Disk {
        project_root: PathBuf,
        user_root: PathBuf,
    },
}

impl StorageBackend {
    /// Memory directory of a project.
    pub fn project_memory_dir(project_root: impl Into<PathBuf>) -> PathBuf {
        project_root.into().join(".agents").join("memory")
    }

    /// Database file of a partition, or `None` for in-memory storage.
    pub fn path_for(&self, key: &PartitionKey) -> Result<Option<PathBuf>> {
        let StorageBackend::Disk {
            project_root,
            user_root,
        } = self
        else {
            return Ok(None);
        };

        let base = match key.layer.scope() {
            Scope::Project => Self::project_memory_dir(project_root.clone()),
            Scope::User => user_root.clone(),
        };
        let dir = match &key.agent_id {
            Some(agent) => {
                validate_id(agent)?;
                base.join("agents").join(agent)
            }
            None => base.join("global"),
        };
        Ok(Some(dir.join("memory.db")))
    }
}

/// Notified after every committed write, while the partition write lock is
/// still held.
pub trait PartitionObserver: Send + Sync {
    fn on_commit(&self, partition: &PartitionKey, ids: &[ChunkId]);
}

/// Policy-scoped store over one partition log per layer and scope.
///
/// Every call takes the caller's [`Identity`]; the store resolves it against
/// its policy on each call and only touches partitions the result allows.
pub struct LayeredMemoryStore {
    backend: StorageBackend,
    resolver: PolicyResolver,
    max_chunk_tokens: u32,
    partitions: RwLock<HashMap<PartitionKey, Arc<Partition>>>,
    observers: RwLock<Vec<Arc<dyn PartitionObserver>>>,
}

impl LayeredMemoryStore {
    pub fn open(backend: StorageBackend, resolver: PolicyResolver, max_chunk_tokens: u32) -> Self {
        Self {
            backend,
            resolver,
            max_chunk_tokens,
            partitions: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// In-memory store (for testing).
    pub fn in_memory(resolver: PolicyResolver) -> Self {
        Self::open(StorageBackend::InMemory, resolver, 800)
    }

    pub fn add_observer(&self, observer: Arc<dyn PartitionObserver>) -> Result<()> {
        self.observers
            .write()
            .map_err(|e| Error::Internal(format!("Failed to lock observers: {}", e)))?
            .push(observer);
        Ok(())
    }

    pub fn resolver(&self) -> &PolicyResolver {
        &self.resolver
    }

    pub fn resolve(&self, identity: &Identity) -> Result<ResolvedPolicy> {
        self.resolver.resolve(identity)
    }

    fn notify(&self, partition: &PartitionKey, ids: &[ChunkId]) -> Result<()> {
        let observers = self
            .observers
            .read()
            .map_err(|e| Error::Internal(format!("Failed to lock observers: {}", e)))?;
        for observer in observers.iter() {
            observer.on_commit(partition, ids);
        }
        Ok(())
    }

    /// The partition for `key`. With `create == false` a partition with no
    /// file on disk yet is reported as `None` instead of being created.
    fn partition(&self, key: &PartitionKey, create: bool) -> Result<Option<Arc<Partition>>> {
        {
            let partitions = self
                .partitions
                .read()
                .map_err(|e| Error::Internal(format!("Failed to lock partitions: {}", e)))?;
            if let Some(partition) = partitions.get(key) {
                return Ok(Some(Arc::clone(partition)));
            }
        }

        let path = self.backend.path_for(key)?;
        if !create && path.as_ref().is_some_and(|p| !p.exists()) {
            return Ok(None);
        }

        let mut partitions = self
            .partitions
            .write()
            .map_err(|e| Error::Internal(format!("Failed to lock partitions: {}", e)))?;
        if let Some(partition) = partitions.get(key) {
            return Ok(Some(Arc::clone(partition)));
        }
        let partition = Arc::new(Partition::open(key.clone(), path.as_deref())?);
        partitions.insert(key.clone(), Arc::clone(&partition));
        Ok(Some(partition))
    }

    fn readable_partitions(
        &self,
        policy: &ResolvedPolicy,
        layers: Option<&[Layer]>,
    ) -> Result<Vec<Arc<Partition>>> {
        let mut out = Vec::new();
        for key in policy.readable_in(layers) {
            if let Some(partition) = self.partition(&key, false)? {
                out.push(partition);
            }
        }
        Ok(out)
    }

    /// Find the live chunk `id` in the caller's readable partitions, narrowest first.
    fn locate(
        &self,
        policy: &ResolvedPolicy,
        id: &ChunkId,
    ) -> Result<Option<(Arc<Partition>, MemoryChunk)>> {
        for partition in self.readable_partitions(policy, None)? {
            if let Some(chunk) = partition.read_chunk(id)? {
                if visible(&policy.identity, chunk.metadata.project_id.as_deref()) {
                    return Ok(Some((partition, chunk)));
                }
            }
        }
        Ok(None)
    }

    fn check_writable(&self, policy: &ResolvedPolicy, partition: &Partition) -> Result<()> {
        if policy.can_write(partition.key()) {
            Ok(())
        } else {
            warn!(identity = %policy.identity, partition = %partition.key(), "Write denied by policy");
            Err(Error::policy(format!(
                "{} may not write to {}",
                policy.identity,
                partition.key()
            )))
        }
    }

    fn prepare(&self, policy: &ResolvedPolicy, layer: Layer, new: NewChunk) -> Result<MemoryChunk> {
        if new.conversation_id.trim().is_empty() {
            return Err(Error::validation("conversation_id is required"));
        }
        check_confidence(new.confidence)?;

        let content = policy.redact(&new.content)?.text;
        if content.trim().is_empty() {
            return Err(Error::validation("content is empty"));
        }
        let token_count = count_tokens(&content);
        if token_count > self.max_chunk_tokens {
            return Err(Error::validation(format!(
                "token_count {} exceeds the limit of {}",
                token_count, self.max_chunk_tokens
            )));
        }

        let now = Utc::now();
        Ok(MemoryChunk {
            id: ChunkId::generate(),
            content,
            token_count,
            chunk_type: new.chunk_type,
            metadata: ChunkMetadata {
                created_at: now,
                modified_at: now,
                accessed_at: now,
                access_count: 0,
                confidence: new.confidence,
                conversation_id: new.conversation_id,
                project_id: project_stamp(&policy.identity, layer),
                agent_id: Some(policy.identity.agent_id.clone()),
            },
            tags: policy.redactor().redact_tags(&new.tags)?,
            layer,
            links: Vec::new(),
        })
    }

    // ==================== Chunk Operations ====================

    /// Create one chunk in `layer`, or in the caller's default write layer.
    pub fn create(
        &self,
        identity: &Identity,
        chunk: NewChunk,
        layer: Option<Layer>,
    ) -> Result<MemoryChunk> {
        let mut created = self.create_batch(identity, vec![chunk], layer)?;
        created
            .pop()
            .ok_or_else(|| Error::Internal("empty batch result".into()))
    }

    /// Create several chunks in one append. Either all of them are stored or none.
    pub fn create_batch(
        &self,
        identity: &Identity,
        chunks: Vec<NewChunk>,
        layer: Option<Layer>,
    ) -> Result<Vec<MemoryChunk>> {
        let policy = self.resolve(identity)?;
        let layer = match layer {
            Some(layer) => layer,
            None => policy.default_write_layer()?,
        };
        let key = policy.write_partition(layer)?;

        let stored = chunks
            .into_iter()
            .map(|new| self.prepare(&policy, layer, new))
            .collect::<Result<Vec<_>>>()?;
        if stored.is_empty() {
            return Ok(stored);
        }

        let partition = self.require_partition(&key)?;
        let writer = partition.writer()?;
        writer.append_chunks(&stored)?;
        let ids: Vec<ChunkId> = stored.iter().map(|c| c.id.clone()).collect();
        self.notify(&key, &ids)?;
        drop(writer);

        info!(identity = %identity, partition = %key, count = stored.len(), "Created chunks");
        Ok(stored)
    }

    fn require_partition(&self, key: &PartitionKey) -> Result<Arc<Partition>> {
        self.partition(key, true)?
            .ok_or_else(|| Error::Internal(format!("partition {} unavailable", key)))
    }

    /// Read a chunk and record the access.
    pub fn get(&self, identity: &Identity, id: &ChunkId) -> Result<Option<MemoryChunk>> {
        let policy = self.resolve(identity)?;
        let Some((partition, mut chunk)) = self.locate(&policy, id)? else {
            return Ok(None);
        };
        let (count, at) = partition.touch(id)?;
        chunk.metadata.access_count = count;
        chunk.metadata.accessed_at = at;
        Ok(Some(chunk))
    }

    /// Read a chunk without recording an access.
    pub fn peek(&self, identity: &Identity, id: &ChunkId) -> Result<Option<MemoryChunk>> {
        let policy = self.resolve(identity)?;
        Ok(self.locate(&policy, id)?.map(|(_, chunk)| chunk))
    }

    /// Append a new version of a chunk. The layer never changes.
    pub fn update(
        &self,
        identity: &Identity,
        id: &ChunkId,
        update: ChunkUpdate,
    ) -> Result<MemoryChunk> {
        if update.is_empty() {
            return Err(Error::validation("update has no fields"));
        }
        let policy = self.resolve(identity)?;
        let (partition, _) = self
            .locate(&policy, id)?
            .ok_or_else(|| Error::not_found(format!("chunk {}", id)))?;
        self.check_writable(&policy, &partition)?;

        let writer = partition.writer()?;
        // Re-read under the write lock so concurrent updates do not lose fields
        let mut chunk = partition
            .read_chunk(id)?
            .ok_or_else(|| Error::not_found(format!("chunk {}", id)))?;

        if let Some(content) = update.content {
            let content = policy.redact(&content)?.text;
            if content.trim().is_empty() {
                return Err(Error::validation("content is empty"));
            }
            let token_count = count_tokens(&content);
            if token_count > self.max_chunk_tokens {
                return Err(Error::validation(format!(
                    "token_count {} exceeds the limit of {}",
                    token_count, self.max_chunk_tokens
                )));
            }
            chunk.content = content;
            chunk.token_count = token_count;
        }
        if let Some(chunk_type) = update.chunk_type {
            chunk.chunk_type = chunk_type;
        }
        if let Some(tags) = update.tags {
            chunk.tags = policy.redactor().redact_tags(&tags)?;
        }
        if let Some(confidence) = update.confidence {
            check_confidence(confidence)?;
            chunk.metadata.confidence = confidence;
        }
        chunk.metadata.modified_at = Utc::now();

        writer.append_chunks(std::slice::from_ref(&chunk))?;
        self.notify(partition.key(), std::slice::from_ref(id))?;
        drop(writer);

        debug!(identity = %identity, chunk_id = %id, "Updated chunk");
        Ok(chunk)
    }

    /// Tombstone a chunk. A permanent delete also removes its records at the
    /// next compaction.
    pub fn delete(&self, identity: &Identity, id: &ChunkId, permanent: bool) -> Result<()> {
        let policy = self.resolve(identity)?;
        let (partition, _) = self
            .locate(&policy, id)?
            .ok_or_else(|| Error::not_found(format!("chunk {}", id)))?;
        self.check_writable(&policy, &partition)?;

        let writer = partition.writer()?;
        if !partition.is_live(id)? {
            return Err(Error::not_found(format!("chunk {}", id)));
        }
        writer.append_tombstone(id, permanent)?;
        self.notify(partition.key(), std::slice::from_ref(id))?;
        Ok(())
    }

    /// Live chunks matching `filter` across readable partitions, newest first.
    ///
    /// Does not record accesses.
    pub fn list(&self, identity: &Identity, filter: &ChunkFilter) -> Result<Vec<MemoryChunk>> {
        let policy = self.resolve(identity)?;
        let mut found = Vec::new();
        for partition in self.readable_partitions(&policy, filter.layers.as_deref())? {
            for (id, summary) in partition.filter(filter)? {
                if !visible(identity, summary.project_id.as_deref()) {
                    continue;
                }
                found.push((summary.created_at, id, Arc::clone(&partition)));
            }
        }
        found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        if let Some(limit) = filter.limit {
            found.truncate(limit);
        }

        let mut chunks = Vec::with_capacity(found.len());
        for (_, id, partition) in found {
            if let Some(chunk) = partition.read_chunk(&id)? {
                chunks.push(chunk);
            }
        }
        Ok(chunks)
    }

    /// Keyword search over every readable chunk.
    pub fn search(
        &self,
        identity: &Identity,
        query: &str,
        limit: usize,
        layers: Option<&[Layer]>,
    ) -> Result<Vec<ScoredChunk>> {
        let policy = self.resolve(identity)?;
        let mut candidates = Vec::new();
        for partition in self.readable_partitions(&policy, layers)? {
            candidates.extend(
                partition
                    .scan_live()?
                    .into_iter()
                    .filter(|c| visible(identity, c.metadata.project_id.as_deref())),
            );
        }
        Ok(score_chunks(query, candidates, Utc::now(), limit))
    }

    /// Readable live chunks sharing at least one tag, with the number of shared tags.
    pub fn tag_overlap(
        &self,
        identity: &Identity,
        tags: &BTreeSet<String>,
    ) -> Result<Vec<(ChunkId, usize)>> {
        let policy = self.resolve(identity)?;
        let mut overlap = Vec::new();
        for partition in self.readable_partitions(&policy, None)? {
            for (id, (shared, _)) in partition.tag_overlap(tags)? {
                let shown = partition
                    .summary(&id)?
                    .is_some_and(|s| visible(identity, s.project_id.as_deref()));
                if shown {
                    overlap.push((id, shared));
                }
            }
        }
        Ok(overlap)
    }

    // ==================== Edge Operations ====================

    /// Outgoing edges of a readable chunk.
    pub fn edges(
        &self,
        identity: &Identity,
        id: &ChunkId,
        edge_type: Option<EdgeType>,
    ) -> Result<Vec<Edge>> {
        let policy = self.resolve(identity)?;
        match self.locate(&policy, id)? {
            Some((partition, _)) => partition.outgoing(id, edge_type),
            None => Err(Error::not_found(format!("chunk {}", id))),
        }
    }

    /// Chunks linked from `id`, skipping targets the caller cannot read.
    pub fn get_links(
        &self,
        identity: &Identity,
        id: &ChunkId,
        edge_type: Option<EdgeType>,
    ) -> Result<Vec<(Edge, MemoryChunk)>> {
        let policy = self.resolve(identity)?;
        let mut linked = Vec::new();
        for edge in self.edges(identity, id, edge_type)? {
            if let Some((_, target)) = self.locate(&policy, &edge.target_id)? {
                linked.push((edge, target));
            }
        }
        Ok(linked)
    }

    /// Persist edges in their source chunks' partitions.
    pub fn put_edges(&self, identity: &Identity, edges: &[Edge]) -> Result<()> {
        let policy = self.resolve(identity)?;
        let mut by_partition: HashMap<PartitionKey, (Arc<Partition>, Vec<Edge>)> = HashMap::new();
        for edge in edges {
            edge.validate()?;
            let (partition, _) = self
                .locate(&policy, &edge.source_id)?
                .ok_or_else(|| Error::not_found(format!("chunk {}", edge.source_id)))?;
            self.check_writable(&policy, &partition)?;
            by_partition
                .entry(partition.key().clone())
                .or_insert_with(|| (partition, Vec::new()))
                .1
                .push(edge.clone());
        }

        for (key, (partition, edges)) in by_partition {
            let writer = partition.writer()?;
            writer.append_edges(&edges)?;
            let sources: Vec<ChunkId> = edges
                .iter()
                .map(|e| e.source_id.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            self.notify(&key, &sources)?;
        }
        Ok(())
    }

    /// Add a manual `supports` or `contradicts` edge.
    pub fn link(
        &self,
        identity: &Identity,
        source: &ChunkId,
        target: &ChunkId,
        edge_type: EdgeType,
        strength: f64,
        rationale: Option<String>,
    ) -> Result<Edge> {
        if !edge_type.is_manual() {
            return Err(Error::validation(format!(
                "{} edges are derived automatically",
                edge_type
            )));
        }
        if !(0.0..=1.0).contains(&strength) {
            return Err(Error::validation(format!(
                "strength {} outside [0, 1]",
                strength
            )));
        }
        let policy = self.resolve(identity)?;
        if self.locate(&policy, target)?.is_none() {
            return Err(Error::not_found(format!("chunk {}", target)));
        }

        let mut edge = Edge::new(source.clone(), target.clone(), edge_type, strength);
        if let Some(rationale) = rationale {
            edge = edge.with_rationale(policy.redact(&rationale)?.text);
        }
        self.put_edges(identity, std::slice::from_ref(&edge))?;
        info!(identity = %identity, source = %source, target = %target, edge_type = %edge_type, "Linked chunks");
        Ok(edge)
    }

    // ==================== Layer Migration ====================

    /// Move a chunk to another layer, keeping its id and outgoing edges.
    ///
    /// The chunk is re-appended in the target partition and tombstoned in the
    /// source one. Both write locks are taken in partition key order.
    pub fn migrate(&self, identity: &Identity, id: &ChunkId, to_layer: Layer) -> Result<MemoryChunk> {
        let policy = self.resolve(identity)?;
        let (source, _) = self
            .locate(&policy, id)?
            .ok_or_else(|| Error::not_found(format!("chunk {}", id)))?;
        self.check_writable(&policy, &source)?;
        let target_key = policy.write_partition(to_layer)?;
        if &target_key == source.key() {
            return Err(Error::validation(format!("chunk {} is already in {}", id, to_layer)));
        }
        let target = self.require_partition(&target_key)?;

        let (first, second) = if source.key() < target.key() {
            (&source, &target)
        } else {
            (&target, &source)
        };
        let first_writer = first.writer()?;
        let second_writer = second.writer()?;
        let (source_writer, target_writer): (&PartitionWriter<'_>, &PartitionWriter<'_>) =
            if source.key() < target.key() {
                (&first_writer, &second_writer)
            } else {
                (&second_writer, &first_writer)
            };

        let mut chunk = source
            .read_chunk(id)?
            .ok_or_else(|| Error::not_found(format!("chunk {}", id)))?;
        let edges = std::mem::take(&mut chunk.links);
        chunk.layer = to_layer;
        chunk.metadata.modified_at = Utc::now();
        chunk.metadata.project_id = project_stamp(identity, to_layer);

        target_writer.append_chunks(std::slice::from_ref(&chunk))?;
        target_writer.append_edges(&edges)?;
        source_writer.append_tombstone(id, false)?;
        self.notify(target.key(), std::slice::from_ref(id))?;
        self.notify(source.key(), std::slice::from_ref(id))?;

        info!(identity = %identity, chunk_id = %id, from = %source.key(), to = %target_key, "Migrated chunk");
        chunk.links = edges;
        Ok(chunk)
    }

    /// Append an existing chunk (id, timestamps and edges kept) to `layer`.
    ///
    /// Returns `false` without writing when the id is already known to any
    /// partition the caller can read or the target partition.
    pub fn import_chunk(&self, identity: &Identity, chunk: MemoryChunk, layer: Layer) -> Result<bool> {
        let policy = self.resolve(identity)?;
        let key = policy.write_partition(layer)?;
        let target = self.require_partition(&key)?;
        if target.knows(&chunk.id)? {
            return Ok(false);
        }
        for partition in self.readable_partitions(&policy, None)? {
            if partition.knows(&chunk.id)? {
                return Ok(false);
            }
        }

        check_confidence(chunk.metadata.confidence)?;
        let mut chunk = chunk;
        chunk.content = policy.redact(&chunk.content)?.text;
        if chunk.content.trim().is_empty() {
            return Err(Error::validation(format!("chunk {} has no content", chunk.id)));
        }
        chunk.token_count = count_tokens(&chunk.content);
        chunk.tags = policy.redactor().redact_tags(&chunk.tags)?;
        chunk.layer = layer;
        chunk.metadata.project_id = project_stamp(identity, layer);
        let edges: Vec<Edge> = std::mem::take(&mut chunk.links)
            .into_iter()
            .filter(|e| e.source_id == chunk.id && e.validate().is_ok())
            .collect();

        let writer = target.writer()?;
        writer.append_chunks(std::slice::from_ref(&chunk))?;
        writer.append_edges(&edges)?;
        self.notify(&key, std::slice::from_ref(&chunk.id))?;
        Ok(true)
    }

    // ==================== Maintenance ====================

    /// Compact every writable partition of the caller.
    pub fn compact(&self, identity: &Identity) -> Result<Vec<CompactionReport>> {
        let policy = self.resolve(identity)?;
        let retention = Duration::days(i64::from(policy.retention_days));
        let mut reports = Vec::new();
        for key in &policy.writable {
            if let Some(partition) = self.partition(key, false)? {
                let writer = partition.writer()?;
                let report = writer.compact(retention)?;
                let touched: Vec<ChunkId> = report
                    .purged_chunks
                    .iter()
                    .chain(&report.pruned_edge_sources)
                    .cloned()
                    .collect();
                if !touched.is_empty() {
                    self.notify(key, &touched)?;
                }
                reports.push(report);
            }
        }
        Ok(reports)
    }

    /// Counters of every readable partition that exists.
    pub fn stats(&self, identity: &Identity) -> Result<Vec<PartitionStats>> {
        let policy = self.resolve(identity)?;
        self.readable_partitions(&policy, None)?
            .iter()
            .map(|p| p.stats())
            .collect()
    }
}

fn check_confidence(confidence: f64) -> Result<()> {
    if (0.0..=1.0).contains(&confidence) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "confidence {} outside [0, 1]",
            confidence
        )))
    }
}

/// Project-layer chunks remember their project; user-layer chunks are shared.
fn project_stamp(identity: &Identity, layer: Layer) -> Option<String> {
    match layer.scope() {
        Scope::Project => Some(identity.project_id.clone()),
        Scope::User => None,
    }
}

fn visible(identity: &Identity, project_id: Option<&str>) -> bool {
    project_id.map_or(true, |p| p == identity.project_id)
}
