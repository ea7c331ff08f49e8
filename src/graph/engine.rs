//! `GraphEngine`: the mutable front door over immutable versions.
//!
//! The engine owns the current snapshot pointer, the writer lock and the
//! pin registry. Reads capture the current `Arc<Snapshot>` once and never
//! block. Commits, tag changes, compaction and reclamation serialize on the
//! writer lock and each end by publishing a manifest (or deleting segment
//! bytes no version needs any more).
//!
//! `GraphEngine` is a cheap handle; clones share one engine. A batch holds
//! such a handle, so it can outlive the borrow that created it.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use serde::Serialize;

use crate::config::EngineConfig;
use crate::error::{GraphError, Result};
use crate::graph::batch::Batch;
use crate::graph::commit::{self, CommitOutcome};
use crate::graph::diff::{self, SnapshotDiff};
use crate::graph::impact;
use crate::graph::snapshot::{Snapshot, SnapshotInfo};
use crate::graph::GraphReader;
use crate::storage::compaction::{
    self, can_compact, should_compact, CompactionInfo, CompactionResult, CompactionTarget,
};
use crate::storage::manifest::{now_ms, Manifest, ManifestStore, CURRENT_FILE};
use crate::storage::query::{EdgeQuery, NodeQuery};
use crate::storage::store::SegmentStore;
use crate::storage::types::{CommitDelta, EdgeRecord, NodeRecord};
use crate::storage::write_buffer::WriteBuffer;

// ── Engine state ────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct EngineInner {
    path: Option<PathBuf>,
    config: EngineConfig,
    manifests: ManifestStore,
    segments: SegmentStore,
    current: RwLock<Arc<Snapshot>>,
    /// Serializes every operation that publishes or deletes.
    writer: Mutex<()>,
    batch_open: AtomicBool,
    /// version -> number of live pins
    pins: Mutex<BTreeMap<u64, usize>>,
}

#[derive(Debug, Clone)]
pub struct GraphEngine {
    inner: Arc<EngineInner>,
}

/// Engine-wide counters, as reported by `stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub version: u64,
    pub partitions: usize,
    pub node_segments: usize,
    pub edge_segments: usize,
    pub total_nodes: u64,
    pub total_edges: u64,
    pub tags: usize,
    pub pinned_versions: Vec<u64>,
    pub batch_open: bool,
    pub ephemeral: bool,
    pub last_compaction: Option<CompactionInfo>,
    /// Publications whose pointer rename may not be durable yet.
    pub pointer_sync_failures: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclaimResult {
    pub segments_removed: usize,
    pub segments_retained: usize,
}

// ── Constructors ────────────────────────────────────────────────────

impl GraphEngine {
    /// Initialize a new database at `path`.
    pub fn create<P: AsRef<Path>>(path: P, config: EngineConfig) -> Result<Self> {
        let path = path.as_ref();
        let manifests = ManifestStore::create(path, config.durability)?;
        let segments = SegmentStore::disk(path, config.durability)?;
        tracing::info!(path = %path.display(), "created database");
        Self::assemble(Some(path.to_path_buf()), config, manifests, segments)
    }

    /// Open an existing database at the version named by its pointer file.
    ///
    /// Segments numbered at or past the manifest's `next_segment_id` were
    /// written by a commit that never published; they are removed.
    pub fn open<P: AsRef<Path>>(path: P, config: EngineConfig) -> Result<Self> {
        let path = path.as_ref();
        let manifests = ManifestStore::open(path, config.durability)?;
        let segments = SegmentStore::disk(path, config.durability)?;

        let next_id = manifests.current().next_segment_id;
        let mut orphans = 0usize;
        for (id, kind) in segments.list()? {
            if id >= next_id {
                segments.remove(id, kind)?;
                orphans += 1;
            }
        }
        if orphans > 0 {
            tracing::warn!(orphans, "removed segments of an unpublished commit");
        }

        let engine = Self::assemble(Some(path.to_path_buf()), config, manifests, segments)?;
        tracing::info!(
            path = %path.display(),
            version = engine.version(),
            "opened database"
        );
        Ok(engine)
    }

    pub fn open_or_create<P: AsRef<Path>>(path: P, config: EngineConfig) -> Result<Self> {
        if path.as_ref().join(CURRENT_FILE).exists() {
            Self::open(path, config)
        } else {
            Self::create(path, config)
        }
    }

    /// In-memory engine with the same semantics and nothing on disk.
    pub fn create_ephemeral(config: EngineConfig) -> Self {
        let manifests = ManifestStore::memory();
        let current = Arc::new(Snapshot::empty(manifests.current()));
        Self::from_parts(None, config, manifests, SegmentStore::memory(), current)
    }

    fn assemble(
        path: Option<PathBuf>,
        config: EngineConfig,
        manifests: ManifestStore,
        segments: SegmentStore,
    ) -> Result<Self> {
        let current = Arc::new(Snapshot::open(manifests.current(), &segments, None)?);
        Ok(Self::from_parts(path, config, manifests, segments, current))
    }

    fn from_parts(
        path: Option<PathBuf>,
        config: EngineConfig,
        manifests: ManifestStore,
        segments: SegmentStore,
        current: Arc<Snapshot>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                path,
                config,
                manifests,
                segments,
                current: RwLock::new(current),
                writer: Mutex::new(()),
                batch_open: AtomicBool::new(false),
                pins: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.inner.path.is_none()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}

// ── Snapshots ───────────────────────────────────────────────────────

impl GraphEngine {
    /// The current read view.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        match self.inner.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version()
    }

    /// Read view of any version still in the chain. Fails with `NotFound`
    /// when the version or one of its segments no longer exists.
    pub fn snapshot_at(&self, version: u64) -> Result<Arc<Snapshot>> {
        let current = self.snapshot();
        if version == current.version() {
            return Ok(current);
        }
        let manifest = self.inner.manifests.load(version)?;
        Ok(Arc::new(Snapshot::open(manifest, &self.inner.segments, Some(&current))?))
    }

    fn install(&self, snapshot: Arc<Snapshot>) {
        match self.inner.current.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    fn write_lock(&self) -> MutexGuard<'_, ()> {
        // The guarded value is (), so a poisoned lock carries no bad state.
        self.inner.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish a successor that only changes manifest metadata.
    fn publish_metadata(&self, edit: impl FnOnce(&mut Manifest) -> Result<()>) -> Result<u64> {
        let _w = self.write_lock();
        let current = self.snapshot();
        let mut draft = current.manifest().successor();
        edit(&mut draft)?;
        let snapshot = Snapshot::open(Arc::new(draft.clone()), &self.inner.segments, Some(&current))?;
        let published = self.inner.manifests.publish(draft)?;
        self.install(Arc::new(snapshot));
        Ok(published.version)
    }
}

// ── Batches ─────────────────────────────────────────────────────────

impl GraphEngine {
    /// Open the engine's single write batch. A second concurrent batch is
    /// refused with `Conflict`.
    pub fn begin_batch(&self) -> Result<Batch> {
        if self
            .inner
            .batch_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(GraphError::Conflict("a batch is already open on this engine".into()));
        }
        Ok(Batch::new(self.clone()))
    }

    pub(crate) fn release_batch(&self) {
        self.inner.batch_open.store(false, Ordering::Release);
    }

    pub fn batch_open(&self) -> bool {
        self.inner.batch_open.load(Ordering::Acquire)
    }

    pub(crate) fn commit_buffer(
        &self,
        buffer: WriteBuffer,
        partitions: &[&str],
        protected_types: &[&str],
    ) -> Result<CommitDelta> {
        let _w = self.write_lock();
        let current = self.snapshot();
        let CommitOutcome { delta, snapshot } = commit::commit(
            &current,
            &self.inner.segments,
            &self.inner.manifests,
            buffer,
            partitions,
            protected_types,
        )?;
        if let Some(snapshot) = snapshot {
            self.install(snapshot);
        }
        Ok(delta)
    }
}

// ── Queries ─────────────────────────────────────────────────────────

impl GraphEngine {
    /// Partitions with at least one edge into `partitions`. Ask before
    /// committing them.
    pub fn find_dependent_partitions(&self, partitions: &[&str]) -> Vec<String> {
        impact::find_dependents(&self.snapshot(), partitions)
            .into_iter()
            .collect()
    }

    pub fn diff_snapshots(&self, from_version: u64, to_version: u64) -> Result<SnapshotDiff> {
        let from = self.snapshot_at(from_version)?;
        let to = self.snapshot_at(to_version)?;
        Ok(diff::diff(&from, &to))
    }
}

impl GraphReader for GraphEngine {
    fn get_node(&self, id: u128) -> Option<NodeRecord> {
        self.snapshot().get_node(id)
    }

    fn query_nodes(&self, query: &NodeQuery) -> Vec<NodeRecord> {
        self.snapshot().query_nodes(query)
    }

    fn query_edges(&self, query: &EdgeQuery) -> Vec<EdgeRecord> {
        self.snapshot().query_edges(query)
    }

    fn node_count(&self) -> u64 {
        self.snapshot().node_count()
    }

    fn edge_count(&self) -> u64 {
        self.snapshot().edge_count()
    }
}

// ── Tags ────────────────────────────────────────────────────────────

fn check_tag_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(GraphError::Protocol("tag name must not be empty".into()));
    }
    Ok(())
}

impl GraphEngine {
    /// Tag the current version. Returns the tagged version; the tag itself
    /// is recorded by publishing its successor.
    pub fn tag_snapshot(&self, name: &str) -> Result<u64> {
        check_tag_name(name)?;
        let mut tagged = 0;
        self.publish_metadata(|draft| {
            tagged = draft.version - 1;
            draft.tags.insert(name.to_string(), tagged);
            Ok(())
        })?;
        tracing::info!(tag = name, version = tagged, "tagged snapshot");
        Ok(tagged)
    }

    /// Tag an older version of the chain. Moving an existing tag is allowed.
    pub fn tag_version(&self, name: &str, version: u64) -> Result<()> {
        check_tag_name(name)?;
        self.inner.manifests.load(version)?;
        self.publish_metadata(|draft| {
            draft.tags.insert(name.to_string(), version);
            Ok(())
        })?;
        tracing::info!(tag = name, version, "tagged snapshot");
        Ok(())
    }

    pub fn untag_snapshot(&self, name: &str) -> Result<()> {
        self.publish_metadata(|draft| match draft.tags.remove(name) {
            Some(_) => Ok(()),
            None => Err(GraphError::NotFound(format!("tag {}", name))),
        })?;
        tracing::info!(tag = name, "removed tag");
        Ok(())
    }

    pub fn find_snapshot(&self, name: &str) -> Option<u64> {
        self.snapshot().manifest().tags.get(name).copied()
    }

    /// Versions of the chain, newest first.
    pub fn list_snapshots(&self, tagged_only: bool) -> Vec<SnapshotInfo> {
        let tags = self.snapshot().manifest().tags.clone();
        self.inner
            .manifests
            .chain()
            .iter()
            .map(|m| SnapshotInfo::from_manifest(m, &tags))
            .filter(|info| !tagged_only || !info.tags.is_empty())
            .collect()
    }
}

// ── Pins ────────────────────────────────────────────────────────────

/// Keeps one version's segments from reclamation while alive.
///
/// Derefs to the pinned [`Snapshot`].
#[derive(Debug)]
pub struct SnapshotPin {
    engine: GraphEngine,
    snapshot: Arc<Snapshot>,
}

impl SnapshotPin {
    pub fn version(&self) -> u64 {
        self.snapshot.version()
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }
}

impl Deref for SnapshotPin {
    type Target = Snapshot;

    fn deref(&self) -> &Snapshot {
        &self.snapshot
    }
}

impl Drop for SnapshotPin {
    fn drop(&mut self) {
        self.engine.unregister_pin(self.snapshot.version());
    }
}

impl GraphEngine {
    fn pins(&self) -> MutexGuard<'_, BTreeMap<u64, usize>> {
        self.inner.pins.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register_pin(&self, version: u64) {
        *self.pins().entry(version).or_insert(0) += 1;
        tracing::debug!(version, "pinned snapshot");
    }

    fn unregister_pin(&self, version: u64) {
        let mut pins = self.pins();
        if let Some(count) = pins.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&version);
                tracing::debug!(version, "unpinned snapshot");
            }
        }
    }

    /// Pin a version. The pin is registered before the segments are opened
    /// so a concurrent reclaim cannot remove them in between.
    pub fn pin_version(&self, version: u64) -> Result<SnapshotPin> {
        self.register_pin(version);
        match self.snapshot_at(version) {
            Ok(snapshot) => Ok(SnapshotPin {
                engine: self.clone(),
                snapshot,
            }),
            Err(e) => {
                self.unregister_pin(version);
                Err(e)
            }
        }
    }

    /// Pin the version a tag names.
    pub fn pin_snapshot(&self, name: &str) -> Result<SnapshotPin> {
        let version = self
            .find_snapshot(name)
            .ok_or_else(|| GraphError::NotFound(format!("tag {}", name)))?;
        self.pin_version(version)
    }

    pub fn pin_current(&self) -> SnapshotPin {
        let snapshot = self.snapshot();
        self.register_pin(snapshot.version());
        SnapshotPin {
            engine: self.clone(),
            snapshot,
        }
    }

    pub fn pinned_versions(&self) -> Vec<u64> {
        self.pins().keys().copied().collect()
    }
}

// ── Maintenance ─────────────────────────────────────────────────────

impl GraphEngine {
    /// Whether any partition is over the compaction threshold.
    pub fn needs_compaction(&self) -> bool {
        let config = &self.inner.config.compaction;
        self.snapshot().shards().any(|s| should_compact(s, config))
    }

    /// Compact partitions over the threshold.
    pub fn compact(&self) -> Result<CompactionResult> {
        self.run_compaction(false)
    }

    /// Compact every partition that has more than one segment of a kind or
    /// any tombstones.
    pub fn compact_all(&self) -> Result<CompactionResult> {
        self.run_compaction(true)
    }

    fn run_compaction(&self, force: bool) -> Result<CompactionResult> {
        let result = {
            let _w = self.write_lock();
            let start = Instant::now();
            let current = self.snapshot();
            let config = &self.inner.config.compaction;
            let candidates: Vec<_> = current
                .shards()
                .filter(|s| if force { can_compact(s) } else { should_compact(s, config) })
                .collect();
            if candidates.is_empty() {
                return Ok(CompactionResult::default());
            }

            let mut draft = current.manifest().successor();
            let jobs: Vec<_> = candidates
                .into_iter()
                .map(|shard| {
                    let target = CompactionTarget {
                        node_segment_id: draft.allocate_segment_id(),
                        edge_segment_id: draft.allocate_segment_id(),
                    };
                    (shard, target)
                })
                .collect();
            let done = compaction::compact_shards(jobs, &self.inner.segments)?;

            let mut result = CompactionResult::default();
            for c in &done {
                compaction::apply_to_manifest(&mut draft, c);
                result.partitions_compacted.push(c.partition.clone());
                result.segments_merged += c.input_segments.len() as u64;
                result.tombstones_removed += c.tombstones_removed;
                result.nodes_merged += c.node_segment.as_ref().map_or(0, |(_, m)| m.record_count);
                result.edges_merged += c.edge_segment.as_ref().map_or(0, |(_, m)| m.record_count);
            }
            draft.prune_empty_shards();
            draft.last_compaction = Some(CompactionInfo {
                manifest_version: draft.version,
                timestamp_ms: now_ms(),
                segments_merged: result.segments_merged as u32,
                partitions: done.len() as u32,
            });
            result.manifest_version = Some(draft.version);

            let published = Snapshot::open(Arc::new(draft.clone()), &self.inner.segments, Some(&current))
                .and_then(|snap| self.inner.manifests.publish(draft).map(|_| snap));
            match published {
                Ok(snap) => self.install(Arc::new(snap)),
                Err(e) => {
                    for c in &done {
                        compaction::discard(&self.inner.segments, c.written_segments());
                    }
                    return Err(e);
                }
            }
            result.duration_ms = start.elapsed().as_millis() as u64;
            tracing::info!(
                version = result.manifest_version,
                partitions = result.partitions_compacted.len(),
                segments_merged = result.segments_merged,
                nodes = result.nodes_merged,
                edges = result.edges_merged,
                tombstones_removed = result.tombstones_removed,
                duration_ms = result.duration_ms,
                "compaction published"
            );
            result
        };

        if self.inner.config.reclaim_after_compaction {
            self.reclaim()?;
        }
        Ok(result)
    }

    /// Delete segments that no current, tagged or pinned version references.
    /// Versions outside that set can no longer be read afterwards.
    pub fn reclaim(&self) -> Result<ReclaimResult> {
        let _w = self.write_lock();
        let current = self.snapshot();
        let manifest = current.manifest();

        let mut live = manifest.referenced_segments();
        let mut versions: BTreeSet<u64> = manifest.tags.values().copied().collect();
        versions.extend(self.pinned_versions());
        versions.remove(&manifest.version);
        for version in versions {
            live.extend(self.inner.manifests.load(version)?.referenced_segments());
        }

        let mut result = ReclaimResult::default();
        for (id, kind) in self.inner.segments.list()? {
            if live.contains(&(id, kind)) {
                result.segments_retained += 1;
            } else {
                self.inner.segments.remove(id, kind)?;
                result.segments_removed += 1;
            }
        }
        if result.segments_removed > 0 {
            self.inner.segments.sync()?;
        }
        tracing::info!(
            removed = result.segments_removed,
            retained = result.segments_retained,
            "reclaimed segments"
        );
        Ok(result)
    }

    pub fn stats(&self) -> EngineStats {
        let snapshot = self.snapshot();
        let manifest = snapshot.manifest();
        EngineStats {
            version: manifest.version,
            partitions: manifest.shards.len(),
            node_segments: manifest.node_segment_count(),
            edge_segments: manifest.edge_segment_count(),
            total_nodes: manifest.stats.total_nodes,
            total_edges: manifest.stats.total_edges,
            tags: manifest.tags.len(),
            pinned_versions: self.pinned_versions(),
            batch_open: self.batch_open(),
            ephemeral: self.is_ephemeral(),
            last_compaction: manifest.last_compaction.clone(),
            pointer_sync_failures: self.inner.manifests.pointer_sync_failures(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::id_from_semantic;
    use tempfile::TempDir;

    fn node(sem: &str, node_type: &str, partition: &str) -> NodeRecord {
        NodeRecord::new(sem, node_type, sem, partition)
    }

    fn commit_nodes(engine: &GraphEngine, partition: &str, names: &[&str]) -> CommitDelta {
        let mut batch = engine.begin_batch().unwrap();
        for n in names {
            batch.add_node(node(n, "FUNCTION", partition)).unwrap();
        }
        batch.commit(&[partition], &[]).unwrap()
    }

    #[test]
    fn test_second_batch_conflicts_until_first_ends() {
        let engine = GraphEngine::create_ephemeral(EngineConfig::relaxed());
        let batch = engine.begin_batch().unwrap();
        let err = engine.begin_batch().unwrap_err();
        assert!(matches!(err, GraphError::Conflict(_)));
        assert!(engine.stats().batch_open);
        drop(batch);
        assert!(engine.begin_batch().is_ok());
    }

    #[test]
    fn test_create_open_roundtrip() {
        let dir = TempDir::new().unwrap();
        {
            let engine = GraphEngine::create(dir.path(), EngineConfig::relaxed()).unwrap();
            commit_nodes(&engine, "a.js", &["a", "b"]);
        }
        let engine = GraphEngine::open(dir.path(), EngineConfig::relaxed()).unwrap();
        assert_eq!(engine.version(), 2);
        assert_eq!(engine.node_count(), 2);
        assert!(engine.get_node(id_from_semantic("b")).is_some());
        assert!(GraphEngine::create(dir.path(), EngineConfig::relaxed()).is_err());
    }

    #[test]
    fn test_open_removes_unpublished_segments() {
        let dir = TempDir::new().unwrap();
        {
            let engine = GraphEngine::create(dir.path(), EngineConfig::relaxed()).unwrap();
            commit_nodes(&engine, "a.js", &["a"]);
        }
        let store = SegmentStore::disk(dir.path(), crate::config::DurabilityMode::Relaxed).unwrap();
        store.write_nodes(50, vec![node("ghost", "FUNCTION", "a.js")]).unwrap();

        let engine = GraphEngine::open(dir.path(), EngineConfig::relaxed()).unwrap();
        assert!(store.list().unwrap().iter().all(|(id, _)| *id < 50));
        assert!(engine.get_node(id_from_semantic("ghost")).is_none());
        commit_nodes(&engine, "b.js", &["b"]);
    }

    #[test]
    fn test_commit_survives_root_sync_failure_after_pointer_update() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::relaxed();
        config.durability = crate::config::DurabilityMode::Strict;
        let engine = GraphEngine::create(dir.path(), config.clone()).unwrap();

        crate::storage::durable::fail_dir_sync(Some(dir.path()));
        let mut batch = engine.begin_batch().unwrap();
        batch.add_node(node("a", "FUNCTION", "a.js")).unwrap();
        let committed = batch.commit(&["a.js"], &[]);
        crate::storage::durable::fail_dir_sync(None);

        let delta = committed.unwrap();
        assert_eq!(delta.manifest_version, 2);
        assert_eq!(engine.version(), 2);
        assert_eq!(engine.stats().pointer_sync_failures, 1);
        assert!(engine.get_node(id_from_semantic("a")).is_some());
        drop(engine);

        let store = SegmentStore::disk(dir.path(), crate::config::DurabilityMode::Relaxed).unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
        let engine = GraphEngine::open(dir.path(), config).unwrap();
        assert_eq!(engine.version(), 2);
        assert!(engine.get_node(id_from_semantic("a")).is_some());
    }

    #[test]
    fn test_counts_by_type() {
        let engine = GraphEngine::create_ephemeral(EngineConfig::relaxed());
        let mut batch = engine.begin_batch().unwrap();
        for (sem, t) in [("m", "MODULE"), ("f", "FUNCTION"), ("g", "FUNCTION"), ("r", "http:route"), ("q", "http:request")] {
            batch.add_node(node(sem, t, "a.js")).unwrap();
        }
        for (src, dst, t) in [("m", "f", "CONTAINS"), ("m", "g", "CONTAINS"), ("f", "g", "CALLS")] {
            batch
                .add_edge(EdgeRecord::new(id_from_semantic(src), id_from_semantic(dst), t, "a.js"))
                .unwrap();
        }
        batch.commit(&["a.js"], &[]).unwrap();

        let all = engine.count_nodes_by_type(&[]);
        assert_eq!(all.len(), 4);
        assert_eq!(all["FUNCTION"], 2);

        let http = engine.count_nodes_by_type(&["http:*".to_string()]);
        assert_eq!(http.keys().collect::<Vec<_>>(), vec!["http:request", "http:route"]);

        let mixed = engine.count_nodes_by_type(&["MODULE".to_string(), "http:*".to_string(), "CLASS".to_string()]);
        assert_eq!(mixed.values().sum::<u64>(), 3);
        assert!(!mixed.contains_key("CLASS"));

        let edges = engine.count_edges_by_type(&[]);
        assert_eq!((edges["CONTAINS"], edges["CALLS"]), (2, 1));
        assert_eq!(engine.count_edges_by_type(&["CALLS".to_string()]).len(), 1);
        assert_eq!(engine.count_edges_by_type(&["CON*".to_string()])["CONTAINS"], 2);
    }

    #[test]
    fn test_tags_and_listing() {
        let engine = GraphEngine::create_ephemeral(EngineConfig::relaxed());
        commit_nodes(&engine, "a.js", &["a"]);
        let tagged = engine.tag_snapshot("baseline").unwrap();
        assert_eq!(tagged, 2);
        assert_eq!(engine.version(), 3);
        assert_eq!(engine.find_snapshot("baseline"), Some(2));

        engine.tag_version("genesis", 1).unwrap();
        let tagged: Vec<u64> = engine.list_snapshots(true).iter().map(|s| s.version).collect();
        assert_eq!(tagged, vec![2, 1]);
        assert_eq!(engine.list_snapshots(false).len(), 4);

        engine.untag_snapshot("genesis").unwrap();
        assert_eq!(engine.find_snapshot("genesis"), None);
        assert!(matches!(engine.untag_snapshot("genesis").unwrap_err(), GraphError::NotFound(_)));
        assert!(matches!(engine.tag_version("future", 99).unwrap_err(), GraphError::NotFound(_)));
        assert!(matches!(engine.tag_snapshot(" ").unwrap_err(), GraphError::Protocol(_)));
    }

    #[test]
    fn test_pins_are_refcounted() {
        let engine = GraphEngine::create_ephemeral(EngineConfig::relaxed());
        commit_nodes(&engine, "a.js", &["a"]);
        let p1 = engine.pin_current();
        let p2 = engine.pin_version(2).unwrap();
        assert_eq!(engine.pinned_versions(), vec![2]);
        drop(p1);
        assert_eq!(engine.pinned_versions(), vec![2]);
        assert_eq!(p2.node_count(), 1);
        drop(p2);
        assert!(engine.pinned_versions().is_empty());
        assert!(engine.pin_version(42).is_err());
        assert!(engine.pinned_versions().is_empty());
        assert!(matches!(engine.pin_snapshot("nope").unwrap_err(), GraphError::NotFound(_)));
    }

    #[test]
    fn test_reclaim_keeps_pinned_and_tagged_versions() {
        let engine = GraphEngine::create_ephemeral(EngineConfig::relaxed());
        commit_nodes(&engine, "a.js", &["a1"]); // v2
        engine.tag_snapshot("first").unwrap(); // v3
        commit_nodes(&engine, "a.js", &["a2"]); // v4
        let pin = engine.pin_current();
        commit_nodes(&engine, "a.js", &["a3"]); // v5
        commit_nodes(&engine, "a.js", &["a4"]); // v6
        engine.compact_all().unwrap(); // v7

        engine.reclaim().unwrap();
        assert_eq!(engine.diff_snapshots(2, 7).unwrap().added_nodes.len(), 1);
        assert_eq!(pin.query_nodes(&NodeQuery::new()).len(), 1);
        let err = engine.diff_snapshots(5, 7).unwrap_err();
        assert!(matches!(err, GraphError::NotFound(_)));

        drop(pin);
        let result = engine.reclaim().unwrap();
        assert!(result.segments_removed > 0);
        assert!(engine.diff_snapshots(4, 7).is_err());
    }

    #[test]
    fn test_compaction_is_invisible_to_readers() {
        let mut config = EngineConfig::relaxed();
        config.compaction.segment_threshold = 2;
        let engine = GraphEngine::create_ephemeral(config);
        for i in 0..3 {
            commit_nodes(&engine, "a.js", &[&format!("n{}", i), "stable"]);
        }
        assert!(engine.needs_compaction());
        let before = engine.version();
        let result = engine.compact().unwrap();
        assert_eq!(result.partitions_compacted, vec!["a.js".to_string()]);
        assert!(!engine.needs_compaction());
        assert!(engine.diff_snapshots(before, engine.version()).unwrap().is_empty());
        assert_eq!(engine.stats().node_segments, 1);
        assert_eq!(engine.stats().last_compaction.unwrap().manifest_version, engine.version());

        assert!(engine.compact().unwrap().is_noop());
    }
}
