//! Versioned manifests.
//!
//! A manifest is an immutable description of one database version: which
//! segments make up each partition's shard, which identities are excluded
//! by tombstones, plus tags and totals. Versions form a single-parent chain.
//!
//! On disk:
//!
//! ```text
//! <db>/
//! +-- current.json                 # {"version": N}
//! +-- manifests/
//! |   +-- manifest_00000001.json
//! |   +-- manifest_00000002.json
//! +-- segments/
//! ```
//!
//! Publishing writes the manifest file atomically, then atomically replaces
//! the pointer. A crash between the two leaves an unreferenced manifest
//! file, which is ignored and later overwritten.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::config::DurabilityMode;
use crate::error::{GraphError, Result};
use crate::storage::compaction::CompactionInfo;
use crate::storage::durable::{sweep_tmp_files, sync_dir, write_atomic};
use crate::storage::types::{EdgeKey, SegmentMeta, SegmentType};

pub const CURRENT_FILE: &str = "current.json";
pub const MANIFESTS_DIR: &str = "manifests";

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// u128 ids as fixed-width hex strings in JSON.
mod hex_id {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &u128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{:032x}", id))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(d)?;
        u128::from_str_radix(&raw, 16).map_err(serde::de::Error::custom)
    }
}

// ── Manifest contents ──────────────────────────────────────────────

/// Excludes every copy of `id` in segments older than `before_segment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTombstone {
    #[serde(with = "hex_id")]
    pub id: u128,
    pub before_segment: u64,
}

/// Excludes every copy of an edge key in segments older than `before_segment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeTombstone {
    #[serde(with = "hex_id")]
    pub src: u128,
    #[serde(with = "hex_id")]
    pub dst: u128,
    pub edge_type: String,
    pub before_segment: u64,
}

/// One partition's shard: segments oldest first, plus its exclusions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardEntry {
    pub node_segments: Vec<u64>,
    pub edge_segments: Vec<u64>,
    pub node_tombstones: Vec<NodeTombstone>,
    pub edge_tombstones: Vec<EdgeTombstone>,
}

impl ShardEntry {
    pub fn is_empty(&self) -> bool {
        self.node_segments.is_empty()
            && self.edge_segments.is_empty()
            && self.node_tombstones.is_empty()
            && self.edge_tombstones.is_empty()
    }

    /// Exclude `ids` below `before_segment`. An id that already has an
    /// entry keeps one entry with the raised watermark.
    pub fn add_node_tombstones(&mut self, ids: impl IntoIterator<Item = u128>, before_segment: u64) {
        let mut index: HashMap<u128, usize> = self
            .node_tombstones
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id, i))
            .collect();
        for id in ids {
            match index.get(&id) {
                Some(&i) => {
                    let t = &mut self.node_tombstones[i];
                    t.before_segment = t.before_segment.max(before_segment);
                }
                None => {
                    index.insert(id, self.node_tombstones.len());
                    self.node_tombstones.push(NodeTombstone { id, before_segment });
                }
            }
        }
    }

    /// Edge counterpart of [`add_node_tombstones`](Self::add_node_tombstones).
    pub fn add_edge_tombstones<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a EdgeKey>,
        before_segment: u64,
    ) {
        let mut index: HashMap<EdgeKey, usize> = self
            .edge_tombstones
            .iter()
            .enumerate()
            .map(|(i, t)| ((t.src, t.dst, t.edge_type.clone()), i))
            .collect();
        for key in keys {
            match index.get(key) {
                Some(&i) => {
                    let t = &mut self.edge_tombstones[i];
                    t.before_segment = t.before_segment.max(before_segment);
                }
                None => {
                    index.insert(key.clone(), self.edge_tombstones.len());
                    self.edge_tombstones.push(EdgeTombstone {
                        src: key.0,
                        dst: key.1,
                        edge_type: key.2.clone(),
                        before_segment,
                    });
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub segment_id: u64,
    pub segment_type: SegmentType,
    pub partition: String,
    pub record_count: u64,
    pub byte_size: u64,
    #[serde(default)]
    pub node_types: BTreeSet<String>,
    #[serde(default)]
    pub edge_types: BTreeSet<String>,
}

impl SegmentDescriptor {
    pub fn from_meta(segment_id: u64, partition: &str, meta: SegmentMeta) -> Self {
        Self {
            segment_id,
            segment_type: meta.segment_type,
            partition: partition.to_string(),
            record_count: meta.record_count,
            byte_size: meta.byte_size,
            node_types: meta.node_types,
            edge_types: meta.edge_types,
        }
    }
}

/// Visible record totals of a version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestStats {
    pub total_nodes: u64,
    pub total_edges: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u64,
    pub parent_version: Option<u64>,
    pub created_at_ms: u64,
    pub next_segment_id: u64,
    #[serde(default)]
    pub shards: BTreeMap<String, ShardEntry>,
    #[serde(default)]
    pub segments: BTreeMap<u64, SegmentDescriptor>,
    #[serde(default)]
    pub tags: BTreeMap<String, u64>,
    #[serde(default)]
    pub stats: ManifestStats,
    #[serde(default)]
    pub last_compaction: Option<CompactionInfo>,
}

impl Manifest {
    /// Version 1 of a fresh database.
    pub fn initial() -> Self {
        Self {
            version: 1,
            parent_version: None,
            created_at_ms: now_ms(),
            next_segment_id: 1,
            shards: BTreeMap::new(),
            segments: BTreeMap::new(),
            tags: BTreeMap::new(),
            stats: ManifestStats::default(),
            last_compaction: None,
        }
    }

    /// Draft of the next version, to be filled in and published.
    pub fn successor(&self) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.parent_version = Some(self.version);
        next.created_at_ms = now_ms();
        next
    }

    pub fn allocate_segment_id(&mut self) -> u64 {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        id
    }

    /// Record a freshly written segment in `partition`'s shard.
    pub fn add_segment(&mut self, descriptor: SegmentDescriptor) {
        let shard = self.shards.entry(descriptor.partition.clone()).or_default();
        match descriptor.segment_type {
            SegmentType::Nodes => shard.node_segments.push(descriptor.segment_id),
            SegmentType::Edges => shard.edge_segments.push(descriptor.segment_id),
        }
        self.segments.insert(descriptor.segment_id, descriptor);
    }

    /// Drop segment ids (and their descriptors) from `partition`'s shard.
    pub fn remove_segments(&mut self, partition: &str, ids: &BTreeSet<u64>) {
        if let Some(shard) = self.shards.get_mut(partition) {
            shard.node_segments.retain(|id| !ids.contains(id));
            shard.edge_segments.retain(|id| !ids.contains(id));
        }
        for id in ids {
            self.segments.remove(id);
        }
    }

    /// Remove shard entries that no longer hold anything.
    pub fn prune_empty_shards(&mut self) {
        self.shards.retain(|_, shard| !shard.is_empty());
    }

    pub fn referenced_segments(&self) -> BTreeSet<(u64, SegmentType)> {
        self.segments
            .values()
            .map(|d| (d.segment_id, d.segment_type))
            .collect()
    }

    pub fn node_segment_count(&self) -> usize {
        self.shards.values().map(|s| s.node_segments.len()).sum()
    }

    pub fn edge_segment_count(&self) -> usize {
        self.shards.values().map(|s| s.edge_segments.len()).sum()
    }

    /// Structural checks run on every load.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(GraphError::Integrity(format!("manifest v{}: {}", self.version, msg)));

        if self.version == 0 {
            return bad("version 0".into());
        }
        if let Some(parent) = self.parent_version {
            if parent >= self.version {
                return bad(format!("parent {} is not older", parent));
            }
        }
        let mut listed = 0usize;
        for (partition, shard) in &self.shards {
            for (ids, kind) in [
                (&shard.node_segments, SegmentType::Nodes),
                (&shard.edge_segments, SegmentType::Edges),
            ] {
                if ids.windows(2).any(|w| w[0] >= w[1]) {
                    return bad(format!("segments of {} not ascending", partition));
                }
                for id in ids {
                    listed += 1;
                    match self.segments.get(id) {
                        Some(d) if d.segment_type == kind && &d.partition == partition => {}
                        Some(_) => return bad(format!("descriptor mismatch for segment {}", id)),
                        None => return bad(format!("segment {} has no descriptor", id)),
                    }
                    if *id >= self.next_segment_id {
                        return bad(format!("segment {} beyond next_segment_id", id));
                    }
                }
            }
        }
        if listed != self.segments.len() {
            return bad("unreferenced segment descriptors".into());
        }
        if let Some((name, v)) = self.tags.iter().find(|(_, v)| **v > self.version) {
            return bad(format!("tag {} points at future version {}", name, v));
        }
        Ok(())
    }

    fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    fn from_json(bytes: &[u8], origin: &str) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)
            .map_err(|e| GraphError::Integrity(format!("{}: {}", origin, e)))?;
        manifest.validate()?;
        Ok(manifest)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CurrentPointer {
    version: u64,
}

// ── ManifestStore ──────────────────────────────────────────────────

#[derive(Debug)]
enum Backend {
    Disk {
        root: PathBuf,
        durability: DurabilityMode,
    },
    Memory(Mutex<BTreeMap<u64, Arc<Manifest>>>),
}

/// Loads, caches and publishes manifests.
///
/// Publication is serialized by the engine's writer lock; this type only
/// guards its own cache and current pointer.
#[derive(Debug)]
pub struct ManifestStore {
    backend: Backend,
    current: RwLock<Arc<Manifest>>,
    cache: Mutex<HashMap<u64, Arc<Manifest>>>,
    pointer_sync_failures: AtomicU64,
}

fn manifest_path(root: &Path, version: u64) -> PathBuf {
    root.join(MANIFESTS_DIR).join(format!("manifest_{:08}.json", version))
}

fn poisoned() -> GraphError {
    GraphError::Integrity("manifest store lock poisoned".into())
}

impl ManifestStore {
    /// Initialize a new database directory with version 1.
    pub fn create(root: &Path, durability: DurabilityMode) -> Result<Self> {
        if root.join(CURRENT_FILE).exists() {
            return Err(GraphError::Conflict(format!(
                "database already exists at {}",
                root.display()
            )));
        }
        fs::create_dir_all(root.join(MANIFESTS_DIR))?;
        let store = Self {
            backend: Backend::Disk {
                root: root.to_path_buf(),
                durability,
            },
            current: RwLock::new(Arc::new(Manifest::initial())),
            cache: Mutex::new(HashMap::new()),
            pointer_sync_failures: AtomicU64::new(0),
        };
        let initial = store.current();
        store.persist(&initial)?;
        Ok(store)
    }

    /// Open an existing database at the version named by the pointer file.
    pub fn open(root: &Path, durability: DurabilityMode) -> Result<Self> {
        let pointer_path = root.join(CURRENT_FILE);
        let raw = match fs::read(&pointer_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GraphError::NotFound(format!("no database at {}", root.display())));
            }
            Err(e) => return Err(e.into()),
        };
        let pointer: CurrentPointer = serde_json::from_slice(&raw)
            .map_err(|e| GraphError::Integrity(format!("{}: {}", CURRENT_FILE, e)))?;

        sweep_tmp_files(root)?;
        sweep_tmp_files(&root.join(MANIFESTS_DIR))?;

        let path = manifest_path(root, pointer.version);
        let bytes = fs::read(&path).map_err(|e| {
            GraphError::Integrity(format!(
                "current manifest {} unreadable: {}",
                path.display(),
                e
            ))
        })?;
        let manifest = Manifest::from_json(&bytes, &path.display().to_string())?;
        if manifest.version != pointer.version {
            return Err(GraphError::Integrity(format!(
                "pointer names v{} but file holds v{}",
                pointer.version, manifest.version
            )));
        }
        tracing::debug!(version = manifest.version, "opened manifest");

        Ok(Self {
            backend: Backend::Disk {
                root: root.to_path_buf(),
                durability,
            },
            current: RwLock::new(Arc::new(manifest)),
            cache: Mutex::new(HashMap::new()),
            pointer_sync_failures: AtomicU64::new(0),
        })
    }

    /// In-memory store for ephemeral engines.
    pub fn memory() -> Self {
        let initial = Arc::new(Manifest::initial());
        let mut versions = BTreeMap::new();
        versions.insert(initial.version, initial.clone());
        Self {
            backend: Backend::Memory(Mutex::new(versions)),
            current: RwLock::new(initial),
            cache: Mutex::new(HashMap::new()),
            pointer_sync_failures: AtomicU64::new(0),
        }
    }

    /// Publications whose pointer rename may not have reached stable
    /// storage.
    pub fn pointer_sync_failures(&self) -> u64 {
        self.pointer_sync_failures.load(Ordering::Relaxed)
    }

    pub fn current(&self) -> Arc<Manifest> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Load any published version.
    pub fn load(&self, version: u64) -> Result<Arc<Manifest>> {
        let current = self.current();
        if version == current.version {
            return Ok(current);
        }
        if version > current.version || version == 0 {
            return Err(GraphError::NotFound(format!("manifest version {}", version)));
        }
        if let Some(m) = self.cache.lock().map_err(|_| poisoned())?.get(&version) {
            return Ok(m.clone());
        }

        let manifest = match &self.backend {
            Backend::Memory(map) => map
                .lock()
                .map_err(|_| poisoned())?
                .get(&version)
                .cloned()
                .ok_or_else(|| GraphError::NotFound(format!("manifest version {}", version)))?,
            Backend::Disk { root, .. } => {
                let path = manifest_path(root, version);
                let bytes = match fs::read(&path) {
                    Ok(b) => b,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(GraphError::NotFound(format!("manifest version {}", version)));
                    }
                    Err(e) => return Err(e.into()),
                };
                Arc::new(Manifest::from_json(&bytes, &path.display().to_string())?)
            }
        };
        self.cache
            .lock()
            .map_err(|_| poisoned())?
            .insert(version, manifest.clone());
        Ok(manifest)
    }

    /// Publish the direct successor of the current version.
    pub fn publish(&self, manifest: Manifest) -> Result<Arc<Manifest>> {
        let current = self.current();
        if manifest.version != current.version + 1 || manifest.parent_version != Some(current.version) {
            return Err(GraphError::Conflict(format!(
                "manifest v{} (parent {:?}) is not the successor of v{}",
                manifest.version, manifest.parent_version, current.version
            )));
        }
        manifest.validate()?;
        let manifest = Arc::new(manifest);
        self.persist(&manifest)?;

        self.cache
            .lock()
            .map_err(|_| poisoned())?
            .insert(current.version, current);
        *self.current.write().map_err(|_| poisoned())? = manifest.clone();
        Ok(manifest)
    }

    /// Manifest file first, pointer second.
    fn persist(&self, manifest: &Arc<Manifest>) -> Result<()> {
        match &self.backend {
            Backend::Disk { root, durability } => {
                let path = manifest_path(root, manifest.version);
                write_atomic(&path, &manifest.to_json()?, *durability)?;
                sync_dir(&root.join(MANIFESTS_DIR), *durability)?;

                let pointer = serde_json::to_vec(&CurrentPointer {
                    version: manifest.version,
                })?;
                write_atomic(&root.join(CURRENT_FILE), &pointer, *durability)?;
                // Once the pointer is renamed the version is published: a
                // reopen reads it, so the caller must not roll it back.
                if let Err(e) = sync_dir(root, *durability) {
                    self.pointer_sync_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        version = manifest.version,
                        error = %e,
                        "database directory sync failed after pointer update"
                    );
                }
                Ok(())
            }
            Backend::Memory(map) => {
                map.lock()
                    .map_err(|_| poisoned())?
                    .insert(manifest.version, manifest.clone());
                Ok(())
            }
        }
    }

    /// Current version and its ancestors, newest first. Stops at the first
    /// ancestor that cannot be loaded.
    pub fn chain(&self) -> Vec<Arc<Manifest>> {
        let mut out = vec![self.current()];
        while let Some(parent) = out.last().and_then(|m| m.parent_version) {
            match self.load(parent) {
                Ok(m) => out.push(m),
                Err(e) => {
                    tracing::warn!(version = parent, error = %e, "manifest chain truncated");
                    break;
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor(id: u64, partition: &str, kind: SegmentType) -> SegmentDescriptor {
        SegmentDescriptor {
            segment_id: id,
            segment_type: kind,
            partition: partition.into(),
            record_count: 1,
            byte_size: 100,
            node_types: BTreeSet::new(),
            edge_types: BTreeSet::new(),
        }
    }

    fn next_with_segment(store: &ManifestStore, partition: &str) -> Manifest {
        let mut m = store.current().successor();
        let id = m.allocate_segment_id();
        m.add_segment(descriptor(id, partition, SegmentType::Nodes));
        m
    }

    #[test]
    fn test_create_then_open() {
        let dir = TempDir::new().unwrap();
        {
            let store = ManifestStore::create(dir.path(), DurabilityMode::Strict).unwrap();
            assert_eq!(store.current().version, 1);
            store.publish(next_with_segment(&store, "x")).unwrap();
        }
        let store = ManifestStore::open(dir.path(), DurabilityMode::Strict).unwrap();
        let m = store.current();
        assert_eq!(m.version, 2);
        assert_eq!(m.parent_version, Some(1));
        assert_eq!(m.shards["x"].node_segments, vec![1]);
        assert_eq!(store.load(1).unwrap().shards.len(), 0);
    }

    #[test]
    fn test_root_sync_failure_after_pointer_rename_still_publishes() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::create(dir.path(), DurabilityMode::Strict).unwrap();

        crate::storage::durable::fail_dir_sync(Some(dir.path()));
        let published = store.publish(next_with_segment(&store, "x"));
        crate::storage::durable::fail_dir_sync(None);

        assert_eq!(published.unwrap().version, 2);
        assert_eq!(store.current().version, 2);
        assert_eq!(store.pointer_sync_failures(), 1);

        let reopened = ManifestStore::open(dir.path(), DurabilityMode::Strict).unwrap();
        assert_eq!(reopened.current().version, 2);
        assert_eq!(reopened.current().shards["x"].node_segments, vec![1]);
    }

    #[test]
    fn test_manifest_dir_sync_failure_aborts_publish() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::create(dir.path(), DurabilityMode::Strict).unwrap();

        crate::storage::durable::fail_dir_sync(Some(&dir.path().join(MANIFESTS_DIR)));
        let published = store.publish(next_with_segment(&store, "x"));
        crate::storage::durable::fail_dir_sync(None);

        assert!(published.is_err());
        assert_eq!(store.current().version, 1);
        assert_eq!(store.pointer_sync_failures(), 0);
        let reopened = ManifestStore::open(dir.path(), DurabilityMode::Strict).unwrap();
        assert_eq!(reopened.current().version, 1);
    }

    #[test]
    fn test_create_refuses_existing() {
        let dir = TempDir::new().unwrap();
        ManifestStore::create(dir.path(), DurabilityMode::Relaxed).unwrap();
        let err = ManifestStore::create(dir.path(), DurabilityMode::Relaxed).unwrap_err();
        assert!(matches!(err, GraphError::Conflict(_)));
    }

    #[test]
    fn test_open_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = ManifestStore::open(dir.path(), DurabilityMode::Relaxed).unwrap_err();
        assert!(matches!(err, GraphError::NotFound(_)));
    }

    #[test]
    fn test_publish_rejects_non_successor() {
        let store = ManifestStore::memory();
        let draft = store.current().successor();
        store.publish(draft.clone()).unwrap();
        let err = store.publish(draft).unwrap_err();
        assert!(matches!(err, GraphError::Conflict(_)));
    }

    #[test]
    fn test_corrupt_pointer_is_integrity() {
        let dir = TempDir::new().unwrap();
        ManifestStore::create(dir.path(), DurabilityMode::Relaxed).unwrap();
        fs::write(dir.path().join(CURRENT_FILE), b"{\"vers").unwrap();
        let err = ManifestStore::open(dir.path(), DurabilityMode::Relaxed).unwrap_err();
        assert!(matches!(err, GraphError::Integrity(_)));
    }

    #[test]
    fn test_corrupt_manifest_is_integrity() {
        let dir = TempDir::new().unwrap();
        ManifestStore::create(dir.path(), DurabilityMode::Relaxed).unwrap();
        fs::write(manifest_path(dir.path(), 1), b"[]").unwrap();
        let err = ManifestStore::open(dir.path(), DurabilityMode::Relaxed).unwrap_err();
        assert_eq!(err.code(), "INTEGRITY_ERROR");
    }

    #[test]
    fn test_unpublished_newer_manifest_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::create(dir.path(), DurabilityMode::Relaxed).unwrap();
        // crash after manifest write, before pointer swap
        let orphan = next_with_segment(&store, "x");
        fs::write(manifest_path(dir.path(), 2), orphan.to_json().unwrap()).unwrap();
        drop(store);

        let store = ManifestStore::open(dir.path(), DurabilityMode::Relaxed).unwrap();
        assert_eq!(store.current().version, 1);
        assert!(store.load(2).is_err());
        store.publish(store.current().successor()).unwrap();
        assert!(store.current().shards.is_empty());
    }

    #[test]
    fn test_validate_catches_dangling_segment() {
        let mut m = Manifest::initial().successor();
        m.shards.entry("x".into()).or_default().node_segments.push(5);
        m.next_segment_id = 6;
        let err = m.validate().unwrap_err();
        assert!(err.to_string().contains("no descriptor"));
    }

    #[test]
    fn test_validate_catches_future_tag() {
        let mut m = Manifest::initial();
        m.tags.insert("release".into(), 9);
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_tombstone_ids_are_hex_in_json() {
        let mut m = Manifest::initial().successor();
        m.shards.entry("x".into()).or_default().node_tombstones.push(NodeTombstone {
            id: u128::MAX,
            before_segment: 3,
        });
        m.next_segment_id = 3;
        let json = String::from_utf8(m.to_json().unwrap()).unwrap();
        assert!(json.contains(&"f".repeat(32)));
        let back = Manifest::from_json(json.as_bytes(), "test").unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_tombstones_keep_one_entry_per_identity() {
        let mut entry = ShardEntry::default();
        entry.add_node_tombstones([7, 8], 3);
        entry.add_node_tombstones([7], 5);
        assert_eq!(entry.node_tombstones.len(), 2);
        assert_eq!(entry.node_tombstones[0].before_segment, 5);

        let key: EdgeKey = (1, 2, "CALLS".into());
        entry.add_edge_tombstones([&key], 4);
        entry.add_edge_tombstones([&key], 6);
        assert_eq!(entry.edge_tombstones.len(), 1);
        assert_eq!(entry.edge_tombstones[0].before_segment, 6);
    }

    #[test]
    fn test_chain_walks_parents() {
        let store = ManifestStore::memory();
        for _ in 0..3 {
            store.publish(store.current().successor()).unwrap();
        }
        let versions: Vec<u64> = store.chain().iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![4, 3, 2, 1]);
    }
}
